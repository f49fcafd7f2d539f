use serde::{Deserialize, Serialize};
use std::path::Path;

// =============================================================================
// File config (figment-deserialized from defaults / relay.toml / env vars)
// =============================================================================
//
//   relay.toml:      [server]
//                    port = 4000
//
//   env var:         RELAY_SERVER__PORT=4000   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub identity: IdentityFileConfig,
}

/// Listener and per-connection knobs (lives under `[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upper bound on the upgrade request head, in bytes.
    #[serde(default = "default_max_request_head_bytes")]
    pub max_request_head_bytes: usize,
    /// Outbound frames queued per connection before delivery to it fails.
    #[serde(default = "default_send_channel_capacity")]
    pub send_channel_capacity: usize,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_request_head_bytes: default_max_request_head_bytes(),
            send_channel_capacity: default_send_channel_capacity(),
        }
    }
}

/// Identity assignment (lives under `[identity]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentityFileConfig {
    /// Prefix for generated user ids.
    #[serde(default = "default_identity_prefix")]
    pub prefix: String,
}

impl Default for IdentityFileConfig {
    fn default() -> Self {
        Self {
            prefix: default_identity_prefix(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    4000
}
fn default_max_request_head_bytes() -> usize {
    8 * 1024
}
fn default_send_channel_capacity() -> usize {
    64
}
fn default_identity_prefix() -> String {
    "u_".to_string()
}

/// Build a figment that layers: defaults → relay.toml → RELAY_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `RELAY_SERVER__HOST=0.0.0.0`  →  `server.host = "0.0.0.0"`
///   `RELAY_IDENTITY__PREFIX=guest_`  →  `identity.prefix = "guest_"`
pub fn load_config(config_dir: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    if let Some(dir) = config_dir {
        figment = figment.merge(Toml::file(dir.join("relay.toml")));
    }
    figment.merge(Env::prefixed("RELAY_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig, CLI flags win)
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_request_head_bytes: usize,
    pub send_channel_capacity: usize,
    pub identity_prefix: String,
}

impl ServerConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            host: fc.server.host.clone(),
            port: fc.server.port,
            max_request_head_bytes: fc.server.max_request_head_bytes,
            // A zero-capacity mpsc channel panics on creation.
            send_channel_capacity: fc.server.send_channel_capacity.max(1),
            identity_prefix: fc.identity.prefix.clone(),
        }
    }

    /// Apply `--host` / `--port` from the command line.
    pub fn with_overrides(mut self, host: Option<String>, port: Option<u16>) -> Self {
        if let Some(host) = host {
            self.host = host;
        }
        if let Some(port) = port {
            self.port = port;
        }
        self
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}
