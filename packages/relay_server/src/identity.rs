//! Identity resolution for new connections.

use relay_protocol::UpgradeRequest;

/// Decides the user id a connection is registered under.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, request: &UpgradeRequest) -> String;
}

/// Uses the id claimed in the request target, or generates one.
///
/// The claim is the second `=`-separated segment of the target, taken
/// verbatim (`/?user=alice` → `alice`). Empty claims and the literal `null`
/// fall back to `<prefix><8 hex chars>`.
#[derive(Clone, Debug)]
pub struct QueryStringIdentity {
    prefix: String,
}

impl QueryStringIdentity {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn claimed(target: &str) -> Option<&str> {
        target
            .split('=')
            .nth(1)
            .filter(|claim| !claim.is_empty() && *claim != "null")
    }

    pub fn generate(&self) -> String {
        let bytes: [u8; 4] = rand::random();
        let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        format!("{}{}", self.prefix, hex)
    }
}

impl Default for QueryStringIdentity {
    fn default() -> Self {
        Self::new("u_")
    }
}

impl IdentityResolver for QueryStringIdentity {
    fn resolve(&self, request: &UpgradeRequest) -> String {
        match Self::claimed(&request.target) {
            Some(claim) => claim.to_string(),
            None => self.generate(),
        }
    }
}
