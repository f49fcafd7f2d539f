use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use relay_server::{FileConfig, RelayServer, ServerConfig, load_config};

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Real-time chat relay over upgraded, framed TCP streams")]
struct Args {
    /// Directory holding relay.toml
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    let filter = if args.debug {
        EnvFilter::new("relay_server=debug,relay_protocol=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("relay_server=info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let file_config: FileConfig = load_config(args.config_dir.as_deref())
        .extract()
        .context("Failed to load configuration")?;
    let config = ServerConfig::from_file(&file_config).with_overrides(args.host, args.port);

    let server = RelayServer::bind(&config).await?;
    info!("Relay listening on ws://{}", server.local_addr()?);

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
}
