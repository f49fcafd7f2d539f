//! Chat relay server.
//!
//! Peers upgrade a plain HTTP request into a framed stream, log in, and have
//! their chat lines fanned out to every other connected peer.
//!
//! # Example
//!
//! ```no_run
//! use relay_server::{RelayServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServerConfig::default().with_overrides(None, Some(4000));
//!     let server = RelayServer::bind(&config).await?;
//!     server
//!         .run_until(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await
//! }
//! ```

pub mod config;
pub mod connection;
pub mod identity;
pub mod registry;
pub mod router;
pub mod server;

pub use config::{FileConfig, ServerConfig, load_config};
pub use connection::{ConnectionState, RelayContext, serve_connection};
pub use identity::{IdentityResolver, QueryStringIdentity};
pub use registry::{BroadcastReport, ConnectionHandle, ConnectionId, DeliveryError, Registry};
pub use router::{MessageRouter, RouteOutcome};
pub use server::RelayServer;
