//! TCP accept loop.

use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{Instrument, info, info_span, warn};

use crate::config::ServerConfig;
use crate::connection::{RelayContext, serve_connection};
use crate::registry::Registry;

pub struct RelayServer {
    listener: TcpListener,
    ctx: Arc<RelayContext>,
}

impl RelayServer {
    /// Bind the listener and create a fresh registry scoped to this server.
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        let ctx = RelayContext::new(config, Arc::new(Registry::new()));
        Ok(Self::from_parts(listener, ctx))
    }

    pub fn from_parts(listener: TcpListener, ctx: RelayContext) -> Self {
        Self {
            listener,
            ctx: Arc::new(ctx),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.ctx.registry.clone()
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Each connection runs on its own task; its failure is logged and never
    /// stops the loop.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let ctx = self.ctx.clone();
                        tokio::spawn(
                            async move {
                                if let Err(e) = serve_connection(stream, ctx).await {
                                    warn!(error = %e, "connection failed");
                                }
                            }
                            .instrument(info_span!("connection", %peer)),
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                },
            }
        }

        Ok(())
    }
}
