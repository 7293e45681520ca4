//! HTTP server host: bind, serve until cancelled, then drain.

use std::net::SocketAddr;

use anyhow::{Result, anyhow};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{AppState, router};

/// Host configuration for one API server instance.
#[derive(Clone)]
pub struct ApiServer {
    bind_address: SocketAddr,
    state: AppState,
}

impl ApiServer {
    pub fn new(bind_address: SocketAddr, state: AppState) -> Self {
        Self { bind_address, state }
    }

    /// Binds the listener and starts serving in a background task.
    pub async fn start(self) -> Result<RunningApiServer> {
        let cancellation_token = CancellationToken::new();
        let listener = tokio::net::TcpListener::bind(self.bind_address)
            .await
            .map_err(|error| anyhow!("failed to bind {}: {error}", self.bind_address))?;
        let bound_address = listener.local_addr()?;
        let app = router(self.state);

        let server_handle = tokio::spawn({
            let shutdown = cancellation_token.child_token();
            async move {
                let served = axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        shutdown.cancelled().await;
                    })
                    .await;
                if let Err(serve_error) = served {
                    error!(error = %serve_error, "API server stopped with an error");
                }
            }
        });

        info!(address = %bound_address, "API server listening");
        Ok(RunningApiServer {
            bind_address: bound_address,
            cancellation_token,
            server_handle,
        })
    }
}

/// Runtime handle for a running API server.
#[derive(Debug)]
pub struct RunningApiServer {
    bind_address: SocketAddr,
    cancellation_token: CancellationToken,
    server_handle: JoinHandle<()>,
}

impl RunningApiServer {
    pub fn bound_address(&self) -> SocketAddr {
        self.bind_address
    }

    /// Stops accepting connections and waits for in-flight requests to finish.
    pub async fn stop(self) -> Result<()> {
        self.cancellation_token.cancel();
        self.server_handle
            .await
            .map_err(|error| anyhow!("API server task failed: {error}"))?;
        info!(address = %self.bind_address, "API server stopped");
        Ok(())
    }
}

/// Parses the configured bind address.
pub fn resolve_bind_address(bind_address: &str) -> Result<SocketAddr> {
    bind_address
        .trim()
        .parse()
        .map_err(|error| anyhow!("invalid bind address '{bind_address}': {error}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_address_must_be_socket_address() {
        assert_eq!(
            resolve_bind_address(" 127.0.0.1:8080 ").expect("valid"),
            SocketAddr::from(([127, 0, 0, 1], 8080))
        );
        assert!(resolve_bind_address("localhost").is_err());
    }
}
