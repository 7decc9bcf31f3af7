//! HTTP server implementation.

use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{Result, TollgateError};

/// HTTP server hosting the rate limited router.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The application router
    router: Router,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, router: Router) -> Self {
        Self { addr, router }
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server stops accepting connections when `signal` resolves and
    /// returns once in-flight requests have completed.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            TollgateError::Io(e)
        })?;

        info!(
            addr = %listener.local_addr()?,
            "Starting HTTP server with graceful shutdown"
        );

        axum::serve(listener, self.router)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                TollgateError::Io(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_stops_on_signal() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = HttpServer::new(addr, Router::new());

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            server.serve_with_shutdown(async {}),
        )
        .await
        .expect("server should shut down");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = HttpServer::new(taken.local_addr().unwrap(), Router::new());

        let result = server.serve_with_shutdown(async {}).await;
        assert!(matches!(result, Err(TollgateError::Io(_))));
    }
}
