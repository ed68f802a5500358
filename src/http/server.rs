//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::{middleware, Router};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::admission::{admission_middleware, AdmissionGate};
use super::health::health;
use crate::error::{GatekeeperError, Result};

/// Put every route of `router` behind the admission gate.
pub fn protect(router: Router, gate: Arc<AdmissionGate>) -> Router {
    router.layer(middleware::from_fn_with_state(gate, admission_middleware))
}

/// The service's routes, all behind the admission gate.
pub fn router(gate: Arc<AdmissionGate>) -> Router {
    protect(Router::new().route("/health", get(health)), gate)
}

/// HTTP server fronting the downstream routes with the admission gate.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    router: Router,
}

impl HttpServer {
    /// Create a server exposing the default routes.
    pub fn new(addr: SocketAddr, gate: Arc<AdmissionGate>) -> Self {
        Self {
            addr,
            router: router(gate),
        }
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            GatekeeperError::Io(e)
        })?;

        info!(addr = %self.addr, "Starting HTTP server");

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            GatekeeperError::Io(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenPolicies;
    use crate::ratelimit::{InMemoryEventStore, RateLimiter};
    use std::time::Duration;

    fn gate() -> Arc<AdmissionGate> {
        let store = Arc::new(InMemoryEventStore::new());
        let token = Arc::new(RateLimiter::new(store.clone(), "token", 0, Duration::ZERO));
        let ip = Arc::new(RateLimiter::new(store, "ip", 10, Duration::from_secs(1)));
        Arc::new(AdmissionGate::new(token, ip, Arc::new(TokenPolicies::default())))
    }

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let _server = HttpServer::new(addr, gate());
    }

    #[tokio::test]
    async fn test_serve_stops_on_signal() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = HttpServer::new(addr, gate());

        let result = server.serve_with_shutdown(async {}).await;
        assert!(result.is_ok());
    }
}
