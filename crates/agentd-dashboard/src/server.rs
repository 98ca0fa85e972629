//! Dashboard server startup

use std::net::SocketAddr;

use axum::Router;
use tracing::info;

use agentd_core::DashboardConfig;

use crate::api::{create_router, DashboardState};
use crate::error::{DashboardError, Result};

/// Dashboard HTTP/WebSocket server
pub struct DashboardServer {
    config: DashboardConfig,
    state: DashboardState,
}

impl DashboardServer {
    pub fn new(config: DashboardConfig, state: DashboardState) -> Self {
        Self { config, state }
    }

    /// Get the router (useful for embedding or tests)
    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| DashboardError::Config(format!("invalid address: {}", e)))
    }

    /// Bind and serve until the task is aborted
    pub async fn run(self) -> Result<()> {
        let addr = self.socket_addr()?;
        let app = self.router();

        info!("dashboard listening on http://{}", addr);
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| DashboardError::Server(format!("failed to bind: {}", e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| DashboardError::Server(format!("server error: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tests::state;

    #[test]
    fn test_socket_addr() {
        let server = DashboardServer::new(
            DashboardConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            state(),
        );
        assert_eq!(server.socket_addr().unwrap().port(), 8080);

        let bad = DashboardServer::new(
            DashboardConfig {
                host: "not a host".to_string(),
                port: 8080,
            },
            state(),
        );
        assert!(bad.socket_addr().is_err());
    }
}
