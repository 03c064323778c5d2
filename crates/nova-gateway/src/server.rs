use std::net::SocketAddr;
use std::sync::Arc;

use nova_agents::TurnPipeline;
use nova_common::{Error, Result};
use nova_config::AppConfig;
use tokio::net::TcpListener;
use tracing::info;

use crate::router::build_router;
use crate::state::AppState;

/// Binds the configured address and serves the router until Ctrl-C.
pub struct GatewayServer {
    config: AppConfig,
    pipeline: Arc<TurnPipeline>,
}

impl GatewayServer {
    pub fn new(config: AppConfig, pipeline: Arc<TurnPipeline>) -> Self {
        Self { config, pipeline }
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.config.gateway.host, self.config.gateway.port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid gateway address: {e}")))
    }

    pub async fn run(self) -> Result<()> {
        let addr = self.addr()?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        let state = Arc::new(AppState::new(self.config, self.pipeline));
        let app = build_router(state);

        info!("gateway listening on http://{addr}");
        info!("lifecycle feed: ws://{addr}/ws");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("gateway stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => {
            tracing::warn!("could not install Ctrl-C handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
