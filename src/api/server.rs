//! API Server

use super::{
    handlers::AppState,
    middleware::{create_cors_layer, propagate_request_id_layer, set_request_id_layer},
    routes::create_router,
};
use crate::{config::ApiConfig, errors::ConfigurationError, orchestrator::GameHandle};
use std::{future::Future, net::SocketAddr, sync::Arc};
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub struct ApiServer {
    config: ApiConfig,
    game: GameHandle,
}

impl ApiServer {
    pub fn new(config: ApiConfig, game: GameHandle) -> Self {
        Self { config, game }
    }

    /// Serve until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.socket_addr()?;
        let app = self.create_app();

        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, origins = ?self.config.allowed_origins, "API server listening");
        info!("   GET  /health                  - Engine status");
        info!("   GET  /round                   - Current round");
        info!("   POST /rounds/:id/bets         - Place a bet");
        info!("   POST /rounds/:id/cashout      - Cash out");
        info!("   GET  /players/:id             - Player balance");
        info!("   GET  /results?limit=          - Recent crash points");
        info!("   GET  /ws                      - Live round events");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("API server stopped");
        Ok(())
    }

    /// Router with the middleware stack applied
    pub fn create_app(&self) -> axum::Router {
        let state = Arc::new(AppState::new(self.game.clone()));

        create_router(state)
            .layer(propagate_request_id_layer())
            .layer(create_cors_layer(self.config.allowed_origins.clone()))
            .layer(TraceLayer::new_for_http())
            // Outermost, so the trace span and the echo both see the id
            .layer(set_request_id_layer())
    }

    fn socket_addr(&self) -> Result<SocketAddr, ConfigurationError> {
        let ip = self.config.host.parse::<std::net::IpAddr>().map_err(|e| {
            ConfigurationError::InvalidValue {
                field: "api.host".to_string(),
                value: self.config.host.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(SocketAddr::from((ip, self.config.port)))
    }
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received terminate signal"),
    }
}
