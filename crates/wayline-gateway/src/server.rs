use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use wayline_core::config::GatewayConfig;
use wayline_engine::ExecutionEngine;

use crate::routes;
use crate::state::AppState;

/// HTTP control API built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    engine: Arc<ExecutionEngine>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, engine: Arc<ExecutionEngine>) -> Self {
        Self { config, engine }
    }

    /// The API routes, without binding a listener.
    pub fn router(&self) -> Router {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            engine: self.engine.clone(),
        });

        Router::new()
            .route("/api/health", get(routes::health))
            .route(
                "/definitions",
                get(routes::list_definitions).post(routes::register_definition),
            )
            .route("/tools", get(routes::list_tools))
            .route(
                "/executions",
                get(routes::list_executions).post(routes::start_execution),
            )
            .route("/executions/{id}", get(routes::get_execution))
            .route("/executions/{id}/checkpoints", get(routes::list_checkpoints))
            .route("/executions/{id}/approvals", get(routes::pending_approvals))
            .route("/executions/{id}/resume", post(routes::resume_execution))
            .route("/executions/{id}/cancel", post(routes::cancel_execution))
            .route("/executions/{id}/replay", post(routes::replay_execution))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Run the gateway and the approval sweeper until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let sweeper = tokio::spawn(sweep_approvals(self.engine.clone(), shutdown.clone()));
        let app = self.router();

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown({
                let shutdown = shutdown.clone();
                async move { shutdown.cancelled().await }
            })
            .await?;

        shutdown.cancel();
        let _ = sweeper.await;
        info!("Gateway shut down");
        Ok(())
    }
}

/// Periodically apply the timeout policy of expired approval requests.
async fn sweep_approvals(engine: Arc<ExecutionEngine>, shutdown: CancellationToken) {
    let secs = engine.config().approval_sweep_interval_secs.max(1);
    let mut interval = tokio::time::interval(Duration::from_secs(secs));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                match engine.expire_approvals(Utc::now()).await {
                    Ok(touched) if !touched.is_empty() => {
                        info!(count = touched.len(), "Expired approvals resolved");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Approval sweep failed"),
                }
            }
        }
    }
}
