use std::sync::Arc;

use wayline_core::config::GatewayConfig;
use wayline_engine::ExecutionEngine;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub engine: Arc<ExecutionEngine>,
}
