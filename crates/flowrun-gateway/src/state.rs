use flowrun_core::config::GatewayConfig;
use flowrun_engine::Engine;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub engine: Engine,
}
