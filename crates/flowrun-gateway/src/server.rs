use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

use flowrun_core::config::GatewayConfig;
use flowrun_engine::Engine;

use crate::routes;
use crate::state::AppState;

/// HTTP + WebSocket gateway server built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    engine: Engine,
}

/// Build the gateway router over shared state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(routes::health))
        .route("/tools", get(routes::list_tools))
        .route("/graph/create", post(routes::create_graph))
        .route("/graph/run", post(routes::run_graph))
        .route("/graph/state/{run_id}", get(routes::run_state))
        .route("/graph/cancel/{run_id}", post(routes::cancel_run))
        .route("/graph/{graph_id}", get(routes::get_graph))
        .route("/ws/logs/{run_id}", get(routes::ws_logs))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, engine: Engine) -> Self {
        Self { config, engine }
    }

    /// Bind the configured address and serve until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.config.bind).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already-bound listener until `shutdown` fires.
    ///
    /// In-flight runs are cancelled once the server has stopped.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            engine: self.engine.clone(),
        });
        let app = router(state);

        let sweeper = tokio::spawn(sweep_streams(
            self.engine.clone(),
            Duration::from_secs(self.config.sweep_interval_secs.max(1)),
            shutdown.clone(),
        ));

        info!(bind = %listener.local_addr()?, "Gateway listening");

        let signal = shutdown.clone();
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await;

        shutdown.cancel();
        let _ = sweeper.await;
        self.engine.shutdown();
        served?;

        info!("Gateway shut down");
        Ok(())
    }
}

/// Periodically evict log streams of long-finished runs.
async fn sweep_streams(engine: Engine, period: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = engine.evict_closed_streams();
                if evicted > 0 {
                    debug!(evicted, "Stream sweep");
                }
            }
        }
    }
}
