use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{debug, info};

use flowrun_core::graph::GraphDef;
use flowrun_core::types::{RunId, RunState};

use crate::connection;
use crate::protocol::{
    ApiError, CancelResult, CreateGraphRequest, GraphCreated, RunGraphRequest, RunStarted,
};
use crate::state::AppState;

type ApiResult<T> = Result<Json<T>, ApiError>;

// GET /api/health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// GET /tools
pub async fn list_tools(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let tools = state.engine.tool_names().await;
    Json(serde_json::json!({ "tools": tools }))
}

// POST /graph/create
pub async fn create_graph(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateGraphRequest>,
) -> ApiResult<GraphCreated> {
    let graph_id = body
        .graph_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let graph_id = state.engine.create_graph(graph_id, body.graph).await?;
    Ok(Json(GraphCreated { graph_id }))
}

// GET /graph/{graph_id}
pub async fn get_graph(
    State(state): State<Arc<AppState>>,
    Path(graph_id): Path<String>,
) -> ApiResult<GraphDef> {
    Ok(Json(state.engine.get_graph(&graph_id).await?))
}

// POST /graph/run
pub async fn run_graph(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RunGraphRequest>,
) -> Result<Response, ApiError> {
    if body.background {
        let run_id = state
            .engine
            .start_background(&body.graph_id, body.state)
            .await?;
        info!(run_id = %run_id, graph_id = %body.graph_id, "Background run accepted");
        let started = RunStarted {
            run_id: run_id.to_string(),
            background: true,
        };
        return Ok(Json(started).into_response());
    }

    let run = state.engine.run_graph(&body.graph_id, body.state).await?;
    Ok(Json(run).into_response())
}

// GET /graph/state/{run_id}
pub async fn run_state(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<RunState> {
    let run_id = RunId::from_string(&run_id);
    Ok(Json(state.engine.get_run_state(&run_id).await?))
}

// POST /graph/cancel/{run_id}
pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<CancelResult> {
    let run_id = RunId::from_string(&run_id);
    let cancelled = state.engine.cancel_run(&run_id).await?;
    Ok(Json(CancelResult {
        run_id: run_id.to_string(),
        cancelled,
    }))
}

// GET /ws/logs/{run_id}
pub async fn ws_logs(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> impl IntoResponse {
    let run_id = RunId::from_string(&run_id);
    debug!(run_id = %run_id, "Log stream requested");
    // Attach before the upgrade completes so no event slips past.
    let subscription = state.engine.subscribe_logs(&run_id).await;
    ws.on_upgrade(move |socket| connection::forward_logs(socket, subscription))
}
