use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::warn;

use flowrun_core::error::FlowError;
use flowrun_core::graph::GraphDef;
use flowrun_core::state::State;

/// Body of `POST /graph/create`.
#[derive(Debug, Deserialize)]
pub struct CreateGraphRequest {
    /// Generated when absent.
    #[serde(default)]
    pub graph_id: Option<String>,
    #[serde(flatten)]
    pub graph: GraphDef,
}

/// Body of `POST /graph/run`.
#[derive(Debug, Deserialize)]
pub struct RunGraphRequest {
    pub graph_id: String,
    #[serde(default, alias = "init_state")]
    pub state: State,
    #[serde(default)]
    pub background: bool,
}

#[derive(Debug, Serialize)]
pub struct GraphCreated {
    pub graph_id: String,
}

#[derive(Debug, Serialize)]
pub struct RunStarted {
    pub run_id: String,
    pub background: bool,
}

#[derive(Debug, Serialize)]
pub struct CancelResult {
    pub run_id: String,
    pub cancelled: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Engine error rendered as `{"error": message}` with a matching status.
#[derive(Debug)]
pub struct ApiError(pub FlowError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            FlowError::GraphNotFound(_) | FlowError::RunNotFound(_) => StatusCode::NOT_FOUND,
            FlowError::ToolNotFound(_) => StatusCode::UNPROCESSABLE_ENTITY,
            FlowError::InvalidGraph { .. } | FlowError::InvalidTool(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<FlowError> for ApiError {
    fn from(e: FlowError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self.0, "Request failed");
        }
        let body = ErrorBody {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
