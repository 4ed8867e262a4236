use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::State;

/// Unique run identifier, generated by the engine.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One node execution: the node name and the partial state it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub node: String,
    pub result: State,
}

/// Why a run stopped before reaching a node without a successor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TruncationReason {
    /// `start`, `next` or a branch target named a node the graph lacks.
    MissingNode { node: String },
    /// The step bound was exceeded.
    StepLimit { limit: usize },
}

impl std::fmt::Display for TruncationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingNode { node } => write!(f, "node '{}' not found", node),
            Self::StepLimit { limit } => write!(f, "step limit {} exceeded", limit),
        }
    }
}

/// How a finished run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Traversal reached a node with no matching branch and no `next`.
    Completed,
    /// Soft stop: the run is done but its execution was cut short.
    Truncated { reason: TruncationReason },
    /// Stopped by `cancel_run` or engine shutdown.
    Cancelled,
    /// Hard fault (unknown tool, tool error).
    Failed { error: String },
}

/// Execution record of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: RunId,
    pub graph_id: String,
    pub state: State,
    pub logs: Vec<RunLogEntry>,
    pub done: bool,
    /// Set exactly when `done` becomes true.
    #[serde(default)]
    pub outcome: Option<RunOutcome>,
    /// Node executions performed, loop repetitions included.
    #[serde(default)]
    pub steps: usize,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunState {
    pub fn new(run_id: RunId, graph_id: impl Into<String>, state: State) -> Self {
        Self {
            run_id,
            graph_id: graph_id.into(),
            state,
            logs: Vec::new(),
            done: false,
            outcome: None,
            steps: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Mark the run done. Later calls keep the first outcome.
    pub fn finish(&mut self, outcome: RunOutcome) {
        if self.done {
            return;
        }
        self.done = true;
        self.outcome = Some(outcome);
        self.finished_at = Some(Utc::now());
    }

    /// Names of the executed nodes, in order.
    pub fn visited(&self) -> Vec<&str> {
        self.logs.iter().map(|e| e.node.as_str()).collect()
    }
}

/// End-of-stream marker sent to log listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub done: bool,
    pub outcome: RunOutcome,
}

impl Completion {
    pub fn new(outcome: RunOutcome) -> Self {
        Self {
            done: true,
            outcome,
        }
    }
}

/// An event on a run's live log stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LogEvent {
    /// `{"node": ..., "result": {...}}`
    Node(RunLogEntry),
    /// `{"done": true, "outcome": {...}}`
    Completed(Completion),
}

impl LogEvent {
    pub fn is_completion(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}
