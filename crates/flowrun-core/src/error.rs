use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    // Lookup errors
    #[error("Graph not found: {0}")]
    GraphNotFound(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid tool: {0}")]
    InvalidTool(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Run task panicked: {0}")]
    RunPanicked(String),

    // Graph errors
    #[error("Invalid graph {graph_id}: {}", problems.join("; "))]
    InvalidGraph {
        graph_id: String,
        problems: Vec<String>,
    },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Shorthand for a tool that returned an error of its own.
    pub fn tool_failed(tool: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::ToolExecution {
            tool: tool.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
