pub mod config;
pub mod error;
pub mod graph;
pub mod state;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{FlowError, Result};
pub use graph::{Branches, GraphDef, NodeDef};
pub use state::State;
pub use types::*;
