//! HTTP + WebSocket surface over the flowrun engine.
//!
//! Graph and run management is plain JSON over HTTP; live run logs are
//! served on `/ws/logs/{run_id}`, one text frame per event.

mod connection;
mod protocol;
mod routes;
mod server;
mod state;

pub use protocol::{ApiError, CreateGraphRequest, RunGraphRequest};
pub use server::{router, GatewayServer};
pub use state::AppState;
