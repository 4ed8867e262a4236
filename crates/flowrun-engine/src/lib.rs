//! Execution engine. Walks a stored graph node by node over a shared state.
//!
//! Each step resolves the current node, invokes its tool through the
//! `ToolRegistry`, merges the partial result into the run state, appends a
//! log entry and publishes it on the run's live stream. The next node is
//! chosen by the node's loop condition, then its branch table, then `next`.
//!
//! Runs are either awaited (`Engine::run_graph`) or spawned
//! (`Engine::start_background`); both end with a `RunOutcome` recorded on the
//! `RunState` and a completion marker on the stream.

pub mod engine;
pub mod store;
pub mod stream;
pub mod traversal;

pub use engine::Engine;
pub use store::{InMemoryGraphStore, InMemoryRunStore};
pub use stream::{LogStreamRegistry, LogSubscription};
pub use traversal::{transition, Transition};
