use futures::future::BoxFuture;

use crate::error::Result;
use crate::graph::GraphDef;
use crate::state::State;
use crate::types::{RunId, RunState};

/// Tool: a named async transformation of a state snapshot into a partial state.
pub trait Tool: Send + Sync + 'static {
    /// Name nodes refer to this tool by.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str {
        ""
    }

    /// Run the tool against a snapshot of the run state.
    ///
    /// The returned map is merged into the run state by the engine; it may be
    /// empty. An error is a hard fault for the run.
    fn call(&self, state: State) -> BoxFuture<'_, Result<State>>;
}

/// Graph store: graph id to immutable definition.
pub trait GraphRepository: Send + Sync + 'static {
    /// Store a graph, overwriting any previous definition with the same id.
    fn put(&self, graph_id: &str, graph: GraphDef) -> BoxFuture<'_, Result<()>>;

    /// Fetch a graph definition.
    fn get(&self, graph_id: &str) -> BoxFuture<'_, Result<Option<GraphDef>>>;

    /// List stored graph ids.
    fn list(&self) -> BoxFuture<'_, Result<Vec<String>>>;
}

/// Run store: run id to the latest snapshot of that run.
pub trait RunRepository: Send + Sync + 'static {
    /// Insert or replace the snapshot for `run.run_id`.
    fn save(&self, run: RunState) -> BoxFuture<'_, Result<()>>;

    /// Fetch the latest snapshot.
    fn get(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<RunState>>>;

    /// List stored run ids.
    fn list(&self) -> BoxFuture<'_, Result<Vec<RunId>>>;
}
