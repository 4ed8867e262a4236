use std::collections::HashMap;

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use flowrun_core::error::Result;
use flowrun_core::graph::GraphDef;
use flowrun_core::traits::{GraphRepository, RunRepository};
use flowrun_core::types::{RunId, RunState};

/// Process-local graph store.
#[derive(Default)]
pub struct InMemoryGraphStore {
    graphs: RwLock<HashMap<String, GraphDef>>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GraphRepository for InMemoryGraphStore {
    fn put(&self, graph_id: &str, graph: GraphDef) -> BoxFuture<'_, Result<()>> {
        let graph_id = graph_id.to_string();
        Box::pin(async move {
            self.graphs.write().await.insert(graph_id, graph);
            Ok(())
        })
    }

    fn get(&self, graph_id: &str) -> BoxFuture<'_, Result<Option<GraphDef>>> {
        let graph_id = graph_id.to_string();
        Box::pin(async move { Ok(self.graphs.read().await.get(&graph_id).cloned()) })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let mut ids: Vec<String> = self.graphs.read().await.keys().cloned().collect();
            ids.sort();
            Ok(ids)
        })
    }
}

/// Process-local run store holding the latest snapshot of every run.
#[derive(Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<RunId, RunState>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunRepository for InMemoryRunStore {
    fn save(&self, run: RunState) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.runs.write().await.insert(run.run_id.clone(), run);
            Ok(())
        })
    }

    fn get(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<RunState>>> {
        let run_id = run_id.clone();
        Box::pin(async move { Ok(self.runs.read().await.get(&run_id).cloned()) })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<RunId>>> {
        Box::pin(async move { Ok(self.runs.read().await.keys().cloned().collect()) })
    }
}
