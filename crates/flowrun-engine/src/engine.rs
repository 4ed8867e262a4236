use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowrun_core::config::EngineConfig;
use flowrun_core::error::{FlowError, Result};
use flowrun_core::graph::{GraphDef, NodeDef};
use flowrun_core::state::{self, State};
use flowrun_core::traits::{GraphRepository, RunRepository};
use flowrun_core::types::{
    Completion, LogEvent, RunId, RunLogEntry, RunOutcome, RunState, TruncationReason,
};
use flowrun_tools::ToolRegistry;

use crate::store::{InMemoryGraphStore, InMemoryRunStore};
use crate::stream::{LogStreamRegistry, LogSubscription};
use crate::traversal::{transition, Transition};

/// A run that has been registered but not yet traversed.
struct PreparedRun {
    graph: GraphDef,
    run: RunState,
    cancel: CancellationToken,
}

/// The graph execution engine.
///
/// Cheap to clone: every collaborator is shared, so a clone can be moved into
/// a background task.
#[derive(Clone)]
pub struct Engine {
    config: EngineConfig,
    tools: Arc<RwLock<ToolRegistry>>,
    graphs: Arc<dyn GraphRepository>,
    runs: Arc<dyn RunRepository>,
    streams: Arc<LogStreamRegistry>,
    active: Arc<Mutex<HashMap<RunId, CancellationToken>>>,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        tools: Arc<RwLock<ToolRegistry>>,
        graphs: Arc<dyn GraphRepository>,
        runs: Arc<dyn RunRepository>,
        streams: Arc<LogStreamRegistry>,
    ) -> Self {
        Self {
            config,
            tools,
            graphs,
            runs,
            streams,
            active: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Engine backed by in-process stores.
    pub fn in_memory(config: EngineConfig, tools: ToolRegistry) -> Self {
        let streams = Arc::new(LogStreamRegistry::new(config.stream_capacity));
        Self::new(
            config,
            Arc::new(RwLock::new(tools)),
            Arc::new(InMemoryGraphStore::new()),
            Arc::new(InMemoryRunStore::new()),
            streams,
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared tool registry, for registering tools after construction.
    pub fn tools(&self) -> Arc<RwLock<ToolRegistry>> {
        self.tools.clone()
    }

    pub fn streams(&self) -> Arc<LogStreamRegistry> {
        self.streams.clone()
    }

    pub async fn tool_names(&self) -> Vec<String> {
        self.tools
            .read()
            .await
            .list()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    // ── Graphs ──────────────────────────────────────────────────

    /// Store a graph under `graph_id`, replacing any previous definition.
    ///
    /// Dangling node references are logged; with `strict_graphs` they reject
    /// the graph instead.
    pub async fn create_graph(&self, graph_id: impl Into<String>, graph: GraphDef) -> Result<String> {
        let graph_id = graph_id.into();
        let problems = graph.validate();
        if !problems.is_empty() {
            if self.config.strict_graphs {
                return Err(FlowError::InvalidGraph { graph_id, problems });
            }
            for problem in &problems {
                warn!(graph_id = %graph_id, problem = %problem, "Graph has a dangling reference");
            }
        }

        self.graphs.put(&graph_id, graph).await?;
        info!(graph_id = %graph_id, "Graph stored");
        Ok(graph_id)
    }

    pub async fn get_graph(&self, graph_id: &str) -> Result<GraphDef> {
        self.graphs
            .get(graph_id)
            .await?
            .ok_or_else(|| FlowError::GraphNotFound(graph_id.to_string()))
    }

    pub async fn list_graphs(&self) -> Result<Vec<String>> {
        self.graphs.list().await
    }

    // ── Runs ────────────────────────────────────────────────────

    /// Run a graph to completion and return the final run state.
    ///
    /// Hard faults (unknown tool, tool error) are returned as errors; the run
    /// is still recorded as done with a `Failed` outcome.
    ///
    /// Traversal runs in its own task: dropping this future does not abandon
    /// the run, it still finishes and is recorded.
    pub async fn run_graph(&self, graph_id: &str, init_state: State) -> Result<RunState> {
        let prepared = self.prepare(graph_id, init_state).await?;
        let run_id = prepared.run.run_id.clone();
        self.launch(prepared)
            .await
            .unwrap_or_else(|e| Err(FlowError::RunPanicked(format!("{run_id}: {e}"))))
    }

    /// Start a run in a background task and return its id immediately.
    pub async fn start_background(&self, graph_id: &str, init_state: State) -> Result<RunId> {
        let prepared = self.prepare(graph_id, init_state).await?;
        let run_id = prepared.run.run_id.clone();
        self.spawn(prepared);
        Ok(run_id)
    }

    /// Like `start_background`, but the returned subscription is attached
    /// before traversal begins, so it observes every node event.
    pub async fn start_background_subscribed(
        &self,
        graph_id: &str,
        init_state: State,
    ) -> Result<(RunId, LogSubscription)> {
        let prepared = self.prepare(graph_id, init_state).await?;
        let run_id = prepared.run.run_id.clone();
        let subscription = self.streams.subscribe(&run_id);
        self.spawn(prepared);
        Ok((run_id, subscription))
    }

    /// Latest snapshot of a run.
    pub async fn get_run_state(&self, run_id: &RunId) -> Result<RunState> {
        self.runs
            .get(run_id)
            .await?
            .ok_or_else(|| FlowError::RunNotFound(run_id.to_string()))
    }

    pub async fn list_runs(&self) -> Result<Vec<RunId>> {
        self.runs.list().await
    }

    /// Attach a live listener to a run's log stream.
    ///
    /// Works before the run exists; the engine later publishes into the same
    /// stream. If the stream of a finished run was already evicted, the
    /// subscription yields just the completion marker.
    pub async fn subscribe_logs(&self, run_id: &RunId) -> LogSubscription {
        if !self.streams.contains(run_id) {
            if let Ok(Some(run)) = self.runs.get(run_id).await {
                if let (true, Some(outcome)) = (run.done, run.outcome) {
                    return LogSubscription::finished(run_id.clone(), Completion::new(outcome));
                }
            }
        }
        self.streams.subscribe(run_id)
    }

    /// Request cancellation of an in-flight run.
    ///
    /// Returns `false` if the run already finished.
    pub async fn cancel_run(&self, run_id: &RunId) -> Result<bool> {
        let token = self.active().get(run_id).cloned();
        if let Some(token) = token {
            info!(run_id = %run_id, "Cancelling run");
            token.cancel();
            return Ok(true);
        }
        match self.runs.get(run_id).await? {
            Some(_) => Ok(false),
            None => Err(FlowError::RunNotFound(run_id.to_string())),
        }
    }

    /// Number of runs currently traversing.
    pub fn active_runs(&self) -> usize {
        self.active().len()
    }

    /// Cancel every in-flight run.
    pub fn shutdown(&self) {
        info!(active = self.active_runs(), "Engine shutting down");
        self.shutdown.cancel();
    }

    /// Evict log streams of runs finished longer ago than the configured
    /// retention.
    pub fn evict_closed_streams(&self) -> usize {
        self.streams
            .evict_closed(Duration::from_secs(self.config.stream_retention_secs))
    }

    fn active(&self) -> MutexGuard<'_, HashMap<RunId, CancellationToken>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn prepare(&self, graph_id: &str, init_state: State) -> Result<PreparedRun> {
        let graph = self.get_graph(graph_id).await?;
        let run = RunState::new(RunId::new(), graph_id, init_state);
        self.runs.save(run.clone()).await?;
        self.streams.create(&run.run_id);

        let cancel = self.shutdown.child_token();
        self.active().insert(run.run_id.clone(), cancel.clone());

        info!(run_id = %run.run_id, graph_id = %graph_id, "Run started");
        Ok(PreparedRun { graph, run, cancel })
    }

    fn spawn(&self, prepared: PreparedRun) {
        let run_id = prepared.run.run_id.clone();
        let handle = self.launch(prepared);
        tokio::spawn(async move {
            match handle.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!(run_id = %run_id, error = %e, "Background run failed"),
                Err(e) => error!(run_id = %run_id, error = %e, "Background run task lost"),
            }
        });
    }

    /// Drive a prepared run on its own task.
    ///
    /// A panic anywhere in traversal still finishes the run as `Failed`,
    /// closes its stream and releases its cancellation slot.
    fn launch(&self, prepared: PreparedRun) -> JoinHandle<Result<RunState>> {
        let engine = self.clone();
        tokio::spawn(async move {
            let run_id = prepared.run.run_id.clone();
            let graph_id = prepared.run.graph_id.clone();
            match AssertUnwindSafe(engine.drive(prepared)).catch_unwind().await {
                Ok((run, result)) => result.map(|_| run),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    Err(engine.abandon(&run_id, &graph_id, message).await)
                }
            }
        })
    }

    /// Record a run whose traversal panicked, starting from its last saved
    /// snapshot.
    async fn abandon(&self, run_id: &RunId, graph_id: &str, message: String) -> FlowError {
        let err = FlowError::RunPanicked(message);
        error!(run_id = %run_id, error = %err, "Run aborted");

        let outcome = RunOutcome::Failed {
            error: err.to_string(),
        };
        let mut run = match self.runs.get(run_id).await {
            Ok(Some(run)) => run,
            _ => RunState::new(run_id.clone(), graph_id, State::new()),
        };
        run.finish(outcome.clone());
        if let Err(e) = self.runs.save(run).await {
            error!(run_id = %run_id, error = %e, "Failed to record aborted run");
        }
        self.streams.close(run_id, outcome);
        self.active().remove(run_id);
        err
    }

    /// Traverse, then record the outcome, persist, and close the stream.
    async fn drive(&self, prepared: PreparedRun) -> (RunState, Result<()>) {
        let PreparedRun {
            graph,
            mut run,
            cancel,
        } = prepared;

        let result = self.traverse(&graph, &mut run, &cancel).await;
        let outcome = match &result {
            Ok(outcome) => outcome.clone(),
            Err(e) => RunOutcome::Failed {
                error: e.to_string(),
            },
        };

        run.finish(outcome.clone());
        let saved = self.runs.save(run.clone()).await;
        self.streams.close(&run.run_id, outcome.clone());
        self.active().remove(&run.run_id);

        info!(
            run_id = %run.run_id,
            steps = run.steps,
            outcome = ?outcome,
            "Run completed"
        );

        (run, result.and(saved))
    }

    /// The traversal loop. Soft stops come back as `Ok` outcomes; hard faults
    /// as errors.
    async fn traverse(
        &self,
        graph: &GraphDef,
        run: &mut RunState,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let max_steps = self.config.max_steps;
        let mut current = Some(graph.start.clone());
        let mut visited = 0usize;

        while let Some(name) = current.take() {
            if cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }
            if visited > max_steps {
                error!(run_id = %run.run_id, max_steps, "Max steps exceeded");
                return Ok(RunOutcome::Truncated {
                    reason: TruncationReason::StepLimit { limit: max_steps },
                });
            }
            visited += 1;

            let Some(node) = graph.node(&name) else {
                warn!(run_id = %run.run_id, node = %name, "Node not found in graph");
                return Ok(RunOutcome::Truncated {
                    reason: TruncationReason::MissingNode { node: name },
                });
            };

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(RunOutcome::Cancelled),
                result = self.invoke(run, node) => result?,
            };

            state::merge(&mut run.state, &result);
            run.steps += 1;
            let entry = RunLogEntry {
                node: node.name.clone(),
                result,
            };
            run.logs.push(entry.clone());
            self.streams.publish(&run.run_id, LogEvent::Node(entry));
            self.runs.save(run.clone()).await?;

            match transition(node, &run.state) {
                Transition::Repeat => {
                    debug!(
                        run_id = %run.run_id,
                        node = %name,
                        condition = node.loop_condition.as_deref().unwrap_or_default(),
                        "Loop condition unmet, repeating node"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(RunOutcome::Cancelled),
                        _ = tokio::task::yield_now() => {}
                    }
                    current = Some(name);
                }
                Transition::Goto(next) => {
                    debug!(run_id = %run.run_id, from = %name, to = %next, "Advancing");
                    current = Some(next);
                }
                Transition::End => {
                    debug!(run_id = %run.run_id, node = %name, "No successor, traversal complete");
                }
            }
        }

        Ok(RunOutcome::Completed)
    }

    /// Resolve the node's tool and call it with a snapshot of the state.
    async fn invoke(&self, run: &RunState, node: &NodeDef) -> Result<State> {
        let tool = self
            .tools
            .read()
            .await
            .get(&node.tool_name)
            .ok_or_else(|| FlowError::ToolNotFound(node.tool_name.clone()))?;

        info!(run_id = %run.run_id, node = %node.name, tool = %node.tool_name, "Running node");
        tool.call(run.state.clone()).await.map_err(|e| match e {
            e @ FlowError::ToolExecution { .. } => e,
            other => FlowError::tool_failed(&node.tool_name, other),
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowrun_test_utils::{
        config_with_max_steps, counting_loop_graph, counting_tool, double_twice_graph, fake_tools,
        linear_graph, state,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine() -> Engine {
        Engine::in_memory(EngineConfig::default(), fake_tools())
    }

    #[tokio::test]
    async fn test_double_twice_end_to_end() {
        let engine = engine();
        engine.create_graph("g", double_twice_graph()).await.unwrap();

        let run = engine.run_graph("g", state(json!({"n": 3}))).await.unwrap();
        assert_eq!(run.state["n"], json!(12));
        assert_eq!(run.logs.len(), 2);
        assert_eq!(run.visited(), vec!["A", "B"]);
        assert_eq!(run.logs[0].result, state(json!({"n": 6})));
        assert!(run.done);
        assert_eq!(run.outcome, Some(RunOutcome::Completed));
        assert_eq!(run.steps, 2);

        let stored = engine.get_run_state(&run.run_id).await.unwrap();
        assert!(stored.done);
        assert_eq!(stored.state["n"], json!(12));
    }

    #[tokio::test]
    async fn test_branch_first_defined_key_wins() {
        let engine = engine();
        let graph = GraphDef::new(
            "S",
            vec![
                NodeDef::new("S", "noop")
                    .with_branch("a", "X")
                    .with_branch("b", "Y"),
                NodeDef::new("X", "noop"),
                NodeDef::new("Y", "noop"),
            ],
        );
        engine.create_graph("g", graph).await.unwrap();

        let run = engine
            .run_graph("g", state(json!({"b": true, "a": true})))
            .await
            .unwrap();
        assert_eq!(run.visited(), vec!["S", "X"]);
    }

    #[tokio::test]
    async fn test_branch_set_by_node_result() {
        let engine = engine();
        let graph = GraphDef::new(
            "S",
            vec![
                NodeDef::new("S", "set_b")
                    .with_branch("a", "X")
                    .with_branch("b", "Y")
                    .with_next("X"),
                NodeDef::new("X", "noop"),
                NodeDef::new("Y", "noop"),
            ],
        );
        engine.create_graph("g", graph).await.unwrap();

        let run = engine.run_graph("g", State::new()).await.unwrap();
        assert_eq!(run.visited(), vec!["S", "Y"]);
    }

    #[tokio::test]
    async fn test_loop_until_condition() {
        let engine = engine();
        engine.create_graph("g", counting_loop_graph()).await.unwrap();

        let run = engine
            .run_graph("g", state(json!({"target": 3})))
            .await
            .unwrap();
        assert_eq!(run.visited(), vec!["count", "count", "count"]);
        assert_eq!(run.state["count"], json!(3));
        assert_eq!(run.outcome, Some(RunOutcome::Completed));
    }

    #[tokio::test]
    async fn test_step_limit_truncates() {
        let engine = Engine::in_memory(config_with_max_steps(5), fake_tools());
        engine.create_graph("g", counting_loop_graph()).await.unwrap();

        let run = engine.run_graph("g", State::new()).await.unwrap();
        // The bound is checked before each step, so `max_steps + 1` run.
        assert_eq!(run.logs.len(), 6);
        assert!(run.done);
        assert_eq!(
            run.outcome,
            Some(RunOutcome::Truncated {
                reason: TruncationReason::StepLimit { limit: 5 }
            })
        );
    }

    #[tokio::test]
    async fn test_cycle_through_graph_is_bounded() {
        let engine = Engine::in_memory(config_with_max_steps(10), fake_tools());
        let graph = GraphDef::new(
            "ping",
            vec![
                NodeDef::new("ping", "noop").with_next("pong"),
                NodeDef::new("pong", "noop").with_next("ping"),
            ],
        );
        engine.create_graph("g", graph).await.unwrap();

        let run = engine.run_graph("g", State::new()).await.unwrap();
        assert_eq!(run.logs.len(), 11);
        assert!(matches!(run.outcome, Some(RunOutcome::Truncated { .. })));
    }

    #[tokio::test]
    async fn test_missing_start_is_soft_stop() {
        let engine = engine();
        engine
            .create_graph("g", GraphDef::new("nowhere", vec![NodeDef::new("A", "noop")]))
            .await
            .unwrap();

        let run = engine.run_graph("g", State::new()).await.unwrap();
        assert!(run.done);
        assert!(run.logs.is_empty());
        assert_eq!(
            run.outcome,
            Some(RunOutcome::Truncated {
                reason: TruncationReason::MissingNode {
                    node: "nowhere".into()
                }
            })
        );
    }

    #[tokio::test]
    async fn test_missing_next_keeps_partial_log() {
        let engine = engine();
        let graph = GraphDef::new(
            "A",
            vec![
                NodeDef::new("A", "double").with_next("B"),
                NodeDef::new("B", "double").with_next("ghost"),
            ],
        );
        engine.create_graph("g", graph).await.unwrap();

        let run = engine.run_graph("g", state(json!({"n": 1}))).await.unwrap();
        assert_eq!(run.visited(), vec!["A", "B"]);
        assert_eq!(run.state["n"], json!(4));
        assert!(matches!(
            run.outcome,
            Some(RunOutcome::Truncated {
                reason: TruncationReason::MissingNode { .. }
            })
        ));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_hard_fault() {
        let engine = engine();
        engine
            .create_graph("g", linear_graph(&["A"], "no_such_tool"))
            .await
            .unwrap();

        let err = engine.run_graph("g", State::new()).await.unwrap_err();
        assert!(matches!(err, FlowError::ToolNotFound(ref name) if name == "no_such_tool"));
    }

    #[tokio::test]
    async fn test_tool_error_is_hard_fault() {
        let engine = engine();
        engine
            .create_graph("g", linear_graph(&["A", "B"], "failing"))
            .await
            .unwrap();

        let err = engine.run_graph("g", State::new()).await.unwrap_err();
        assert!(matches!(err, FlowError::ToolExecution { ref tool, .. } if tool == "failing"));
    }

    #[tokio::test]
    async fn test_unknown_graph() {
        let engine = engine();
        let err = engine.run_graph("missing", State::new()).await.unwrap_err();
        assert!(matches!(err, FlowError::GraphNotFound(_)));

        let err = engine
            .start_background("missing", State::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::GraphNotFound(_)));
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let engine = engine();
        let err = engine.get_run_state(&RunId::new()).await.unwrap_err();
        assert!(matches!(err, FlowError::RunNotFound(_)));

        let err = engine.cancel_run(&RunId::new()).await.unwrap_err();
        assert!(matches!(err, FlowError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrent_runs_are_isolated() {
        let engine = engine();
        engine.create_graph("g", double_twice_graph()).await.unwrap();

        let (first, second) = tokio::join!(
            engine.run_graph("g", state(json!({"n": 3}))),
            engine.run_graph("g", state(json!({"n": 5, "tag": "second"}))),
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_ne!(first.run_id, second.run_id);
        assert_eq!(first.state, state(json!({"n": 12})));
        assert_eq!(second.state, state(json!({"n": 20, "tag": "second"})));
    }

    #[tokio::test]
    async fn test_background_listener_sees_every_node() {
        let engine = engine();
        engine
            .create_graph("g", linear_graph(&["A", "B", "C"], "double"))
            .await
            .unwrap();

        let run_id = engine
            .start_background("g", state(json!({"n": 1})))
            .await
            .unwrap();
        let events = engine.subscribe_logs(&run_id).await.collect().await;

        assert_eq!(events.len(), 4);
        let nodes: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                LogEvent::Node(entry) => Some(entry.node.as_str()),
                LogEvent::Completed(_) => None,
            })
            .collect();
        assert_eq!(nodes, vec!["A", "B", "C"]);
        assert_eq!(
            events.last(),
            Some(&LogEvent::Completed(Completion::new(RunOutcome::Completed)))
        );

        let run = engine.get_run_state(&run_id).await.unwrap();
        assert!(run.done);
        assert_eq!(run.state["n"], json!(8));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_subscribed_start_on_multi_thread_runtime() {
        let engine = engine();
        engine
            .create_graph("g", linear_graph(&["A", "B", "C", "D"], "noop"))
            .await
            .unwrap();

        let (_, subscription) = engine
            .start_background_subscribed("g", State::new())
            .await
            .unwrap();
        let events = subscription.collect().await;
        assert_eq!(events.len(), 5);
    }

    #[tokio::test]
    async fn test_background_step_limit_is_not_an_error() {
        let engine = Engine::in_memory(config_with_max_steps(3), fake_tools());
        engine.create_graph("g", counting_loop_graph()).await.unwrap();

        let (run_id, subscription) = engine
            .start_background_subscribed("g", State::new())
            .await
            .unwrap();
        let events = subscription.collect().await;
        assert_eq!(events.len(), 5);

        let run = engine.get_run_state(&run_id).await.unwrap();
        assert!(run.done);
        assert_eq!(run.logs.len(), 4);
        assert!(matches!(run.outcome, Some(RunOutcome::Truncated { .. })));
    }

    #[tokio::test]
    async fn test_background_tool_failure_recorded() {
        let engine = engine();
        engine
            .create_graph("g", linear_graph(&["A"], "no_such_tool"))
            .await
            .unwrap();

        let (run_id, subscription) = engine
            .start_background_subscribed("g", State::new())
            .await
            .unwrap();
        let events = subscription.collect().await;
        assert_eq!(events.len(), 1);

        let run = engine.get_run_state(&run_id).await.unwrap();
        assert!(run.done);
        match run.outcome {
            Some(RunOutcome::Failed { error }) => assert!(error.contains("no_such_tool")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_tool() {
        let engine = engine();
        engine
            .create_graph("g", linear_graph(&["slow", "after"], "sleepy"))
            .await
            .unwrap();

        let (run_id, subscription) = engine
            .start_background_subscribed("g", State::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.active_runs(), 1);
        assert!(engine.cancel_run(&run_id).await.unwrap());

        let events = subscription.collect().await;
        assert_eq!(
            events,
            vec![LogEvent::Completed(Completion::new(RunOutcome::Cancelled))]
        );

        let run = engine.get_run_state(&run_id).await.unwrap();
        assert!(run.done);
        assert!(run.logs.is_empty());
        assert_eq!(engine.active_runs(), 0);
        assert!(!engine.cancel_run(&run_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_during_loop() {
        let engine = engine();
        engine.create_graph("g", counting_loop_graph()).await.unwrap();

        let (run_id, mut subscription) = engine
            .start_background_subscribed("g", State::new())
            .await
            .unwrap();
        // Let a few iterations through, then cancel at a yield point.
        for _ in 0..3 {
            assert!(matches!(subscription.next().await, Some(LogEvent::Node(_))));
        }
        engine.cancel_run(&run_id).await.unwrap();

        let rest = subscription.collect().await;
        assert_eq!(
            rest.last(),
            Some(&LogEvent::Completed(Completion::new(RunOutcome::Cancelled)))
        );
        let run = engine.get_run_state(&run_id).await.unwrap();
        assert_eq!(run.outcome, Some(RunOutcome::Cancelled));
        assert!(run.logs.len() < 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_all_runs() {
        let engine = engine();
        engine
            .create_graph("g", linear_graph(&["slow"], "sleepy"))
            .await
            .unwrap();

        let (_, first) = engine
            .start_background_subscribed("g", State::new())
            .await
            .unwrap();
        let (_, second) = engine
            .start_background_subscribed("g", State::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.shutdown();

        for sub in [first, second] {
            let events = sub.collect().await;
            assert_eq!(
                events.last(),
                Some(&LogEvent::Completed(Completion::new(RunOutcome::Cancelled)))
            );
        }
    }

    #[tokio::test]
    async fn test_subscribe_after_eviction_gets_completion() {
        let mut config = EngineConfig::default();
        config.stream_retention_secs = 0;
        let engine = Engine::in_memory(config, fake_tools());
        engine.create_graph("g", double_twice_graph()).await.unwrap();

        let run = engine.run_graph("g", state(json!({"n": 1}))).await.unwrap();
        assert_eq!(engine.evict_closed_streams(), 1);

        let mut sub = engine.subscribe_logs(&run.run_id).await;
        assert_eq!(
            sub.next().await,
            Some(LogEvent::Completed(Completion::new(RunOutcome::Completed)))
        );
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_strict_graphs_reject_dangling_references() {
        let mut config = EngineConfig::default();
        config.strict_graphs = true;
        let strict = Engine::in_memory(config, fake_tools());

        let graph = linear_graph(&["A"], "noop");
        let dangling = GraphDef::new("A", vec![NodeDef::new("A", "noop").with_next("ghost")]);

        assert!(strict.create_graph("ok", graph).await.is_ok());
        let err = strict.create_graph("bad", dangling.clone()).await.unwrap_err();
        assert!(matches!(err, FlowError::InvalidGraph { .. }));
        assert!(strict.get_graph("bad").await.is_err());

        // Lenient engines store it anyway.
        let lenient = engine();
        assert_eq!(lenient.create_graph("bad", dangling).await.unwrap(), "bad");
        assert_eq!(lenient.list_graphs().await.unwrap(), vec!["bad"]);
    }

    #[tokio::test]
    async fn test_tool_registered_after_construction() {
        let engine = engine();
        engine
            .tools()
            .write()
            .await
            .register_fn("triple", |s: State| async move {
                let n = s.get("n").and_then(serde_json::Value::as_i64).unwrap_or(0);
                flowrun_test_utils::ok(json!({"n": n * 3}))
            })
            .unwrap();
        engine
            .create_graph("g", linear_graph(&["A"], "triple"))
            .await
            .unwrap();

        let run = engine.run_graph("g", state(json!({"n": 2}))).await.unwrap();
        assert_eq!(run.state["n"], json!(6));
        assert!(engine.tool_names().await.contains(&"triple".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_sync_run_still_finishes() {
        let engine = engine();
        engine
            .create_graph("g", linear_graph(&["slow"], "sleepy"))
            .await
            .unwrap();

        let timed_out = tokio::time::timeout(
            Duration::from_millis(50),
            engine.run_graph("g", State::new()),
        )
        .await;
        assert!(timed_out.is_err());
        assert_eq!(engine.active_runs(), 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(engine.active_runs(), 0);

        let runs = engine.list_runs().await.unwrap();
        assert_eq!(runs.len(), 1);
        let run = engine.get_run_state(&runs[0]).await.unwrap();
        assert!(run.done);
        assert_eq!(run.outcome, Some(RunOutcome::Completed));
        assert_eq!(run.state["slept"], json!(true));
        assert!(engine.streams().is_closed(&runs[0]));
    }

    #[tokio::test]
    async fn test_panicking_tool_fails_sync_run() {
        let engine = engine();
        let graph = GraphDef::new(
            "first",
            vec![
                NodeDef::new("first", "double").with_next("boom"),
                NodeDef::new("boom", "panicking"),
            ],
        );
        engine.create_graph("g", graph).await.unwrap();

        let err = engine
            .run_graph("g", state(json!({"n": 2})))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::RunPanicked(_)));
        assert!(err.to_string().contains("tool blew up"));

        let runs = engine.list_runs().await.unwrap();
        let run = engine.get_run_state(&runs[0]).await.unwrap();
        assert!(run.done);
        // Progress saved before the panic is kept.
        assert_eq!(run.visited(), vec!["first"]);
        assert_eq!(run.state["n"], json!(4));
        assert!(matches!(run.outcome, Some(RunOutcome::Failed { .. })));
        assert_eq!(engine.active_runs(), 0);
    }

    #[tokio::test]
    async fn test_panicking_tool_closes_background_stream() {
        let engine = engine();
        engine
            .create_graph("g", linear_graph(&["boom"], "panicking"))
            .await
            .unwrap();

        let (run_id, subscription) = engine
            .start_background_subscribed("g", State::new())
            .await
            .unwrap();
        let events = subscription.collect().await;
        match events.last() {
            Some(LogEvent::Completed(completion)) => match &completion.outcome {
                RunOutcome::Failed { error } => assert!(error.contains("tool blew up")),
                other => panic!("expected Failed, got {other:?}"),
            },
            other => panic!("expected completion, got {other:?}"),
        }

        let run = engine.get_run_state(&run_id).await.unwrap();
        assert!(run.done);
        assert_eq!(engine.active_runs(), 0);
    }

    #[tokio::test]
    async fn test_cancel_before_first_step_runs_no_tool() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut tools = fake_tools();
        counting_tool(&mut tools, "counted", counter.clone());
        let engine = Engine::in_memory(EngineConfig::default(), tools);
        engine
            .create_graph("g", linear_graph(&["A", "B"], "counted"))
            .await
            .unwrap();

        let (run_id, subscription) = engine
            .start_background_subscribed("g", State::new())
            .await
            .unwrap();
        assert!(engine.cancel_run(&run_id).await.unwrap());

        let events = subscription.collect().await;
        assert_eq!(
            events,
            vec![LogEvent::Completed(Completion::new(RunOutcome::Cancelled))]
        );
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        // Uncancelled, the same graph calls the tool once per node.
        engine.run_graph("g", State::new()).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
