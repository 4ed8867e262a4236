//! Fake tools and graph fixtures shared by the flowrun test suites.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use flowrun_core::config::EngineConfig;
use flowrun_core::error::{FlowError, Result};
use flowrun_core::graph::{GraphDef, NodeDef};
use flowrun_core::state::State;
use flowrun_tools::ToolRegistry;

/// Build a state from a JSON object literal. Panics on non-objects.
pub fn state(value: Value) -> State {
    match value {
        Value::Object(map) => map,
        other => panic!("state fixture must be a JSON object, got {other}"),
    }
}

/// `Ok` partial state from a JSON object literal.
pub fn ok(value: Value) -> Result<State> {
    Ok(state(value))
}

/// Engine config with a small step bound, for loop tests.
pub fn config_with_max_steps(max_steps: usize) -> EngineConfig {
    EngineConfig {
        max_steps,
        ..EngineConfig::default()
    }
}

/// Registry with the fake tools:
///
/// - `double`: `{n: n * 2}`
/// - `increment`: `{count: count + 1, reached: count + 1 >= target}`
/// - `noop`: `{}`
/// - `set_a` / `set_b`: `{a: true}` / `{b: true}`
/// - `failing`: returns a tool error
/// - `sleepy`: sleeps 200ms, then `{slept: true}`
/// - `panicking`: panics unless `survive` is truthy
pub fn fake_tools() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry
        .register_fn("double", |s: State| async move {
            let n = s.get("n").and_then(Value::as_i64).unwrap_or(0);
            ok(json!({ "n": n * 2 }))
        })
        .unwrap();
    registry
        .register_fn("increment", |s: State| async move {
            let count = s.get("count").and_then(Value::as_i64).unwrap_or(0) + 1;
            let target = s.get("target").and_then(Value::as_i64).unwrap_or(i64::MAX);
            ok(json!({ "count": count, "reached": count >= target }))
        })
        .unwrap();
    registry
        .register_fn("noop", |_s: State| async move { ok(json!({})) })
        .unwrap();
    registry
        .register_fn("set_a", |_s: State| async move { ok(json!({ "a": true })) })
        .unwrap();
    registry
        .register_fn("set_b", |_s: State| async move { ok(json!({ "b": true })) })
        .unwrap();
    registry
        .register_fn("failing", |_s: State| async move {
            Err::<State, _>(FlowError::tool_failed("failing", "boom"))
        })
        .unwrap();
    registry
        .register_fn("sleepy", |_s: State| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            ok(json!({ "slept": true }))
        })
        .unwrap();
    registry
        .register_fn("panicking", |s: State| async move {
            if !s.get("survive").and_then(Value::as_bool).unwrap_or(false) {
                panic!("tool blew up");
            }
            ok(json!({}))
        })
        .unwrap();
    registry
}

/// Register a tool that counts its invocations into `counter`.
pub fn counting_tool(registry: &mut ToolRegistry, name: &str, counter: Arc<AtomicUsize>) {
    registry
        .register_fn(name, move |_s: State| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                ok(json!({}))
            }
        })
        .unwrap();
}

/// `names[0] -> names[1] -> ...`, every node backed by `tool`.
pub fn linear_graph(names: &[&str], tool: &str) -> GraphDef {
    let nodes = names.iter().enumerate().map(|(i, name)| {
        let node = NodeDef::new(*name, tool);
        match names.get(i + 1) {
            Some(next) => node.with_next(*next),
            None => node,
        }
    });
    GraphDef::new(names.first().copied().unwrap_or_default(), nodes)
}

/// `A(double) -> B(double)`.
pub fn double_twice_graph() -> GraphDef {
    linear_graph(&["A", "B"], "double")
}

/// A single `increment` node looping until `reached` is truthy.
pub fn counting_loop_graph() -> GraphDef {
    GraphDef::new(
        "count",
        vec![NodeDef::new("count", "increment").with_loop_condition("reached")],
    )
}
