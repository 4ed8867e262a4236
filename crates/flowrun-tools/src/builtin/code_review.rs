//! Code-review workflow tools.
//!
//! They read `code` from the state and progressively add `functions`,
//! `complexity`, `issues`, `quality_score`/`quality_ok` and finally `report`.
//! Scoring is rough; each tool sleeps briefly to stand in for
//! real analysis I/O.

use std::sync::OnceLock;
use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use regex::Regex;
use serde_json::{json, Value};

use flowrun_core::error::Result;
use flowrun_core::state::State;
use flowrun_core::traits::Tool;

const SIMULATED_IO: Duration = Duration::from_millis(50);
const DEFAULT_QUALITY_THRESHOLD: i64 = 7;

fn function_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?(?:def|fn)\s+([A-Za-z_][A-Za-z0-9_]*)")
            .expect("function pattern is valid")
    })
}

/// Names of the functions defined in a source snippet (Python `def` or Rust `fn`).
pub fn extract_function_names(code: &str) -> Vec<String> {
    code.lines()
        .filter_map(|line| function_pattern().captures(line))
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Quality score on a 0..=10 scale.
pub fn quality_score(complexity: i64, issues: i64) -> i64 {
    10i64
        .saturating_sub(complexity.saturating_add(issues))
        .clamp(0, 10)
}

fn int_or(state: &State, key: &str, default: i64) -> i64 {
    state.get(key).and_then(Value::as_i64).unwrap_or(default)
}

fn partial(value: Value) -> State {
    match value {
        Value::Object(map) => map,
        _ => State::new(),
    }
}

pub struct ExtractFunctionsTool;

impl Tool for ExtractFunctionsTool {
    fn name(&self) -> &str {
        "extract_functions"
    }

    fn description(&self) -> &str {
        "List the functions defined in `code`."
    }

    fn call(&self, state: State) -> BoxFuture<'_, Result<State>> {
        Box::pin(async move {
            tokio::time::sleep(SIMULATED_IO).await;
            let code = state.get("code").and_then(Value::as_str).unwrap_or("");
            let functions = extract_function_names(code);
            Ok(partial(json!({ "functions": functions, "extracted": true })))
        })
    }
}

pub struct CheckComplexityTool;

impl Tool for CheckComplexityTool {
    fn name(&self) -> &str {
        "check_complexity"
    }

    fn description(&self) -> &str {
        "Estimate complexity from the number of extracted functions."
    }

    fn call(&self, state: State) -> BoxFuture<'_, Result<State>> {
        Box::pin(async move {
            tokio::time::sleep(SIMULATED_IO).await;
            let functions = state
                .get("functions")
                .and_then(Value::as_array)
                .map_or(0, |f| f.len() as i64);
            let factor = rand::thread_rng().gen_range(1..=5);
            let complexity = functions.saturating_mul(factor).max(1);
            Ok(partial(json!({ "complexity": complexity })))
        })
    }
}

pub struct DetectIssuesTool;

impl Tool for DetectIssuesTool {
    fn name(&self) -> &str {
        "detect_issues"
    }

    fn description(&self) -> &str {
        "Count issues found in `code`."
    }

    fn call(&self, _state: State) -> BoxFuture<'_, Result<State>> {
        Box::pin(async move {
            tokio::time::sleep(SIMULATED_IO).await;
            let issues: i64 = rand::thread_rng().gen_range(0..=4);
            Ok(partial(json!({ "issues": issues })))
        })
    }
}

pub struct SuggestImprovementsTool;

impl Tool for SuggestImprovementsTool {
    fn name(&self) -> &str {
        "suggest_improvements"
    }

    fn description(&self) -> &str {
        "Score quality from complexity and issues; sets `quality_ok` once the score meets `quality_threshold`."
    }

    fn call(&self, state: State) -> BoxFuture<'_, Result<State>> {
        Box::pin(async move {
            tokio::time::sleep(SIMULATED_IO).await;
            let score = quality_score(int_or(&state, "complexity", 5), int_or(&state, "issues", 0));
            let threshold = int_or(&state, "quality_threshold", DEFAULT_QUALITY_THRESHOLD);
            Ok(partial(json!({
                "quality_score": score,
                "quality_ok": score >= threshold,
            })))
        })
    }
}

pub struct SummarizeReviewTool;

impl Tool for SummarizeReviewTool {
    fn name(&self) -> &str {
        "summarize_review"
    }

    fn description(&self) -> &str {
        "Write a one-line review report."
    }

    fn call(&self, state: State) -> BoxFuture<'_, Result<State>> {
        Box::pin(async move {
            let functions = state
                .get("functions")
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            let report = format!(
                "{} function(s), complexity {}, {} issue(s), quality {}/10",
                functions,
                int_or(&state, "complexity", 0),
                int_or(&state, "issues", 0),
                int_or(&state, "quality_score", 0),
            );
            Ok(partial(json!({ "report": report })))
        })
    }
}
