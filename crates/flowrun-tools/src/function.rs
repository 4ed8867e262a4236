use std::future::Future;

use futures::future::BoxFuture;

use flowrun_core::error::Result;
use flowrun_core::state::State;
use flowrun_core::traits::Tool;

/// A tool backed by an async closure.
pub struct FnTool<F> {
    name: String,
    description: String,
    func: F,
}

impl<F, Fut> FnTool<F>
where
    F: Fn(State) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<State>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            func,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl<F, Fut> Tool for FnTool<F>
where
    F: Fn(State) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<State>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn call(&self, state: State) -> BoxFuture<'_, Result<State>> {
        Box::pin((self.func)(state))
    }
}
