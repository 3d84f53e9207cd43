//! Per-call view of a run, handed to tools and output validators.

use std::fmt;
use std::sync::Arc;

use parley_core::RunUsage;

/// What a tool or validator can see of the run that invoked it.
///
/// `deps` is the caller's dependency value, shared by every call in the
/// run. Everything else is a snapshot taken when the call was scheduled.
pub struct RunContext<Deps> {
    /// Caller-supplied dependencies.
    pub deps: Arc<Deps>,
    /// Usage as of the response that requested this call.
    pub usage: RunUsage,
    /// Name of the model driving the run.
    pub model_name: String,
    /// The run's user prompt, if it was plain text.
    pub prompt: Option<String>,
    /// How many times this tool (or the output) has been retried so far.
    pub retry: u32,
    /// The retry budget that applies to this call.
    pub max_retries: u32,
    /// Name of the tool being called, if any.
    pub tool_name: Option<String>,
    /// Id of the tool call being answered, if any.
    pub tool_call_id: Option<String>,
    /// Number of requests sent so far, counting the current one.
    pub run_step: u32,
}

impl<Deps> RunContext<Deps> {
    /// The caller's dependencies.
    pub fn deps(&self) -> &Deps {
        &self.deps
    }

    /// Returns `true` if a retry request from this call would end the run.
    pub fn last_attempt(&self) -> bool {
        self.retry >= self.max_retries
    }

    /// Returns a copy scoped to one tool call.
    #[must_use]
    pub(crate) fn for_tool(&self, tool_name: &str, tool_call_id: &str, retry: u32, max_retries: u32) -> Self {
        Self {
            tool_name: Some(tool_name.to_owned()),
            tool_call_id: Some(tool_call_id.to_owned()),
            retry,
            max_retries,
            ..self.clone()
        }
    }
}

impl<Deps> Clone for RunContext<Deps> {
    fn clone(&self) -> Self {
        Self {
            deps: Arc::clone(&self.deps),
            usage: self.usage.clone(),
            model_name: self.model_name.clone(),
            prompt: self.prompt.clone(),
            retry: self.retry,
            max_retries: self.max_retries,
            tool_name: self.tool_name.clone(),
            tool_call_id: self.tool_call_id.clone(),
            run_step: self.run_step,
        }
    }
}

impl<Deps> fmt::Debug for RunContext<Deps> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("model_name", &self.model_name)
            .field("usage", &self.usage)
            .field("retry", &self.retry)
            .field("max_retries", &self.max_retries)
            .field("tool_name", &self.tool_name)
            .field("tool_call_id", &self.tool_call_id)
            .field("run_step", &self.run_step)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) fn test_context<Deps>(deps: Deps) -> RunContext<Deps> {
    RunContext {
        deps: Arc::new(deps),
        usage: RunUsage::default(),
        model_name: "test-model".into(),
        prompt: None,
        retry: 0,
        max_retries: 1,
        tool_name: None,
        tool_call_id: None,
        run_step: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_tool_scopes_call() {
        let ctx = test_context(42_u32);
        let scoped = ctx.for_tool("lookup", "call_1", 1, 1);
        assert_eq!(*scoped.deps(), 42);
        assert_eq!(scoped.tool_name.as_deref(), Some("lookup"));
        assert!(scoped.last_attempt());
        assert!(!ctx.last_attempt());
        assert!(Arc::ptr_eq(&ctx.deps, &scoped.deps));
    }
}
