//! The conversation engine.
//!
//! An [`Agent`] is an immutable, cheaply cloneable definition: a model,
//! prompts, tools, an output policy and retry settings. Each call to
//! [`run`](Agent::run), [`iter`](Agent::iter) or
//! [`run_stream_events`](Agent::run_stream_events) starts an independent
//! [`AgentRun`] that owns its history and usage.
//!
//! ```rust,ignore
//! use parley::{Agent, RunOptions};
//!
//! let agent = Agent::builder(model)
//!     .system_prompt("Be concise.")
//!     .build();
//! let result = agent.run("Where does the Eiffel tower stand?", RunOptions::default()).await?;
//! println!("{}", result.output);
//! ```

mod config;
mod graph;
mod result;
mod stream;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::Stream;
use parley_core::provider::BuiltinTool;
use parley_core::{DynModel, JsonSchema, ModelSettings, UsageLimits};
use serde_json::Value;
use tracing::warn;

use crate::context::RunContext;
use crate::error::RunError;
use crate::output::OutputSpec;
use crate::tool::{ModelRetry, ToolError, ToolHandler, ToolOutput, ToolRegistry};

pub use config::{AgentConfig, EndStrategy, Prompt, RunOptions};
pub use graph::{AgentRun, NodeEvents, NodeKind};
pub use result::AgentRunResult;
pub use stream::RunEvent;

/// Checks or rewrites an accepted output; returning [`ModelRetry`] sends
/// the model back for another attempt.
pub type OutputValidator<Deps, O> =
    Arc<dyn Fn(O, &RunContext<Deps>) -> Result<O, ModelRetry> + Send + Sync>;

pub(crate) struct AgentInner<Deps, O> {
    pub(crate) model: Arc<dyn DynModel>,
    pub(crate) name: Option<String>,
    pub(crate) system_prompts: Vec<String>,
    pub(crate) instructions: Option<String>,
    pub(crate) tools: ToolRegistry<Deps>,
    pub(crate) builtin_tools: Vec<BuiltinTool>,
    pub(crate) output: OutputSpec<O>,
    pub(crate) validators: Vec<OutputValidator<Deps, O>>,
    pub(crate) config: AgentConfig,
    pub(crate) model_settings: ModelSettings,
    pub(crate) usage_limits: UsageLimits,
}

/// A reusable agent definition.
///
/// `Deps` is the dependency type tools and validators receive through
/// [`RunContext`]; `O` is the output type.
pub struct Agent<Deps = (), O = String> {
    inner: Arc<AgentInner<Deps, O>>,
}

impl<Deps, O> Clone for Agent<Deps, O> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Deps, O> fmt::Debug for Agent<Deps, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.inner.name)
            .field("model", &self.inner.model.metadata().model_name)
            .field("tools", &self.inner.tools.names())
            .field("output", &self.inner.output)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Starts building an agent without dependencies and with text output.
    pub fn builder(model: Arc<dyn DynModel>) -> AgentBuilder {
        AgentBuilder::new(model)
    }
}

impl<Deps, O> Agent<Deps, O>
where
    Deps: Send + Sync + 'static,
    O: Send + 'static,
{
    /// The agent's name, if it has one.
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// The agent's retry and dispatch policy.
    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    /// The registered function tools.
    pub fn tools(&self) -> &ToolRegistry<Deps> {
        &self.inner.tools
    }

    /// Starts a run to be driven node by node.
    pub fn iter(&self, prompt: impl Into<Prompt>, options: RunOptions<Deps>) -> AgentRun<Deps, O> {
        AgentRun::new(Arc::clone(&self.inner), prompt.into(), options)
    }

    /// Runs to completion with whole (non-streamed) responses.
    #[tracing::instrument(skip_all, fields(agent = ?self.inner.name))]
    pub async fn run(
        &self,
        prompt: impl Into<Prompt>,
        options: RunOptions<Deps>,
    ) -> Result<AgentRunResult<O>, RunError> {
        let mut run = self.iter(prompt, options);
        while run.next().await? != NodeKind::End {}
        run.into_result()
    }

    /// Runs to completion with streamed responses, yielding every event
    /// and then [`RunEvent::Done`].
    pub fn run_stream_events(
        &self,
        prompt: impl Into<Prompt>,
        options: RunOptions<Deps>,
    ) -> impl Stream<Item = Result<RunEvent<O>, RunError>> + Send + 'static {
        stream::into_event_stream(self.iter(prompt, options))
    }
}

// ── Builder ─────────────────────────────────────────────────────────

/// Builds an [`Agent`].
///
/// Output validators belong to an output type, so register them after
/// [`output`](Self::output).
#[must_use]
pub struct AgentBuilder<Deps = (), O = String> {
    model: Arc<dyn DynModel>,
    name: Option<String>,
    system_prompts: Vec<String>,
    instructions: Option<String>,
    tools: ToolRegistry<Deps>,
    builtin_tools: Vec<BuiltinTool>,
    output: OutputSpec<O>,
    validators: Vec<OutputValidator<Deps, O>>,
    config: AgentConfig,
    model_settings: ModelSettings,
    usage_limits: UsageLimits,
}

impl<Deps> AgentBuilder<Deps, String>
where
    Deps: Send + Sync + 'static,
{
    /// Starts a builder for agents with dependencies of type `Deps`.
    pub fn new(model: Arc<dyn DynModel>) -> Self {
        Self {
            model,
            name: None,
            system_prompts: Vec::new(),
            instructions: None,
            tools: ToolRegistry::new(),
            builtin_tools: Vec::new(),
            output: OutputSpec::text(),
            validators: Vec::new(),
            config: AgentConfig::default(),
            model_settings: ModelSettings::default(),
            usage_limits: UsageLimits::default(),
        }
    }
}

impl<Deps, O> AgentBuilder<Deps, O>
where
    Deps: Send + Sync + 'static,
    O: Send + 'static,
{
    /// Names the agent, for logs.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Adds a system prompt. System prompts are only sent at the start of
    /// a conversation, never when continuing a history.
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompts.push(prompt.into());
        self
    }

    /// Sets instructions, sent with every request of every run.
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Registers a closure as a function tool.
    pub fn tool<F, Fut, T>(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        schema: JsonSchema,
        handler: F,
    ) -> Self
    where
        F: for<'c> Fn(Value, &'c RunContext<Deps>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ToolError>> + Send + 'static,
        T: Into<ToolOutput> + Send + 'static,
    {
        self.tools.register(name, description, schema, handler);
        self
    }

    /// Registers a tool handler.
    pub fn tool_handler(mut self, handler: impl ToolHandler<Deps> + 'static) -> Self {
        self.tools.register_handler(handler);
        self
    }

    /// Replaces the tool registry wholesale.
    pub fn tools(mut self, tools: ToolRegistry<Deps>) -> Self {
        self.tools = tools;
        self
    }

    /// Enables a tool the provider runs itself.
    pub fn builtin_tool(mut self, tool: BuiltinTool) -> Self {
        self.builtin_tools.push(tool);
        self
    }

    /// Sets the output policy, changing the output type.
    ///
    /// Validators registered earlier belong to the old output type and are
    /// dropped.
    pub fn output<P: Send + 'static>(self, output: OutputSpec<P>) -> AgentBuilder<Deps, P> {
        if !self.validators.is_empty() {
            warn!(
                dropped = self.validators.len(),
                "output validators registered before output() were dropped"
            );
        }
        AgentBuilder {
            model: self.model,
            name: self.name,
            system_prompts: self.system_prompts,
            instructions: self.instructions,
            tools: self.tools,
            builtin_tools: self.builtin_tools,
            output,
            validators: Vec::new(),
            config: self.config,
            model_settings: self.model_settings,
            usage_limits: self.usage_limits,
        }
    }

    /// Adds an output validator. Validators run in registration order.
    pub fn output_validator(
        mut self,
        validator: impl Fn(O, &RunContext<Deps>) -> Result<O, ModelRetry> + Send + Sync + 'static,
    ) -> Self {
        self.validators.push(Arc::new(validator));
        self
    }

    /// Default retry budget for each function tool; also the output budget
    /// unless [`output_retries`](Self::output_retries) is set.
    pub fn retries(mut self, retries: u32) -> Self {
        self.config.retries = retries;
        self
    }

    /// Retry budget for output validation.
    pub fn output_retries(mut self, retries: u32) -> Self {
        self.config.output_retries = Some(retries);
        self
    }

    /// What to do with function calls next to an accepted output call.
    pub fn end_strategy(mut self, strategy: EndStrategy) -> Self {
        self.config.end_strategy = strategy;
        self
    }

    /// Run one response's tool calls concurrently (the default) or one by
    /// one.
    pub fn parallel_tool_calls(mut self, parallel: bool) -> Self {
        self.config.parallel_tool_calls = parallel;
        self
    }

    /// Replaces the whole retry and dispatch policy.
    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Agent-level settings; each run's settings are merged over these.
    pub fn model_settings(mut self, settings: ModelSettings) -> Self {
        self.model_settings = settings;
        self
    }

    /// Default usage limits for runs that do not set their own.
    pub fn usage_limits(mut self, limits: UsageLimits) -> Self {
        self.usage_limits = limits;
        self
    }

    /// Finishes the agent.
    pub fn build(self) -> Agent<Deps, O> {
        Agent {
            inner: Arc::new(AgentInner {
                model: self.model,
                name: self.name,
                system_prompts: self.system_prompts,
                instructions: self.instructions,
                tools: self.tools,
                builtin_tools: self.builtin_tools,
                output: self.output,
                validators: self.validators,
                config: self.config,
                model_settings: self.model_settings,
                usage_limits: self.usage_limits,
            }),
        }
    }
}

impl<Deps, O> fmt::Debug for AgentBuilder<Deps, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentBuilder")
            .field("name", &self.name)
            .field("system_prompts", &self.system_prompts.len())
            .field("tools", &self.tools.names())
            .field("validators", &self.validators.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
