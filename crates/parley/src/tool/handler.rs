//! Tool handler trait and implementations.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use parley_core::ToolDefinition;
use serde_json::Value;

use super::{ToolError, ToolOutput};
use crate::context::RunContext;

/// Boxed future returned by [`ToolHandler::execute`].
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = Result<ToolOutput, ToolError>> + Send + 'a>>;

/// A single tool the model can call.
///
/// Implement this trait for tools that carry their own state. For simple
/// tools, use [`super::tool_fn`] or [`super::tool_fn_with_ctx`] to wrap a
/// closure.
///
/// The trait is object-safe (it returns boxed futures) so handlers can be
/// stored as `Arc<dyn ToolHandler<Deps>>`.
///
/// # Example
///
/// ```rust
/// use parley::tool::{ToolError, ToolFuture, ToolHandler, ToolOutput};
/// use parley::RunContext;
/// use parley_core::{JsonSchema, ToolDefinition};
/// use serde_json::{json, Value};
///
/// struct Session {
///     user_id: String,
/// }
///
/// struct WhoAmI;
///
/// impl ToolHandler<Session> for WhoAmI {
///     fn definition(&self) -> ToolDefinition {
///         ToolDefinition::new("whoami", "Current user id", JsonSchema::any_object())
///     }
///
///     fn execute<'a>(&'a self, _args: Value, ctx: &'a RunContext<Session>) -> ToolFuture<'a> {
///         Box::pin(async move { Ok(ToolOutput::from(ctx.deps.user_id.clone())) })
///     }
/// }
/// ```
pub trait ToolHandler<Deps = ()>: Send + Sync {
    /// The tool's name, description and argument schema.
    fn definition(&self) -> ToolDefinition;

    /// Retry budget for this tool; `None` uses the agent's `retries`.
    fn max_retries(&self) -> Option<u32> {
        None
    }

    /// Runs the tool with arguments that already passed schema validation.
    fn execute<'a>(&'a self, args: Value, ctx: &'a RunContext<Deps>) -> ToolFuture<'a>;
}

/// A tool handler backed by an async closure that receives the run context.
///
/// Created via [`super::tool_fn_with_ctx`].
pub struct FnToolHandler<Deps, F> {
    pub(crate) definition: ToolDefinition,
    pub(crate) handler: F,
    pub(crate) max_retries: Option<u32>,
    pub(crate) _deps: PhantomData<fn(&Deps)>,
}

impl<Deps, F> FnToolHandler<Deps, F> {
    /// Overrides the agent-wide retry budget for this tool.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

impl<Deps, F> std::fmt::Debug for FnToolHandler<Deps, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnToolHandler")
            .field("name", &self.definition.name)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl<Deps, F, Fut, O> ToolHandler<Deps> for FnToolHandler<Deps, F>
where
    Deps: Send + Sync + 'static,
    F: for<'c> Fn(Value, &'c RunContext<Deps>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O, ToolError>> + Send + 'static,
    O: Into<ToolOutput> + Send + 'static,
{
    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    fn execute<'a>(&'a self, args: Value, ctx: &'a RunContext<Deps>) -> ToolFuture<'a> {
        let fut = (self.handler)(args, ctx);
        Box::pin(async move { fut.await.map(Into::into) })
    }
}

/// A tool handler that ignores the run context, created by
/// [`super::tool_fn`].
pub struct NoCtxToolHandler<F> {
    pub(crate) definition: ToolDefinition,
    pub(crate) handler: F,
    pub(crate) max_retries: Option<u32>,
}

impl<F> NoCtxToolHandler<F> {
    /// Overrides the agent-wide retry budget for this tool.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

impl<F> std::fmt::Debug for NoCtxToolHandler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoCtxToolHandler")
            .field("name", &self.definition.name)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl<Deps, F, Fut, O> ToolHandler<Deps> for NoCtxToolHandler<F>
where
    Deps: Send + Sync + 'static,
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O, ToolError>> + Send + 'static,
    O: Into<ToolOutput> + Send + 'static,
{
    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    fn execute<'a>(&'a self, args: Value, _ctx: &'a RunContext<Deps>) -> ToolFuture<'a> {
        let fut = (self.handler)(args);
        Box::pin(async move { fut.await.map(Into::into) })
    }
}
