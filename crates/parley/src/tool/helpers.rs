//! Helper functions for creating tool handlers.

use std::future::Future;
use std::marker::PhantomData;

use parley_core::ToolDefinition;
use serde_json::Value;

use super::{FnToolHandler, NoCtxToolHandler, ToolError, ToolOutput};
use crate::context::RunContext;

/// Creates a [`ToolHandler`](super::ToolHandler) from a closure that only
/// needs the arguments.
///
/// The closure returns `Result<impl Into<ToolOutput>, ToolError>`, so
/// returning a `String` or a `serde_json::Value` works directly.
///
/// ```rust
/// use parley::tool::{tool_fn, ToolError};
/// use parley_core::{JsonSchema, ToolDefinition};
/// use serde_json::{json, Value};
///
/// let handler = tool_fn(
///     ToolDefinition::new(
///         "get_capital",
///         "Get the capital of a country",
///         JsonSchema::new(json!({
///             "type": "object",
///             "properties": {"country": {"type": "string"}},
///             "required": ["country"]
///         })),
///     ),
///     |args: Value| async move {
///         match args["country"].as_str() {
///             Some("France") => Ok("Paris".to_owned()),
///             _ => Err(ToolError::retry("The country is not supported.")),
///         }
///     },
/// );
/// ```
pub fn tool_fn<F, Fut, O>(definition: ToolDefinition, handler: F) -> NoCtxToolHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, ToolError>> + Send + 'static,
    O: Into<ToolOutput> + Send + 'static,
{
    NoCtxToolHandler {
        definition,
        handler,
        max_retries: None,
    }
}

/// Creates a [`ToolHandler<Deps>`](super::ToolHandler) from a closure that
/// receives the [`RunContext`].
///
/// The closure's future must be `'static`: clone what you need out of the
/// context before the `async move` block.
///
/// ```rust
/// use parley::tool::tool_fn_with_ctx;
/// use parley::RunContext;
/// use parley_core::{JsonSchema, ToolDefinition};
/// use serde_json::Value;
///
/// struct Db {
///     country: String,
/// }
///
/// let handler = tool_fn_with_ctx(
///     ToolDefinition::new("get_user_country", "The user's country", JsonSchema::any_object()),
///     |_args: Value, ctx: &RunContext<Db>| {
///         let country = ctx.deps.country.clone();
///         async move { Ok(country) }
///     },
/// );
/// ```
pub fn tool_fn_with_ctx<Deps, F, Fut, O>(
    definition: ToolDefinition,
    handler: F,
) -> FnToolHandler<Deps, F>
where
    Deps: Send + Sync + 'static,
    F: for<'c> Fn(Value, &'c RunContext<Deps>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, ToolError>> + Send + 'static,
    O: Into<ToolOutput> + Send + 'static,
{
    FnToolHandler {
        definition,
        handler,
        max_retries: None,
        _deps: PhantomData,
    }
}
