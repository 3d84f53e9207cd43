//! Function tools.
//!
//! # Architecture
//!
//! ```text
//!   ToolHandler     - one tool: definition + async execute
//!       │
//!   ToolRegistry    - the agent's tools, in registration order
//!       │
//!   ToolDispatch    - runs one response's calls (concurrently or in
//!                     sequence) and settles them in call order
//! ```
//!
//! Handlers receive arguments that already passed schema validation,
//! together with a [`RunContext`](crate::RunContext). A handler that wants
//! the model to try again returns [`ToolError::Retry`]; the engine turns it
//! into a retry prompt and charges the tool's retry budget. Any other error
//! ends the run.
//!
//! # Example
//!
//! ```rust
//! use parley::tool::{ToolError, ToolRegistry};
//! use parley::RunContext;
//! use parley_core::JsonSchema;
//! use serde_json::{json, Value};
//!
//! let mut tools: ToolRegistry<()> = ToolRegistry::new();
//! tools.register(
//!     "get_capital",
//!     "Get the capital of a country",
//!     JsonSchema::new(json!({
//!         "type": "object",
//!         "properties": {"country": {"type": "string"}},
//!         "required": ["country"]
//!     })),
//!     |args: Value, _ctx: &RunContext<()>| async move {
//!         match args["country"].as_str() {
//!             Some("France") => Ok("Paris"),
//!             _ => Err(ToolError::retry("The country is not supported.")),
//!         }
//!     },
//! );
//! assert_eq!(tools.names(), ["get_capital"]);
//! ```

pub(crate) mod dispatch;
mod error;
mod handler;
mod helpers;
mod output;
mod registry;

pub use error::{ModelRetry, ToolError};
pub use handler::{FnToolHandler, NoCtxToolHandler, ToolFuture, ToolHandler};
pub use helpers::{tool_fn, tool_fn_with_ctx};
pub use output::ToolOutput;
pub use registry::ToolRegistry;
