//! # parley
//!
//! A conversation-drive engine for LLM backends. An [`Agent`] sends a
//! prompt to a model, runs the tools the model asks for, validates the
//! model's answer against an output policy, and keeps asking until it has
//! an acceptable output or a budget runs out.
//!
//! The message model, usage accounting and the [`Model`](parley_core::Model)
//! contract live in [`parley_core`]; this crate only drives conversations.
//!
//! # Architecture
//!
//! ```text
//!        ┌──────────────────────────────────────────────┐
//!        │                    Agent                     │
//!        │   run() · iter() · run_stream_events()       │
//!        └──────────────────────┬───────────────────────┘
//!                               ▼
//!        ┌──────────────────────────────────────────────┐
//!        │        AgentRun (node state machine)         │
//!        └───────┬──────────────┬───────────────┬───────┘
//!                ▼              ▼               ▼
//!        ┌─────────────┐ ┌─────────────┐ ┌─────────────┐
//!        │  DynModel   │ │ ToolRegistry│ │ OutputSpec  │
//!        │ (provider)  │ │ + dispatch  │ │ (policies)  │
//!        └─────────────┘ └─────────────┘ └─────────────┘
//! ```
//!
//! # Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use parley::{Agent, OutputSpec, OutputVariant, RunOptions};
//!
//! #[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
//! struct CityLocation {
//!     city: String,
//!     country: String,
//! }
//!
//! let agent = Agent::builder(model)
//!     .output(OutputSpec::tool(OutputVariant::<CityLocation>::of()?))
//!     .build();
//! let result = agent.run("Where were the olympics held in 2012?", RunOptions::default()).await?;
//! assert_eq!(result.output.city, "London");
//! ```
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`agent`] | [`Agent`], its builder, and the [`AgentRun`] state machine |
//! | [`tool`] | Tool handlers, the registry and [`ModelRetry`] |
//! | [`output`] | Text, tool, native and prompted output policies |
//! | [`context`] | The [`RunContext`] handed to tools and validators |
//! | [`error`] | [`RunError`] and the error taxonomy |

#![warn(missing_docs)]

pub mod agent;
pub mod context;
pub mod error;
pub mod output;
pub mod tool;

pub use agent::{
    Agent, AgentBuilder, AgentConfig, AgentRun, AgentRunResult, EndStrategy, NodeEvents, NodeKind,
    OutputValidator, Prompt, RunEvent, RunOptions,
};
pub use context::RunContext;
pub use error::{ErrorClass, RunError, RunErrorKind};
pub use output::{OutputError, OutputSpec, OutputVariant};
pub use tool::{ModelRetry, ToolError, ToolRegistry};
