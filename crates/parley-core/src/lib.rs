//! # parley-core
//!
//! The shared vocabulary between the [`parley`](https://docs.rs/parley)
//! engine and model backends: the message model, streaming events, usage
//! accounting, and the [`Model`] contract every adapter implements.
//!
//! Nothing here drives a conversation. The engine lives in `parley`;
//! adapters live in their own crates and only depend on this one.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐ ┌──────────────┐ ┌──────────────┐
//!  │   adapter    │ │   adapter    │ │ FunctionModel│
//!  └──────┬───────┘ └──────┬───────┘ └──────┬───────┘
//!         └────────────┬───┴────────────────┘
//!                      ▼
//!        ┌───────────────────────────────┐
//!        │          parley-core          │  ← you are here
//!        │ (Model trait, messages, usage)│
//!        └───────────────┬───────────────┘
//!                        ▼
//!        ┌───────────────────────────────┐
//!        │            parley             │
//!        │  (Agent, tools, output modes) │
//!        └───────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`messages`] | Requests, responses and their parts; history serialization |
//! | [`events`] | Part deltas and the streamed event vocabulary |
//! | [`parts_manager`] | Assembles streamed deltas into response parts |
//! | [`stream`] | Adapter chunk streams and [`StreamedResponse`] |
//! | [`usage`] | Token counts and [`UsageLimits`] |
//! | [`settings`] | Layered [`ModelSettings`] |
//! | [`provider`] | The [`Model`] trait, profiles and request parameters |
//! | [`function`] | [`FunctionModel`], an in-process model backed by closures |
//! | [`registry`] | Building models from `"provider:model"` configuration |
//! | [`error`] | [`ModelError`] |

#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod function;
pub mod messages;
pub mod parts_manager;
pub mod provider;
pub mod registry;
pub mod settings;
pub mod stream;
pub mod usage;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_helpers;

// ── Core re-exports ────────────────────────────────────────────────
//
// Only the types nearly every program touches live at the root:
//
//   parley_core::messages::*  - individual part types, FinishReason
//   parley_core::events::*    - PartDelta, ToolResultPart
//   parley_core::provider::*  - profiles, tool and output definitions
//   parley_core::stream::*    - StreamChunk, ChunkStream
//   parley_core::registry::*  - ModelRegistry, ModelFactory
//   parley_core::mock::*      - MockModel (test-utils feature)

pub use error::ModelError;
pub use events::AgentStreamEvent;
pub use function::{AgentInfo, FunctionModel};
pub use messages::{
    ModelMessage, ModelRequest, ModelRequestPart, ModelResponse, ModelResponsePart, ToolCallPart,
};
pub use provider::{
    DynModel, JsonSchema, Model, ModelMetadata, ModelProfile, ModelRequestParameters, OutputMode,
    ToolDefinition,
};
pub use settings::{ModelSettings, SettingsExtension};
pub use stream::StreamedResponse;
pub use usage::{RequestUsage, RunUsage, UsageLimitExceeded, UsageLimits};
