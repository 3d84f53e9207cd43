//! Transient events emitted while a run is in progress.
//!
//! Events are never persisted; the message history is the durable record.
//! A streaming consumer sees, per response:
//!
//! ```text
//! PartStart(0) ─ PartDelta(0)* ─ PartStart(1) ─ FinalResult ─ PartDelta(1)* …
//! ```
//!
//! and, between responses, one `FunctionToolCall` / `FunctionToolResult`
//! pair for every dispatched tool call.
//!
//! Part indices are scoped to a single response: they restart at zero for
//! every response and name the same part for its whole life.

use serde::{Deserialize, Serialize};

use crate::messages::{
    ModelRequestPart, ModelResponsePart, RetryPromptPart, ThinkingPart, ToolCallPart,
    ToolReturnPart,
};

/// Incremental text for a [`TextPart`](crate::messages::TextPart).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPartDelta {
    /// Text to append.
    pub content_delta: String,
}

/// Incremental reasoning for a [`ThinkingPart`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ThinkingPartDelta {
    /// Reasoning text to append.
    pub content_delta: Option<String>,
    /// Replaces the signature when present. Backends send the full
    /// signature once, at the end of the part.
    pub signature_delta: Option<String>,
}

/// Incremental data for a [`ToolCallPart`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ToolCallPartDelta {
    /// Tool name text to append.
    pub tool_name_delta: Option<String>,
    /// Argument JSON text to append.
    pub args_delta: Option<String>,
    /// Sets the call id when present.
    pub tool_call_id: Option<String>,
}

/// A delta against a previously started part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "part_delta_kind", rename_all = "kebab-case")]
pub enum PartDelta {
    /// Applies to a text part.
    Text(TextPartDelta),
    /// Applies to a thinking part.
    Thinking(ThinkingPartDelta),
    /// Applies to a tool call part.
    ToolCall(ToolCallPartDelta),
}

/// A delta was applied to a part of a different kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot apply a {delta} delta to a {part} part")]
pub struct DeltaMismatch {
    /// Kind of the delta.
    pub delta: &'static str,
    /// Kind of the part.
    pub part: &'static str,
}

impl PartDelta {
    /// Short name of the variant.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Thinking(_) => "thinking",
            Self::ToolCall(_) => "tool-call",
        }
    }

    /// Applies the delta to `part` in place.
    ///
    /// Fails without modifying `part` if the kinds don't match.
    pub fn apply(&self, part: &mut ModelResponsePart) -> Result<(), DeltaMismatch> {
        match (self, part) {
            (Self::Text(delta), ModelResponsePart::Text(text)) => {
                text.content.push_str(&delta.content_delta);
            }
            (Self::Thinking(delta), ModelResponsePart::Thinking(thinking)) => {
                apply_thinking(delta, thinking);
            }
            (Self::ToolCall(delta), ModelResponsePart::ToolCall(call)) => {
                apply_tool_call(delta, call);
            }
            (delta, part) => {
                return Err(DeltaMismatch {
                    delta: delta.kind_name(),
                    part: part.kind_name(),
                });
            }
        }
        Ok(())
    }
}

fn apply_thinking(delta: &ThinkingPartDelta, part: &mut ThinkingPart) {
    if let Some(content) = &delta.content_delta {
        part.content.push_str(content);
    }
    if let Some(signature) = &delta.signature_delta {
        part.signature = Some(signature.clone());
    }
}

fn apply_tool_call(delta: &ToolCallPartDelta, part: &mut ToolCallPart) {
    if let Some(name) = &delta.tool_name_delta {
        part.tool_name.push_str(name);
    }
    if let Some(args) = &delta.args_delta {
        part.args.push_str(args);
    }
    if let Some(id) = &delta.tool_call_id {
        part.tool_call_id.clone_from(id);
    }
}

/// The outcome of one function tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "part_kind", rename_all = "kebab-case")]
pub enum ToolResultPart {
    /// The tool returned a value.
    ToolReturn(ToolReturnPart),
    /// The model must try again.
    RetryPrompt(RetryPromptPart),
}

impl ToolResultPart {
    /// The call id this result answers.
    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            Self::ToolReturn(part) => Some(&part.tool_call_id),
            Self::RetryPrompt(part) => part.tool_call_id.as_deref(),
        }
    }

    /// The tool name this result answers.
    pub fn tool_name(&self) -> Option<&str> {
        match self {
            Self::ToolReturn(part) => Some(&part.tool_name),
            Self::RetryPrompt(part) => part.tool_name.as_deref(),
        }
    }

    /// Returns `true` for a retry.
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::RetryPrompt(_))
    }
}

impl From<ToolResultPart> for ModelRequestPart {
    fn from(part: ToolResultPart) -> Self {
        match part {
            ToolResultPart::ToolReturn(p) => Self::ToolReturn(p),
            ToolResultPart::RetryPrompt(p) => Self::RetryPrompt(p),
        }
    }
}

/// Everything a streaming consumer can observe during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_kind", rename_all = "snake_case")]
pub enum AgentStreamEvent {
    /// A new part began; `part` holds its content so far.
    PartStart {
        /// Index of the part within the current response.
        index: usize,
        /// The part as first received.
        part: ModelResponsePart,
    },
    /// More content for an already started part.
    PartDelta {
        /// Index of the part within the current response.
        index: usize,
        /// The increment.
        delta: PartDelta,
    },
    /// The output policy matched a final result in the current response.
    ///
    /// For tool output, names the output tool call; for text-based output
    /// both fields are `None`. Emitted at most once per response.
    FinalResult {
        /// Output tool name, if the result came from a tool call.
        tool_name: Option<String>,
        /// Output tool call id, if the result came from a tool call.
        tool_call_id: Option<String>,
    },
    /// A function tool is about to run.
    FunctionToolCall {
        /// The call being dispatched.
        part: ToolCallPart,
    },
    /// A function tool finished.
    FunctionToolResult {
        /// Its return or retry part.
        result: ToolResultPart,
    },
}

impl AgentStreamEvent {
    /// Part index for `PartStart`/`PartDelta`, `None` otherwise.
    pub fn part_index(&self) -> Option<usize> {
        match self {
            Self::PartStart { index, .. } | Self::PartDelta { index, .. } => Some(*index),
            _ => None,
        }
    }
}
