//! Conversation messages and the parts they carry.
//!
//! A conversation is an ordered list of [`ModelMessage`]s that alternates
//! between a [`ModelRequest`] (everything sent to the backend for one round)
//! and a [`ModelResponse`] (everything the backend produced for that round).
//! Each message is a sequence of **parts**:
//!
//! | Side | Parts |
//! |------|-------|
//! | Request | [`SystemPromptPart`], [`UserPromptPart`], [`ToolReturnPart`], [`RetryPromptPart`] |
//! | Response | [`TextPart`], [`ThinkingPart`], [`ToolCallPart`], [`BuiltinToolCallPart`], [`BuiltinToolReturnPart`] |
//!
//! Both part families are closed enums discriminated by a `part_kind` tag
//! when serialized, and messages by a `kind` tag, so a history survives a
//! JSON round trip losslessly:
//!
//! ```rust
//! use parley_core::messages::{ModelMessage, ModelRequest, messages_from_json, messages_to_json};
//!
//! let history = vec![ModelMessage::Request(ModelRequest::user_text_prompt("Hello!"))];
//! let json = messages_to_json(&history).unwrap();
//! assert_eq!(messages_from_json(&json).unwrap(), history);
//! ```
//!
//! # Pairing
//!
//! Every [`ToolCallPart`] in a response is answered by exactly one
//! [`ToolReturnPart`] or [`RetryPromptPart`] carrying the same
//! `tool_call_id` in the following request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::usage::RequestUsage;

fn now() -> DateTime<Utc> {
    Utc::now()
}

// ── Request-side parts ──────────────────────────────────────────────

/// Instructions from the application that frame the whole conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemPromptPart {
    /// The prompt text.
    pub content: String,
    /// When the part was created.
    #[serde(default = "now")]
    pub timestamp: DateTime<Utc>,
}

impl SystemPromptPart {
    /// Creates a system prompt part stamped with the current time.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            timestamp: now(),
        }
    }
}

/// Content of a user prompt: plain text or a list of mixed items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    /// A plain text prompt.
    Text(String),
    /// Text interleaved with attachments.
    Parts(Vec<UserContentPart>),
}

impl UserContent {
    /// Returns the prompt text when the content is plain text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Parts(_) => None,
        }
    }
}

impl From<&str> for UserContent {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<String> for UserContent {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<UserContentPart>> for UserContent {
    fn from(parts: Vec<UserContentPart>) -> Self {
        Self::Parts(parts)
    }
}

/// One item of a multi-part user prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
#[non_exhaustive]
pub enum UserContentPart {
    /// A text segment.
    Text {
        /// The text.
        text: String,
    },
    /// An image the backend should fetch.
    ImageUrl {
        /// Location of the image.
        url: String,
    },
    /// A document (PDF, plain text, …) the backend should fetch.
    DocumentUrl {
        /// Location of the document.
        url: String,
    },
    /// An audio clip the backend should fetch.
    AudioUrl {
        /// Location of the clip.
        url: String,
    },
    /// A video the backend should fetch.
    VideoUrl {
        /// Location of the video.
        url: String,
    },
    /// Inline bytes with their media type.
    Binary {
        /// Raw bytes.
        data: Vec<u8>,
        /// IANA media type, e.g. `image/png`.
        media_type: String,
    },
}

/// The user's turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPromptPart {
    /// What the user said.
    pub content: UserContent,
    /// When the part was created.
    #[serde(default = "now")]
    pub timestamp: DateTime<Utc>,
}

impl UserPromptPart {
    /// Creates a user prompt part stamped with the current time.
    pub fn new(content: impl Into<UserContent>) -> Self {
        Self {
            content: content.into(),
            timestamp: now(),
        }
    }
}

/// The result of a locally executed function tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolReturnPart {
    /// Name of the tool that was called.
    pub tool_name: String,
    /// The value the tool returned.
    pub content: Value,
    /// Matches the `tool_call_id` of the originating [`ToolCallPart`].
    pub tool_call_id: String,
    /// When the part was created.
    #[serde(default = "now")]
    pub timestamp: DateTime<Utc>,
}

impl ToolReturnPart {
    /// Creates a tool return part stamped with the current time.
    pub fn new(
        tool_name: impl Into<String>,
        content: impl Into<Value>,
        tool_call_id: impl Into<String>,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            content: content.into(),
            tool_call_id: tool_call_id.into(),
            timestamp: now(),
        }
    }

    /// Renders the content as the text a backend receives.
    ///
    /// Strings are passed through; anything else is JSON-encoded.
    pub fn model_response_str(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// A single structured validation error reported back to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// JSON pointer to the offending location (empty for the root).
    pub path: String,
    /// What was wrong there.
    pub message: String,
}

/// Body of a [`RetryPromptPart`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetryContent {
    /// A free-form explanation.
    Text(String),
    /// Structured validation errors.
    Errors(Vec<ErrorDetails>),
}

impl From<&str> for RetryContent {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<String> for RetryContent {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<ErrorDetails>> for RetryContent {
    fn from(errors: Vec<ErrorDetails>) -> Self {
        Self::Errors(errors)
    }
}

/// Asks the model to try again.
///
/// Produced by the engine when a tool asks for a retry, a tool name is
/// unknown, tool arguments fail validation, or the final output does not
/// validate. When `tool_name` is set the part answers that tool call;
/// otherwise it answers the response's text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPromptPart {
    /// Why the model should retry.
    pub content: RetryContent,
    /// The tool call this answers, if any.
    #[serde(default)]
    pub tool_name: Option<String>,
    /// The `tool_call_id` this answers, if any.
    #[serde(default)]
    pub tool_call_id: Option<String>,
    /// When the part was created.
    #[serde(default = "now")]
    pub timestamp: DateTime<Utc>,
}

impl RetryPromptPart {
    /// Creates a retry prompt that answers the response's text.
    pub fn new(content: impl Into<RetryContent>) -> Self {
        Self {
            content: content.into(),
            tool_name: None,
            tool_call_id: None,
            timestamp: now(),
        }
    }

    /// Creates a retry prompt answering a specific tool call.
    pub fn for_tool(
        content: impl Into<RetryContent>,
        tool_name: impl Into<String>,
        tool_call_id: impl Into<String>,
    ) -> Self {
        Self {
            content: content.into(),
            tool_name: Some(tool_name.into()),
            tool_call_id: Some(tool_call_id.into()),
            timestamp: now(),
        }
    }

    /// Renders the prompt as the text a backend receives.
    pub fn model_response(&self) -> String {
        let description = match &self.content {
            RetryContent::Text(text) => text.clone(),
            RetryContent::Errors(errors) => {
                let noun = if errors.len() == 1 { "error" } else { "errors" };
                let mut out = format!("{} validation {noun}:", errors.len());
                for error in errors {
                    if error.path.is_empty() {
                        out.push_str(&format!("\n- {}", error.message));
                    } else {
                        out.push_str(&format!("\n- at `{}`: {}", error.path, error.message));
                    }
                }
                out
            }
        };
        if self.tool_name.is_some() {
            format!("{description}\n\nFix the errors and try again.")
        } else {
            format!("Validation feedback:\n{description}\n\nFix the errors and try again.")
        }
    }
}

/// Any part that may appear in a [`ModelRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "part_kind", rename_all = "kebab-case")]
pub enum ModelRequestPart {
    /// See [`SystemPromptPart`].
    SystemPrompt(SystemPromptPart),
    /// See [`UserPromptPart`].
    UserPrompt(UserPromptPart),
    /// See [`ToolReturnPart`].
    ToolReturn(ToolReturnPart),
    /// See [`RetryPromptPart`].
    RetryPrompt(RetryPromptPart),
}

impl ModelRequestPart {
    /// The `tool_call_id` this part answers, for tool returns and tool retries.
    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            Self::ToolReturn(part) => Some(&part.tool_call_id),
            Self::RetryPrompt(part) => part.tool_call_id.as_deref(),
            Self::SystemPrompt(_) | Self::UserPrompt(_) => None,
        }
    }
}

impl From<SystemPromptPart> for ModelRequestPart {
    fn from(part: SystemPromptPart) -> Self {
        Self::SystemPrompt(part)
    }
}

impl From<UserPromptPart> for ModelRequestPart {
    fn from(part: UserPromptPart) -> Self {
        Self::UserPrompt(part)
    }
}

impl From<ToolReturnPart> for ModelRequestPart {
    fn from(part: ToolReturnPart) -> Self {
        Self::ToolReturn(part)
    }
}

impl From<RetryPromptPart> for ModelRequestPart {
    fn from(part: RetryPromptPart) -> Self {
        Self::RetryPrompt(part)
    }
}

// ── Response-side parts ─────────────────────────────────────────────

/// Plain text produced by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPart {
    /// The text.
    pub content: String,
}

impl TextPart {
    /// Creates a text part.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

/// Chain-of-thought output, when the backend exposes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkingPart {
    /// The reasoning text.
    pub content: String,
    /// Opaque signature some backends require when replaying thoughts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl ThinkingPart {
    /// Creates a thinking part without a signature.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            signature: None,
        }
    }
}

/// Arguments of a tool call.
///
/// Backends deliver arguments either already parsed or as JSON text, and
/// streamed calls always accumulate as text. Both forms are kept verbatim so
/// that a history round-trips exactly; [`as_value`](Self::as_value) parses on
/// demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolCallArgs {
    /// Parsed JSON object.
    Object(Map<String, Value>),
    /// Unparsed JSON text.
    Raw(String),
}

impl Default for ToolCallArgs {
    fn default() -> Self {
        Self::Object(Map::new())
    }
}

impl ToolCallArgs {
    /// Parses the arguments into a JSON value.
    ///
    /// Blank raw text is treated as an empty object, since several
    /// backends send nothing for argument-less calls.
    pub fn as_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Object(map) => Ok(Value::Object(map.clone())),
            Self::Raw(text) if text.trim().is_empty() => Ok(Value::Object(Map::new())),
            Self::Raw(text) => serde_json::from_str(text),
        }
    }

    /// Returns the arguments as JSON text.
    pub fn as_json_str(&self) -> String {
        match self {
            Self::Object(map) => Value::Object(map.clone()).to_string(),
            Self::Raw(text) => text.clone(),
        }
    }

    /// Appends streamed argument text.
    ///
    /// An empty object becomes raw text; a non-empty object is first
    /// rendered to text so nothing already received is lost.
    pub fn push_str(&mut self, delta: &str) {
        match self {
            Self::Raw(text) => text.push_str(delta),
            Self::Object(map) if map.is_empty() => *self = Self::Raw(delta.to_owned()),
            Self::Object(_) => {
                let mut text = self.as_json_str();
                text.push_str(delta);
                *self = Self::Raw(text);
            }
        }
    }
}

impl From<Value> for ToolCallArgs {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::Object(map),
            Value::String(text) => Self::Raw(text),
            other => Self::Raw(other.to_string()),
        }
    }
}

impl From<&str> for ToolCallArgs {
    fn from(text: &str) -> Self {
        Self::Raw(text.to_owned())
    }
}

impl From<String> for ToolCallArgs {
    fn from(text: String) -> Self {
        Self::Raw(text)
    }
}

/// A request from the model to run a function tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallPart {
    /// Which tool to run.
    pub tool_name: String,
    /// Arguments for the tool.
    pub args: ToolCallArgs,
    /// Correlates the call with its return or retry part.
    pub tool_call_id: String,
}

impl ToolCallPart {
    /// Creates a tool call part.
    pub fn new(
        tool_name: impl Into<String>,
        args: impl Into<ToolCallArgs>,
        tool_call_id: impl Into<String>,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            args: args.into(),
            tool_call_id: tool_call_id.into(),
        }
    }

    /// Generates a fresh call id for backends that do not supply one.
    pub fn generate_id() -> String {
        format!("call_{}", uuid::Uuid::new_v4().simple())
    }
}

/// A tool the backend executed itself (e.g. web search).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuiltinToolCallPart {
    /// Which builtin tool ran.
    pub tool_name: String,
    /// Arguments the backend used.
    pub args: ToolCallArgs,
    /// Correlates the call with its [`BuiltinToolReturnPart`].
    pub tool_call_id: String,
    /// Backend that executed the tool.
    #[serde(default)]
    pub provider_name: Option<String>,
}

/// The result of a builtin tool, as reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuiltinToolReturnPart {
    /// Which builtin tool ran.
    pub tool_name: String,
    /// What it returned.
    pub content: Value,
    /// Matches the originating [`BuiltinToolCallPart`].
    pub tool_call_id: String,
    /// Backend that executed the tool.
    #[serde(default)]
    pub provider_name: Option<String>,
    /// When the part was created.
    #[serde(default = "now")]
    pub timestamp: DateTime<Utc>,
}

/// Any part that may appear in a [`ModelResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "part_kind", rename_all = "kebab-case")]
pub enum ModelResponsePart {
    /// See [`TextPart`].
    Text(TextPart),
    /// See [`ThinkingPart`].
    Thinking(ThinkingPart),
    /// See [`ToolCallPart`].
    ToolCall(ToolCallPart),
    /// See [`BuiltinToolCallPart`].
    BuiltinToolCall(BuiltinToolCallPart),
    /// See [`BuiltinToolReturnPart`].
    BuiltinToolReturn(BuiltinToolReturnPart),
}

impl ModelResponsePart {
    /// Shorthand for a [`TextPart`].
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text(TextPart::new(content))
    }

    /// Shorthand for a [`ThinkingPart`].
    pub fn thinking(content: impl Into<String>) -> Self {
        Self::Thinking(ThinkingPart::new(content))
    }

    /// Shorthand for a [`ToolCallPart`].
    pub fn tool_call(
        tool_name: impl Into<String>,
        args: impl Into<ToolCallArgs>,
        tool_call_id: impl Into<String>,
    ) -> Self {
        Self::ToolCall(ToolCallPart::new(tool_name, args, tool_call_id))
    }

    /// Short name of the variant, used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Thinking(_) => "thinking",
            Self::ToolCall(_) => "tool-call",
            Self::BuiltinToolCall(_) => "builtin-tool-call",
            Self::BuiltinToolReturn(_) => "builtin-tool-return",
        }
    }
}

/// Why the backend stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of the turn.
    Stop,
    /// The token budget ran out.
    Length,
    /// Output was blocked by the backend's safety filters.
    ContentFilter,
    /// The model stopped to call tools.
    ToolCall,
    /// The backend reported an error.
    Error,
}

// ── Messages ────────────────────────────────────────────────────────

/// Everything sent to the backend for one round.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelRequest {
    /// Ordered request parts.
    pub parts: Vec<ModelRequestPart>,
    /// Instructions sent alongside this request only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl ModelRequest {
    /// Creates a request from parts, without instructions.
    pub fn new(parts: Vec<ModelRequestPart>) -> Self {
        Self {
            parts,
            instructions: None,
        }
    }

    /// Creates a request holding a single text user prompt.
    pub fn user_text_prompt(prompt: impl Into<String>) -> Self {
        Self::new(vec![ModelRequestPart::UserPrompt(UserPromptPart::new(
            prompt.into(),
        ))])
    }

    /// Sets the instructions.
    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }
}

/// Everything the backend produced for one round.
///
/// Produced by exactly one provider call and not modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Ordered response parts.
    pub parts: Vec<ModelResponsePart>,
    /// Token usage for this round.
    #[serde(default)]
    pub usage: RequestUsage,
    /// Model that produced the response, as reported by the backend.
    #[serde(default)]
    pub model_name: Option<String>,
    /// When the response was received.
    #[serde(default = "now")]
    pub timestamp: DateTime<Utc>,
    /// Backend that produced the response.
    #[serde(default)]
    pub provider_name: Option<String>,
    /// Opaque backend-specific details (raw finish reason, safety ratings…).
    #[serde(default)]
    pub provider_details: Option<Map<String, Value>>,
    /// Backend request identifier, for support tickets and tracing.
    #[serde(default)]
    pub provider_request_id: Option<String>,
    /// Normalized stop reason.
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
}

impl ModelResponse {
    /// Creates a response from parts with zero usage and no metadata.
    pub fn new(parts: Vec<ModelResponsePart>) -> Self {
        Self {
            parts,
            usage: RequestUsage::default(),
            model_name: None,
            timestamp: now(),
            provider_name: None,
            provider_details: None,
            provider_request_id: None,
            finish_reason: None,
        }
    }

    /// Sets the usage.
    #[must_use]
    pub fn with_usage(mut self, usage: RequestUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Sets the model name.
    #[must_use]
    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = Some(model_name.into());
        self
    }

    /// Sets the finish reason.
    #[must_use]
    pub fn with_finish_reason(mut self, finish_reason: FinishReason) -> Self {
        self.finish_reason = Some(finish_reason);
        self
    }

    /// Sets the opaque provider details.
    #[must_use]
    pub fn with_provider_details(mut self, details: Map<String, Value>) -> Self {
        self.provider_details = Some(details);
        self
    }

    /// Concatenated text of all [`TextPart`]s, or `None` if there are none.
    pub fn text(&self) -> Option<String> {
        let mut texts = self.parts.iter().filter_map(|p| match p {
            ModelResponsePart::Text(t) => Some(t.content.as_str()),
            _ => None,
        });
        let first = texts.next()?;
        let mut out = first.to_owned();
        for t in texts {
            out.push_str(t);
        }
        Some(out)
    }

    /// All function tool calls, in order.
    pub fn tool_calls(&self) -> Vec<&ToolCallPart> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ModelResponsePart::ToolCall(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    /// Concatenated reasoning text, or `None` if there is none.
    pub fn thinking(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .parts
            .iter()
            .filter_map(|p| match p {
                ModelResponsePart::Thinking(t) => Some(t.content.as_str()),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }
}

/// One entry in a message history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ModelMessage {
    /// Sent to the backend.
    Request(ModelRequest),
    /// Received from the backend.
    Response(ModelResponse),
}

impl ModelMessage {
    /// Returns the request, if this is one.
    pub fn as_request(&self) -> Option<&ModelRequest> {
        match self {
            Self::Request(r) => Some(r),
            Self::Response(_) => None,
        }
    }

    /// Returns the response, if this is one.
    pub fn as_response(&self) -> Option<&ModelResponse> {
        match self {
            Self::Response(r) => Some(r),
            Self::Request(_) => None,
        }
    }
}

impl From<ModelRequest> for ModelMessage {
    fn from(request: ModelRequest) -> Self {
        Self::Request(request)
    }
}

impl From<ModelResponse> for ModelMessage {
    fn from(response: ModelResponse) -> Self {
        Self::Response(response)
    }
}

/// Serializes a history to JSON.
pub fn messages_to_json(messages: &[ModelMessage]) -> Result<String, serde_json::Error> {
    serde_json::to_string(messages)
}

/// Deserializes a history from JSON produced by [`messages_to_json`].
pub fn messages_from_json(json: &str) -> Result<Vec<ModelMessage>, serde_json::Error> {
    serde_json::from_str(json)
}
