//! Streaming responses.
//!
//! A streaming adapter returns a [`ChunkStream`]: a sequence of
//! [`StreamChunk`]s in the backend's own granularity. [`StreamedResponse`]
//! consumes it, assembles the parts through a [`PartsManager`], and yields
//! uniform [`AgentStreamEvent`]s. At any point [`get`](StreamedResponse::get)
//! returns the [`ModelResponse`] assembled so far; once the stream is
//! exhausted that is the complete response.
//!
//! # Consuming a stream
//!
//! ```rust,no_run
//! use parley_core::stream::{ChunkStream, StreamedResponse};
//!
//! async fn print_stream(chunks: ChunkStream) {
//!     let mut response = StreamedResponse::new(chunks);
//!     while let Some(event) = response.next_event().await {
//!         match event {
//!             Ok(event) => println!("{event:?}"),
//!             Err(e) => eprintln!("stream error: {e}"),
//!         }
//!     }
//!     println!("{:?}", response.get());
//! }
//! ```
//!
//! # Tool-call reassembly
//!
//! Tool calls may arrive whole ([`StreamChunk::ToolCall`]) or in fragments
//! ([`StreamChunk::ToolCallDelta`]) whose argument text is concatenated.
//! Fragments belonging to the same call share a `part_id`.

use std::fmt;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ModelError;
use crate::events::AgentStreamEvent;
use crate::messages::{
    BuiltinToolCallPart, BuiltinToolReturnPart, FinishReason, ModelResponse, ModelResponsePart,
    ToolCallPart,
};
use crate::parts_manager::PartsManager;
use crate::usage::RequestUsage;

/// A pinned, boxed, `Send` stream of [`StreamChunk`] results.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ModelError>> + Send>>;

/// Response-level metadata reported during a stream.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseMetadata {
    /// Model that is producing the response.
    pub model_name: Option<String>,
    /// Backend that is producing the response.
    pub provider_name: Option<String>,
    /// Opaque backend-specific details.
    pub provider_details: Option<Map<String, Value>>,
    /// Backend request identifier.
    pub provider_request_id: Option<String>,
    /// Normalized stop reason.
    pub finish_reason: Option<FinishReason>,
}

impl ResponseMetadata {
    /// Merges `other` into `self`; values present in `other` win and
    /// detail maps are combined key by key.
    pub fn merge(&mut self, other: ResponseMetadata) {
        if other.model_name.is_some() {
            self.model_name = other.model_name;
        }
        if other.provider_name.is_some() {
            self.provider_name = other.provider_name;
        }
        if other.provider_request_id.is_some() {
            self.provider_request_id = other.provider_request_id;
        }
        if other.finish_reason.is_some() {
            self.finish_reason = other.finish_reason;
        }
        if let Some(details) = other.provider_details {
            self.provider_details
                .get_or_insert_with(Map::new)
                .extend(details);
        }
    }
}

/// One unit of a streamed response, as produced by an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "chunk_kind", rename_all = "snake_case")]
#[non_exhaustive]
pub enum StreamChunk {
    /// A fragment of text.
    TextDelta {
        /// Backend id of the part this belongs to.
        part_id: Option<String>,
        /// The fragment.
        content: String,
    },
    /// A fragment of reasoning, or its signature.
    ThinkingDelta {
        /// Backend id of the part this belongs to.
        part_id: Option<String>,
        /// Reasoning text to append.
        content: Option<String>,
        /// Signature for the part.
        signature: Option<String>,
    },
    /// A fragment of a function tool call.
    ToolCallDelta {
        /// Backend id of the part this belongs to.
        part_id: Option<String>,
        /// Tool name text.
        tool_name: Option<String>,
        /// Argument JSON text.
        args: Option<String>,
        /// Call id.
        tool_call_id: Option<String>,
    },
    /// A complete function tool call.
    ToolCall {
        /// Backend id of the part.
        part_id: Option<String>,
        /// The call.
        part: ToolCallPart,
    },
    /// A builtin tool the backend executed.
    BuiltinToolCall {
        /// Backend id of the part.
        part_id: Option<String>,
        /// The call.
        part: BuiltinToolCallPart,
    },
    /// The result of a builtin tool.
    BuiltinToolReturn {
        /// Backend id of the part.
        part_id: Option<String>,
        /// The result.
        part: BuiltinToolReturnPart,
    },
    /// Incremental usage; successive reports are summed.
    Usage(RequestUsage),
    /// Response metadata; successive reports are merged.
    Metadata(ResponseMetadata),
}

impl StreamChunk {
    /// A text fragment that extends the latest text part.
    pub fn text(content: impl Into<String>) -> Self {
        Self::TextDelta {
            part_id: None,
            content: content.into(),
        }
    }

    /// A reasoning fragment that extends the latest thinking part.
    pub fn thinking(content: impl Into<String>) -> Self {
        Self::ThinkingDelta {
            part_id: None,
            content: Some(content.into()),
            signature: None,
        }
    }

    /// A complete tool call.
    pub fn tool_call(part: ToolCallPart) -> Self {
        Self::ToolCall {
            part_id: None,
            part,
        }
    }

    /// A stop-reason report.
    pub fn finish(reason: FinishReason) -> Self {
        Self::Metadata(ResponseMetadata {
            finish_reason: Some(reason),
            ..ResponseMetadata::default()
        })
    }
}

/// A response being streamed from a backend.
///
/// Owns the chunk stream until it is exhausted or fails; after that
/// [`is_complete`](Self::is_complete) is `true` and
/// [`next_event`](Self::next_event) returns `None`.
pub struct StreamedResponse {
    chunks: Option<ChunkStream>,
    manager: PartsManager,
    usage: RequestUsage,
    metadata: ResponseMetadata,
    timestamp: DateTime<Utc>,
}

impl fmt::Debug for StreamedResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamedResponse")
            .field("complete", &self.is_complete())
            .field("parts", &self.manager.get_parts().len())
            .field("usage", &self.usage)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

impl StreamedResponse {
    /// Wraps an adapter's chunk stream.
    pub fn new(chunks: ChunkStream) -> Self {
        Self {
            chunks: Some(chunks),
            manager: PartsManager::new(),
            usage: RequestUsage::default(),
            metadata: ResponseMetadata::default(),
            timestamp: Utc::now(),
        }
    }

    /// Sets the model and provider names used when the stream does not
    /// report its own.
    #[must_use]
    pub fn with_names(mut self, provider_name: &str, model_name: &str) -> Self {
        self.metadata
            .provider_name
            .get_or_insert_with(|| provider_name.to_owned());
        self.metadata
            .model_name
            .get_or_insert_with(|| model_name.to_owned());
        self
    }

    /// Pulls chunks until one produces an event.
    ///
    /// Returns `None` once the stream is exhausted. A chunk error is
    /// returned once and ends the stream.
    pub async fn next_event(&mut self) -> Option<Result<AgentStreamEvent, ModelError>> {
        loop {
            let chunks = self.chunks.as_mut()?;
            match chunks.next().await {
                None => {
                    self.chunks = None;
                    return None;
                }
                Some(Err(err)) => {
                    self.chunks = None;
                    return Some(Err(err));
                }
                Some(Ok(chunk)) => {
                    if let Some(event) = self.handle_chunk(chunk) {
                        return Some(Ok(event));
                    }
                }
            }
        }
    }

    /// Consumes the rest of the stream, discarding events.
    pub async fn drain(&mut self) -> Result<(), ModelError> {
        while let Some(event) = self.next_event().await {
            event?;
        }
        Ok(())
    }

    /// Returns `true` once the chunk stream has ended.
    pub fn is_complete(&self) -> bool {
        self.chunks.is_none()
    }

    /// The response assembled so far.
    pub fn get(&self) -> ModelResponse {
        ModelResponse {
            parts: self.manager.get_parts().to_vec(),
            usage: self.usage.clone(),
            model_name: self.metadata.model_name.clone(),
            timestamp: self.timestamp,
            provider_name: self.metadata.provider_name.clone(),
            provider_details: self.metadata.provider_details.clone(),
            provider_request_id: self.metadata.provider_request_id.clone(),
            finish_reason: self.metadata.finish_reason,
        }
    }

    /// Usage reported so far.
    pub fn usage(&self) -> &RequestUsage {
        &self.usage
    }

    /// The parts assembled so far.
    pub fn parts(&self) -> &[ModelResponsePart] {
        self.manager.get_parts()
    }

    fn handle_chunk(&mut self, chunk: StreamChunk) -> Option<AgentStreamEvent> {
        match chunk {
            StreamChunk::TextDelta { part_id, content } => {
                self.manager.handle_text_delta(part_id.as_deref(), &content)
            }
            StreamChunk::ThinkingDelta {
                part_id,
                content,
                signature,
            } => self.manager.handle_thinking_delta(
                part_id.as_deref(),
                content.as_deref(),
                signature.as_deref(),
            ),
            StreamChunk::ToolCallDelta {
                part_id,
                tool_name,
                args,
                tool_call_id,
            } => self.manager.handle_tool_call_delta(
                part_id.as_deref(),
                tool_name.as_deref(),
                args.as_deref(),
                tool_call_id.as_deref(),
            ),
            StreamChunk::ToolCall { part_id, part } => Some(
                self.manager
                    .handle_part(part_id.as_deref(), ModelResponsePart::ToolCall(part)),
            ),
            StreamChunk::BuiltinToolCall { part_id, part } => Some(
                self.manager
                    .handle_part(part_id.as_deref(), ModelResponsePart::BuiltinToolCall(part)),
            ),
            StreamChunk::BuiltinToolReturn { part_id, part } => Some(
                self.manager
                    .handle_part(part_id.as_deref(), ModelResponsePart::BuiltinToolReturn(part)),
            ),
            StreamChunk::Usage(usage) => {
                self.usage += &usage;
                None
            }
            StreamChunk::Metadata(metadata) => {
                self.metadata.merge(metadata);
                None
            }
        }
    }
}
