//! A [`Model`] driven by local closures.
//!
//! [`FunctionModel`] lets an application (or a test) play the part of the
//! backend: each round calls a closure with the message history and an
//! [`AgentInfo`] describing the tools and output mode, and returns whatever
//! response the closure builds. It is the tool of choice for exercising
//! agents deterministically without a network.
//!
//! ```rust
//! use parley_core::function::{AgentInfo, FunctionModel};
//! use parley_core::messages::{ModelMessage, ModelResponse, ModelResponsePart};
//!
//! let model = FunctionModel::new(|messages: Vec<ModelMessage>, _info: AgentInfo| async move {
//!     Ok(ModelResponse::new(vec![ModelResponsePart::text(format!(
//!         "{} messages so far",
//!         messages.len()
//!     ))]))
//! });
//! ```
//!
//! A model built with only a stream closure answers whole requests by
//! draining the stream; one built with only a request closure answers
//! stream requests by replaying the response as chunks.

use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::ModelError;
use crate::messages::{ModelMessage, ModelResponse, ModelResponsePart};
use crate::provider::{
    Model, ModelMetadata, ModelProfile, ModelRequestParameters, OutputMode,
    OutputObjectDefinition, ToolDefinition,
};
use crate::settings::ModelSettings;
use crate::stream::{ChunkStream, ResponseMetadata, StreamChunk, StreamedResponse};
use crate::usage::RequestUsage;

/// What a [`FunctionModel`] closure learns about the run.
#[derive(Debug, Clone)]
pub struct AgentInfo {
    /// Function tools the model may call.
    pub function_tools: Vec<ToolDefinition>,
    /// Output tools, for tool output.
    pub output_tools: Vec<ToolDefinition>,
    /// Whether a plain-text response can end the run.
    pub allow_text_output: bool,
    /// How output is extracted.
    pub output_mode: OutputMode,
    /// Schema for native or prompted output.
    pub output_object: Option<OutputObjectDefinition>,
    /// Settings merged for this request.
    pub model_settings: ModelSettings,
}

impl AgentInfo {
    fn new(settings: &ModelSettings, params: &ModelRequestParameters) -> Self {
        Self {
            function_tools: params.function_tools.clone(),
            output_tools: params.output_tools.clone(),
            allow_text_output: params.allow_text_output,
            output_mode: params.output_mode,
            output_object: params.output_object.clone(),
            model_settings: settings.clone(),
        }
    }
}

type RequestFn =
    dyn Fn(Vec<ModelMessage>, AgentInfo) -> BoxFuture<'static, Result<ModelResponse, ModelError>>
        + Send
        + Sync;
type StreamFn = dyn Fn(Vec<ModelMessage>, AgentInfo) -> ChunkStream + Send + Sync;
type CountFn =
    dyn Fn(&[ModelMessage], &AgentInfo) -> Result<RequestUsage, ModelError> + Send + Sync;

/// A model whose responses come from closures.
#[derive(Clone)]
pub struct FunctionModel {
    request_fn: Option<Arc<RequestFn>>,
    stream_fn: Option<Arc<StreamFn>>,
    count_fn: Option<Arc<CountFn>>,
    model_name: String,
    profile: ModelProfile,
}

impl fmt::Debug for FunctionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionModel")
            .field("model_name", &self.model_name)
            .field("has_request_fn", &self.request_fn.is_some())
            .field("has_stream_fn", &self.stream_fn.is_some())
            .field("has_count_fn", &self.count_fn.is_some())
            .finish_non_exhaustive()
    }
}

impl FunctionModel {
    /// Creates a model that answers each request with `f`.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<ModelMessage>, AgentInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ModelResponse, ModelError>> + Send + 'static,
    {
        Self {
            request_fn: Some(Arc::new(move |messages, info| Box::pin(f(messages, info)))),
            stream_fn: None,
            count_fn: None,
            model_name: "function".to_owned(),
            profile: ModelProfile::full(),
        }
    }

    /// Creates a model that answers each request by streaming `f`'s chunks.
    pub fn streaming<S>(f: S) -> Self
    where
        S: Fn(Vec<ModelMessage>, AgentInfo) -> ChunkStream + Send + Sync + 'static,
    {
        Self {
            request_fn: None,
            stream_fn: Some(Arc::new(f)),
            count_fn: None,
            model_name: "function".to_owned(),
            profile: ModelProfile::full(),
        }
    }

    /// Adds a stream closure alongside the request closure.
    #[must_use]
    pub fn with_stream<S>(mut self, f: S) -> Self
    where
        S: Fn(Vec<ModelMessage>, AgentInfo) -> ChunkStream + Send + Sync + 'static,
    {
        self.stream_fn = Some(Arc::new(f));
        self
    }

    /// Adds a token counting closure.
    #[must_use]
    pub fn with_count_tokens<C>(mut self, f: C) -> Self
    where
        C: Fn(&[ModelMessage], &AgentInfo) -> Result<RequestUsage, ModelError>
            + Send
            + Sync
            + 'static,
    {
        self.count_fn = Some(Arc::new(f));
        self
    }

    /// Sets the reported model name.
    #[must_use]
    pub fn with_model_name(mut self, name: impl Into<String>) -> Self {
        self.model_name = name.into();
        self
    }

    /// Replaces the capability profile.
    #[must_use]
    pub fn with_profile(mut self, profile: ModelProfile) -> Self {
        self.profile = profile;
        self
    }
}

/// Replays a whole response as a chunk sequence, one chunk per part.
pub fn response_to_chunks(response: ModelResponse) -> Vec<StreamChunk> {
    let mut chunks = Vec::with_capacity(response.parts.len() + 2);
    for (i, part) in response.parts.into_iter().enumerate() {
        let part_id = Some(i.to_string());
        chunks.push(match part {
            ModelResponsePart::Text(p) => StreamChunk::TextDelta {
                part_id,
                content: p.content,
            },
            ModelResponsePart::Thinking(p) => StreamChunk::ThinkingDelta {
                part_id,
                content: Some(p.content),
                signature: p.signature,
            },
            ModelResponsePart::ToolCall(part) => StreamChunk::ToolCall { part_id, part },
            ModelResponsePart::BuiltinToolCall(part) => StreamChunk::BuiltinToolCall { part_id, part },
            ModelResponsePart::BuiltinToolReturn(part) => {
                StreamChunk::BuiltinToolReturn { part_id, part }
            }
        });
    }
    chunks.push(StreamChunk::Usage(response.usage));
    chunks.push(StreamChunk::Metadata(ResponseMetadata {
        model_name: response.model_name,
        provider_name: response.provider_name,
        provider_details: response.provider_details,
        provider_request_id: response.provider_request_id,
        finish_reason: response.finish_reason,
    }));
    chunks
}

impl Model for FunctionModel {
    async fn request(
        &self,
        messages: &[ModelMessage],
        settings: &ModelSettings,
        params: &ModelRequestParameters,
    ) -> Result<ModelResponse, ModelError> {
        let info = AgentInfo::new(settings, params);
        let mut response = if let Some(f) = &self.request_fn {
            f(messages.to_vec(), info).await?
        } else if let Some(f) = &self.stream_fn {
            let mut streamed = StreamedResponse::new(f(messages.to_vec(), info));
            streamed.drain().await?;
            streamed.get()
        } else {
            return Err(ModelError::Unsupported(
                "FunctionModel has neither a request nor a stream function".into(),
            ));
        };
        response.model_name.get_or_insert_with(|| self.model_name.clone());
        response.provider_name.get_or_insert_with(|| "function".to_owned());
        Ok(response)
    }

    async fn request_stream(
        &self,
        messages: &[ModelMessage],
        settings: &ModelSettings,
        params: &ModelRequestParameters,
    ) -> Result<ChunkStream, ModelError> {
        let info = AgentInfo::new(settings, params);
        if let Some(f) = &self.stream_fn {
            return Ok(f(messages.to_vec(), info));
        }
        let Some(f) = &self.request_fn else {
            return Err(ModelError::Unsupported(
                "FunctionModel has neither a request nor a stream function".into(),
            ));
        };
        let response = f(messages.to_vec(), info).await?;
        let chunks = response_to_chunks(response).into_iter().map(Ok);
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn count_tokens(
        &self,
        messages: &[ModelMessage],
        settings: &ModelSettings,
        params: &ModelRequestParameters,
    ) -> Result<RequestUsage, ModelError> {
        match &self.count_fn {
            Some(f) => f(messages, &AgentInfo::new(settings, params)),
            None => Err(ModelError::Unsupported(
                "token counting is not supported by function".into(),
            )),
        }
    }

    fn metadata(&self) -> ModelMetadata {
        ModelMetadata {
            provider_name: Cow::Borrowed("function"),
            model_name: self.model_name.clone(),
            profile: self.profile.clone(),
        }
    }
}
