//! Mock model for testing.
//!
//! [`MockModel`] is a queue-based fake that lets tests control exactly
//! what a backend returns, without touching the network. It implements
//! [`Model`], so it works anywhere a real adapter does, including behind
//! [`DynModel`](crate::DynModel) via the blanket impl.
//!
//! # Usage
//!
//! ```rust,ignore
//! use parley_core::mock::{MockError, MockModel};
//! use parley_core::test_helpers::{mock_model, text_response};
//! use parley_core::{Model, ModelMessage, ModelRequest, ModelRequestParameters, ModelSettings};
//!
//! # async fn example() {
//! let mock = mock_model("test", "test-model");
//! mock.queue_response(text_response("Hello!"));
//! mock.queue_error(MockError::Timeout { elapsed_ms: 5000 });
//!
//! let messages = vec![ModelMessage::Request(ModelRequest::user_text_prompt("hi"))];
//! let resp = mock
//!     .request(&messages, &ModelSettings::default(), &ModelRequestParameters::default())
//!     .await
//!     .unwrap();
//! assert_eq!(resp.text().as_deref(), Some("Hello!"));
//! assert_eq!(mock.recorded_calls().len(), 1);
//! # }
//! ```
//!
//! # Why `MockError` instead of `ModelError`?
//!
//! Queued values are handed out by value, and a test often wants to assert
//! on the same error it queued. [`MockError`] mirrors [`ModelError`] in a
//! cloneable form and converts when dequeued.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::ModelError;
use crate::messages::{ModelMessage, ModelResponse};
use crate::provider::{Model, ModelMetadata, ModelRequestParameters};
use crate::settings::ModelSettings;
use crate::stream::{ChunkStream, StreamChunk};
use crate::usage::RequestUsage;

/// Cloneable mirror of [`ModelError`] for queuing.
#[derive(Debug, Clone, PartialEq)]
pub enum MockError {
    /// Maps to [`ModelError::Http`].
    Http {
        /// HTTP status code, if any.
        status: Option<http::StatusCode>,
        /// Error message.
        message: String,
        /// Whether the error is retryable.
        retryable: bool,
    },
    /// Maps to [`ModelError::Auth`].
    Auth(String),
    /// Maps to [`ModelError::InvalidRequest`].
    InvalidRequest(String),
    /// Maps to [`ModelError::Provider`].
    Provider {
        /// Provider error code.
        code: String,
        /// Error message.
        message: String,
        /// Whether the error is retryable.
        retryable: bool,
    },
    /// Maps to [`ModelError::ResponseFormat`].
    ResponseFormat {
        /// What went wrong during parsing.
        message: String,
        /// The raw response body.
        raw: String,
    },
    /// Maps to [`ModelError::ContentFiltered`].
    ContentFiltered(String),
    /// Maps to [`ModelError::Timeout`].
    Timeout {
        /// Elapsed milliseconds.
        elapsed_ms: u64,
    },
    /// Maps to [`ModelError::Unsupported`].
    Unsupported(String),
    /// Maps to [`ModelError::InvalidSettings`].
    InvalidSettings(String),
}

impl MockError {
    /// Converts into the equivalent [`ModelError`].
    pub fn into_model_error(self) -> ModelError {
        match self {
            Self::Http {
                status,
                message,
                retryable,
            } => ModelError::Http {
                status,
                message,
                retryable,
            },
            Self::Auth(msg) => ModelError::Auth(msg),
            Self::InvalidRequest(msg) => ModelError::InvalidRequest(msg),
            Self::Provider {
                code,
                message,
                retryable,
            } => ModelError::Provider {
                code,
                message,
                retryable,
            },
            Self::ResponseFormat { message, raw } => ModelError::ResponseFormat { message, raw },
            Self::ContentFiltered(message) => ModelError::ContentFiltered { message },
            Self::Timeout { elapsed_ms } => ModelError::Timeout { elapsed_ms },
            Self::Unsupported(msg) => ModelError::Unsupported(msg),
            Self::InvalidSettings(msg) => ModelError::InvalidSettings(msg),
        }
    }
}

/// Which [`Model`] method a recorded call went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// [`Model::request`].
    Request,
    /// [`Model::request_stream`].
    Stream,
    /// [`Model::count_tokens`].
    CountTokens,
}

/// Everything a [`MockModel`] was called with.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// Which method was called.
    pub kind: CallKind,
    /// The history passed in.
    pub messages: Vec<ModelMessage>,
    /// The merged settings passed in.
    pub settings: ModelSettings,
    /// The request parameters passed in.
    pub params: ModelRequestParameters,
}

/// A scripted stream: chunks, then optionally an error.
#[derive(Debug, Clone)]
struct ScriptedStream {
    chunks: Vec<StreamChunk>,
    trailing_error: Option<MockError>,
}

/// A queue-based mock model for unit and integration tests.
///
/// Each call to `request` or `request_stream` pops from the front of its
/// queue; `count_tokens` pops from its own queue and reports
/// [`ModelError::Unsupported`] when that is empty. Every call is recorded for
/// [`recorded_calls`](Self::recorded_calls).
///
/// `validate_request` rejects a settings extension that belongs to a
/// different provider, the way a real adapter would.
///
/// # Panics
///
/// `request` and `request_stream` panic if their queue is empty.
pub struct MockModel {
    responses: Mutex<VecDeque<Result<ModelResponse, MockError>>>,
    stream_responses: Mutex<VecDeque<Result<ScriptedStream, MockError>>>,
    token_counts: Mutex<VecDeque<Result<RequestUsage, MockError>>>,
    meta: ModelMetadata,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl fmt::Debug for MockModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockModel")
            .field("meta", &self.meta)
            .field("queued_responses", &lock(&self.responses).len())
            .field("queued_streams", &lock(&self.stream_responses).len())
            .field("queued_token_counts", &lock(&self.token_counts).len())
            .field("recorded_calls", &lock(&self.calls).len())
            .finish()
    }
}

impl MockModel {
    /// Creates a mock with the given metadata and empty queues.
    pub fn new(meta: ModelMetadata) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            stream_responses: Mutex::new(VecDeque::new()),
            token_counts: Mutex::new(VecDeque::new()),
            meta,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Enqueues a response for the next `request` call.
    pub fn queue_response(&self, response: ModelResponse) -> &Self {
        lock(&self.responses).push_back(Ok(response));
        self
    }

    /// Enqueues an error for the next `request` call.
    pub fn queue_error(&self, error: MockError) -> &Self {
        lock(&self.responses).push_back(Err(error));
        self
    }

    /// Enqueues chunks for the next `request_stream` call.
    pub fn queue_stream(&self, chunks: Vec<StreamChunk>) -> &Self {
        lock(&self.stream_responses).push_back(Ok(ScriptedStream {
            chunks,
            trailing_error: None,
        }));
        self
    }

    /// Enqueues chunks followed by a mid-stream error.
    pub fn queue_stream_then_error(&self, chunks: Vec<StreamChunk>, error: MockError) -> &Self {
        lock(&self.stream_responses).push_back(Ok(ScriptedStream {
            chunks,
            trailing_error: Some(error),
        }));
        self
    }

    /// Enqueues an error returned from `request_stream` itself, before any
    /// chunk is yielded.
    pub fn queue_stream_error(&self, error: MockError) -> &Self {
        lock(&self.stream_responses).push_back(Err(error));
        self
    }

    /// Enqueues a result for the next `count_tokens` call.
    pub fn queue_token_count(&self, usage: RequestUsage) -> &Self {
        lock(&self.token_counts).push_back(Ok(usage));
        self
    }

    /// Returns every recorded call, in order.
    pub fn recorded_calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    /// Number of `request` and `request_stream` calls made.
    pub fn request_count(&self) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| c.kind != CallKind::CountTokens)
            .count()
    }

    fn record_call(
        &self,
        kind: CallKind,
        messages: &[ModelMessage],
        settings: &ModelSettings,
        params: &ModelRequestParameters,
    ) {
        lock(&self.calls).push(RecordedCall {
            kind,
            messages: messages.to_vec(),
            settings: settings.clone(),
            params: params.clone(),
        });
    }
}

impl Model for MockModel {
    async fn request(
        &self,
        messages: &[ModelMessage],
        settings: &ModelSettings,
        params: &ModelRequestParameters,
    ) -> Result<ModelResponse, ModelError> {
        self.record_call(CallKind::Request, messages, settings, params);
        let result = lock(&self.responses)
            .pop_front()
            .expect("MockModel: no queued responses remaining");
        let mut response = result.map_err(MockError::into_model_error)?;
        response
            .model_name
            .get_or_insert_with(|| self.meta.model_name.clone());
        response
            .provider_name
            .get_or_insert_with(|| self.meta.provider_name.to_string());
        Ok(response)
    }

    async fn request_stream(
        &self,
        messages: &[ModelMessage],
        settings: &ModelSettings,
        params: &ModelRequestParameters,
    ) -> Result<ChunkStream, ModelError> {
        self.record_call(CallKind::Stream, messages, settings, params);
        let result = lock(&self.stream_responses)
            .pop_front()
            .expect("MockModel: no queued stream responses remaining");
        let script = result.map_err(MockError::into_model_error)?;
        let items = script
            .chunks
            .into_iter()
            .map(Ok)
            .chain(script.trailing_error.map(|e| Err(e.into_model_error())));
        Ok(Box::pin(futures::stream::iter(items)))
    }

    async fn count_tokens(
        &self,
        messages: &[ModelMessage],
        settings: &ModelSettings,
        params: &ModelRequestParameters,
    ) -> Result<RequestUsage, ModelError> {
        self.record_call(CallKind::CountTokens, messages, settings, params);
        let next = lock(&self.token_counts).pop_front();
        match next {
            Some(result) => result.map_err(MockError::into_model_error),
            None => Err(ModelError::Unsupported(format!(
                "token counting is not supported by {}",
                self.meta.provider_name
            ))),
        }
    }

    fn metadata(&self) -> ModelMetadata {
        self.meta.clone()
    }

    fn validate_request(
        &self,
        settings: &ModelSettings,
        _params: &ModelRequestParameters,
    ) -> Result<(), ModelError> {
        if let Some(ext) = &settings.extension {
            if ext.provider() != self.meta.provider_name {
                return Err(ModelError::InvalidSettings(format!(
                    "settings extension for '{}' cannot be used with '{}'",
                    ext.provider(),
                    self.meta.provider_name
                )));
            }
        }
        Ok(())
    }
}
