//! Errors raised by model adapters.
//!
//! Every adapter maps its native failures into [`ModelError`], so the
//! engine and callers match on one type whichever backend is in use.
//!
//! # Retryability
//!
//! `Http` and `Provider` carry a `retryable` flag set from the upstream
//! response (HTTP 429, 503, "overloaded"…). Timeouts are always retryable.
//! The engine itself never retries transport errors; the flag is there for
//! callers that wrap runs in their own retry policy:
//!
//! ```rust
//! use parley_core::ModelError;
//!
//! let err = ModelError::Timeout { elapsed_ms: 5000 };
//! assert!(err.is_retryable());
//! assert!(!ModelError::Auth("bad key".into()).is_retryable());
//! ```

/// The error type returned by every [`Model`](crate::provider::Model) method.
///
/// New variants may be added in minor releases; always include a wildcard
/// arm when matching.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ModelError {
    /// An HTTP-level failure (transport error, unexpected status code).
    ///
    /// `status` is `None` when no response was received at all.
    #[error("HTTP error (status={status:?}): {message}")]
    Http {
        /// The HTTP status code, if one was received.
        status: Option<http::StatusCode>,
        /// What went wrong.
        message: String,
        /// Whether the request may succeed if sent again.
        retryable: bool,
    },

    /// The API key or token was rejected.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The backend rejected the request as malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A backend-specific error that doesn't map to another variant.
    #[error("Provider error ({code}): {message}")]
    Provider {
        /// Backend error code (e.g. `"overloaded"`).
        code: String,
        /// What went wrong.
        message: String,
        /// Whether the request may succeed if sent again.
        retryable: bool,
    },

    /// The backend's response could not be understood.
    #[error("Response format error: {message}")]
    ResponseFormat {
        /// What went wrong during parsing.
        message: String,
        /// The raw response body, for diagnostics.
        raw: String,
    },

    /// The backend refused to produce output (safety or policy filter).
    #[error("Content filter triggered: {message}")]
    ContentFiltered {
        /// The backend's explanation, if any.
        message: String,
    },

    /// The provider call exceeded its deadline.
    #[error("Model request timed out after {elapsed_ms}ms")]
    Timeout {
        /// Milliseconds elapsed before the timeout fired.
        elapsed_ms: u64,
    },

    /// The adapter does not support the requested operation or feature.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The model settings or their extension are invalid for this adapter.
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),
}

impl ModelError {
    /// Returns `true` if the error is transient and the request may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { retryable, .. } | Self::Provider { retryable, .. } => *retryable,
            Self::Timeout { .. } => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(err: serde_json::Error) -> Self {
        Self::ResponseFormat {
            message: err.to_string(),
            raw: String::new(),
        }
    }
}
