//! Errors that end a run.
//!
//! A run that fails returns [`RunError`], which carries the
//! [`RunErrorKind`] plus the complete message history and usage up to the
//! failure, so callers can log, inspect, or resume the conversation.
//!
//! Validation problems (bad tool arguments, output that does not parse, a
//! tool asking for a retry) never end a run directly: the engine turns them
//! into retry prompts. They surface as the `cause` of an
//! [`UnexpectedModelBehavior`](RunErrorKind::UnexpectedModelBehavior) only
//! once the retry budget is spent.
//!
//! ```rust
//! use parley::error::{ErrorClass, RunErrorKind};
//!
//! let kind = RunErrorKind::Configuration("no output variants".into());
//! assert_eq!(kind.class(), ErrorClass::Configuration);
//! ```

use std::fmt;

use parley_core::usage::UsageLimitExceeded;
use parley_core::{ModelError, ModelMessage, RunUsage};

/// Why a run ended without an output.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RunErrorKind {
    /// Output or tool arguments failed validation.
    #[error("{message}")]
    ValidationFailure {
        /// The validation feedback that was sent to the model.
        message: String,
    },

    /// A tool or output validator asked the model to try again.
    #[error("{message}")]
    ModelRetryRequested {
        /// The retry message.
        message: String,
    },

    /// A usage limit was, or would have been, exceeded.
    #[error(transparent)]
    UsageLimitExceeded(#[from] UsageLimitExceeded),

    /// The model did something the engine cannot recover from: tripped a
    /// content filter, returned an unparseable body, or exhausted a retry
    /// budget.
    #[error("{message}")]
    UnexpectedModelBehavior {
        /// What happened.
        message: String,
        /// The offending response body, when there is one.
        body: Option<String>,
        /// The last recoverable failure, for exhausted retry budgets.
        #[source]
        cause: Option<Box<RunErrorKind>>,
    },

    /// The agent, its settings, or the model's capabilities do not fit
    /// together. Raised before any request is sent.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The model adapter failed (transport, auth, provider, timeout).
    #[error(transparent)]
    Model(ModelError),

    /// A tool failed with something other than a retry request.
    #[error("Tool '{tool_name}' failed: {source}")]
    ToolExecution {
        /// The tool that failed.
        tool_name: String,
        /// The underlying error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The run's cancellation token fired.
    #[error("The run was cancelled")]
    Cancelled,
}

/// Coarse classification of a [`RunErrorKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorClass {
    /// Recoverable validation problem.
    ValidationFailure,
    /// Recoverable retry request.
    ModelRetryRequested,
    /// A usage budget was hit.
    UsageLimitExceeded,
    /// Unrecoverable model behavior.
    UnexpectedModelBehavior,
    /// Misconfiguration, detected before any request.
    Configuration,
    /// Adapter or transport failure.
    Provider,
    /// A tool failed unexpectedly.
    ToolExecution,
    /// The run was cancelled.
    Cancelled,
}

impl RunErrorKind {
    /// Returns the taxonomy class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ValidationFailure { .. } => ErrorClass::ValidationFailure,
            Self::ModelRetryRequested { .. } => ErrorClass::ModelRetryRequested,
            Self::UsageLimitExceeded(_) => ErrorClass::UsageLimitExceeded,
            Self::UnexpectedModelBehavior { .. } => ErrorClass::UnexpectedModelBehavior,
            Self::Configuration(_) => ErrorClass::Configuration,
            Self::Model(_) => ErrorClass::Provider,
            Self::ToolExecution { .. } => ErrorClass::ToolExecution,
            Self::Cancelled => ErrorClass::Cancelled,
        }
    }

    /// Shorthand for an [`UnexpectedModelBehavior`](Self::UnexpectedModelBehavior)
    /// without a body or cause.
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::UnexpectedModelBehavior {
            message: message.into(),
            body: None,
            cause: None,
        }
    }

    /// Maps an adapter error into the run taxonomy.
    ///
    /// Content filtering and unparseable responses become
    /// `UnexpectedModelBehavior`; unsupported features and rejected
    /// settings become `Configuration`; everything else passes through
    /// unchanged as `Model`.
    pub fn from_model_error(err: ModelError) -> Self {
        match err {
            ModelError::ContentFiltered { .. } => Self::unexpected(err.to_string()),
            ModelError::ResponseFormat { message, raw } => Self::UnexpectedModelBehavior {
                message,
                body: Some(raw),
                cause: None,
            },
            ModelError::Unsupported(msg) | ModelError::InvalidSettings(msg) => {
                Self::Configuration(msg)
            }
            other => Self::Model(other),
        }
    }
}

/// A failed run: the reason plus everything that happened before it.
pub struct RunError {
    /// Why the run failed.
    pub kind: RunErrorKind,
    /// The full message history up to the failure.
    pub messages: Vec<ModelMessage>,
    /// Usage accumulated up to the failure.
    pub usage: RunUsage,
}

impl RunError {
    /// Creates a run error.
    pub fn new(kind: RunErrorKind, messages: Vec<ModelMessage>, usage: RunUsage) -> Self {
        Self {
            kind,
            messages,
            usage,
        }
    }

    /// Returns the taxonomy class.
    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }

    /// Returns `true` if the run was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, RunErrorKind::Cancelled)
    }
}

impl fmt::Debug for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunError")
            .field("kind", &self.kind)
            .field("messages", &self.messages.len())
            .field("usage", &self.usage)
            .finish()
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, f)
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::usage::{LimitKind, UsageLimits};
    use std::error::Error;

    #[test]
    fn test_model_error_mapping() {
        let kind = RunErrorKind::from_model_error(ModelError::ContentFiltered {
            message: "Safety settings triggered".into(),
        });
        assert_eq!(kind.class(), ErrorClass::UnexpectedModelBehavior);
        assert!(kind.to_string().contains("Safety settings triggered"));

        let kind = RunErrorKind::from_model_error(ModelError::ResponseFormat {
            message: "bad json".into(),
            raw: "{".into(),
        });
        assert!(matches!(
            kind,
            RunErrorKind::UnexpectedModelBehavior { body: Some(ref b), .. } if b == "{"
        ));

        let kind = RunErrorKind::from_model_error(ModelError::Unsupported("no counting".into()));
        assert_eq!(kind.class(), ErrorClass::Configuration);

        let kind = RunErrorKind::from_model_error(ModelError::Timeout { elapsed_ms: 10 });
        assert!(matches!(
            kind,
            RunErrorKind::Model(ModelError::Timeout { elapsed_ms: 10 })
        ));
    }

    #[test]
    fn test_usage_limit_display_passes_through() {
        let limits = UsageLimits {
            request_limit: Some(1),
            ..UsageLimits::unlimited()
        };
        let usage = RunUsage {
            requests: 1,
            ..Default::default()
        };
        let exceeded = limits.check_before_request(&usage).unwrap_err();
        assert_eq!(exceeded.limit, LimitKind::Requests);
        let kind = RunErrorKind::from(exceeded);
        assert_eq!(
            kind.to_string(),
            "The next request would exceed the request_limit of 1"
        );
    }

    #[test]
    fn test_exhausted_retries_expose_cause() {
        let kind = RunErrorKind::UnexpectedModelBehavior {
            message: "Exceeded maximum retries (1) for output validation".into(),
            body: None,
            cause: Some(Box::new(RunErrorKind::ValidationFailure {
                message: "missing field `city`".into(),
            })),
        };
        let err = RunError::new(kind, Vec::new(), RunUsage::default());
        let source = err.source().and_then(Error::source).unwrap();
        assert_eq!(source.to_string(), "missing field `city`");
    }

    #[test]
    fn test_tool_execution_display() {
        let kind = RunErrorKind::ToolExecution {
            tool_name: "db".into(),
            source: "connection refused".into(),
        };
        assert_eq!(kind.to_string(), "Tool 'db' failed: connection refused");
        assert_eq!(kind.class(), ErrorClass::ToolExecution);
    }

    #[test]
    fn test_run_error_debug_is_compact() {
        let err = RunError::new(RunErrorKind::Cancelled, Vec::new(), RunUsage::default());
        assert!(err.is_cancelled());
        assert!(format!("{err:?}").contains("messages: 0"));
    }
}
