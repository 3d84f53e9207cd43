//! Tool error types.

/// Asks the model to try again with the given feedback.
///
/// Returned by tools, text transforms and output validators. The message is
/// sent back to the model in a retry prompt; it never ends a run unless the
/// relevant retry budget is spent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ModelRetry {
    /// Feedback for the model.
    pub message: String,
}

impl ModelRetry {
    /// Creates a retry request with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Error returned by tool execution.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ToolError {
    /// The model should call the tool again, differently.
    #[error(transparent)]
    Retry(#[from] ModelRetry),

    /// Anything else. Ends the run.
    #[error("{0}")]
    Failed(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ToolError {
    /// Shorthand for `ToolError::Retry(ModelRetry::new(message))`.
    pub fn retry(message: impl Into<String>) -> Self {
        Self::Retry(ModelRetry::new(message))
    }

    /// Wraps an unexpected error.
    pub fn failed(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Failed(err.into())
    }
}
