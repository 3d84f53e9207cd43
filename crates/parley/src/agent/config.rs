//! Agent-level and per-run configuration.

use std::fmt;

use parley_core::messages::UserContent;
use parley_core::{ModelMessage, ModelSettings, UsageLimits};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// What to do with function tool calls that share a response with an
/// accepted output tool call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndStrategy {
    /// Run every function tool call, then accept the output.
    #[default]
    Exhaustive,
    /// Accept the output right away; function calls get a
    /// "not executed" return.
    Early,
}

/// Retry and dispatch policy held by an [`Agent`](super::Agent).
///
/// ```rust
/// use parley::{AgentConfig, EndStrategy};
///
/// let config = AgentConfig {
///     retries: 2,
///     end_strategy: EndStrategy::Early,
///     ..Default::default()
/// };
/// assert_eq!(config.max_result_retries(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Default retry budget for each function tool.
    pub retries: u32,
    /// Retry budget for output validation. Falls back to `retries`.
    pub output_retries: Option<u32>,
    /// Handling of function calls next to an accepted output call.
    pub end_strategy: EndStrategy,
    /// Run one response's tool calls concurrently.
    pub parallel_tool_calls: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            retries: 1,
            output_retries: None,
            end_strategy: EndStrategy::default(),
            parallel_tool_calls: true,
        }
    }
}

impl AgentConfig {
    /// The effective output retry budget.
    pub fn max_result_retries(&self) -> u32 {
        self.output_retries.unwrap_or(self.retries)
    }
}

// ── Per-run options ─────────────────────────────────────────────────

/// Options for a single run.
///
/// ```rust
/// use parley::RunOptions;
/// use parley_core::UsageLimits;
///
/// let options = RunOptions::new(())
///     .with_usage_limits(UsageLimits { request_limit: Some(3), ..Default::default() });
/// ```
pub struct RunOptions<Deps> {
    /// Dependencies handed to tools and validators.
    pub deps: Deps,
    /// Earlier conversation to continue from.
    pub message_history: Vec<ModelMessage>,
    /// Settings merged over the agent's.
    pub model_settings: Option<ModelSettings>,
    /// Limits replacing the agent's.
    pub usage_limits: Option<UsageLimits>,
    /// Cancels the run at its next suspension point.
    pub cancellation: Option<CancellationToken>,
}

impl<Deps> RunOptions<Deps> {
    /// Creates options with the given dependencies and nothing else.
    pub fn new(deps: Deps) -> Self {
        Self {
            deps,
            message_history: Vec::new(),
            model_settings: None,
            usage_limits: None,
            cancellation: None,
        }
    }

    /// Continues from an earlier history.
    #[must_use]
    pub fn with_history(mut self, messages: Vec<ModelMessage>) -> Self {
        self.message_history = messages;
        self
    }

    /// Overrides settings for this run.
    #[must_use]
    pub fn with_model_settings(mut self, settings: ModelSettings) -> Self {
        self.model_settings = Some(settings);
        self
    }

    /// Replaces the agent's usage limits for this run.
    #[must_use]
    pub fn with_usage_limits(mut self, limits: UsageLimits) -> Self {
        self.usage_limits = Some(limits);
        self
    }

    /// Attaches a cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

impl<Deps: Default> Default for RunOptions<Deps> {
    fn default() -> Self {
        Self::new(Deps::default())
    }
}

impl<Deps> fmt::Debug for RunOptions<Deps> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("message_history", &self.message_history.len())
            .field("model_settings", &self.model_settings)
            .field("usage_limits", &self.usage_limits)
            .field("cancellable", &self.cancellation.is_some())
            .finish_non_exhaustive()
    }
}

// ── Prompt ──────────────────────────────────────────────────────────

/// The user input that starts a run. May be absent when continuing a
/// history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prompt(pub(crate) Option<UserContent>);

impl Prompt {
    /// No new user input.
    pub fn none() -> Self {
        Self(None)
    }

    /// The prompt text, if it is plain text.
    pub fn as_text(&self) -> Option<&str> {
        self.0.as_ref().and_then(UserContent::as_text)
    }
}

impl From<&str> for Prompt {
    fn from(text: &str) -> Self {
        Self(Some(UserContent::from(text)))
    }
}

impl From<String> for Prompt {
    fn from(text: String) -> Self {
        Self(Some(UserContent::from(text)))
    }
}

impl From<UserContent> for Prompt {
    fn from(content: UserContent) -> Self {
        Self(Some(content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_config_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.retries, 1);
        assert_eq!(config.max_result_retries(), 1);
        assert_eq!(config.end_strategy, EndStrategy::Exhaustive);
        assert!(config.parallel_tool_calls);

        let config = AgentConfig {
            output_retries: Some(0),
            ..Default::default()
        };
        assert_eq!(config.max_result_retries(), 0);
    }

    #[test]
    fn test_agent_config_from_json() {
        let config: AgentConfig =
            serde_json::from_str(r#"{"retries": 3, "end_strategy": "early"}"#).unwrap();
        assert_eq!(config.retries, 3);
        assert_eq!(config.end_strategy, EndStrategy::Early);
        assert!(config.parallel_tool_calls);
    }

    #[test]
    fn test_prompt_conversions() {
        assert_eq!(Prompt::from("Hello!").as_text(), Some("Hello!"));
        assert_eq!(Prompt::none().as_text(), None);
        assert_eq!(Prompt::default(), Prompt::none());
    }
}
