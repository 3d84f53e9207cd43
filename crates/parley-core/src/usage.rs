//! Token usage accounting and usage limits.
//!
//! Every [`ModelResponse`](crate::messages::ModelResponse) carries a
//! [`RequestUsage`] for its round. The engine folds those into a single
//! [`RunUsage`] per run, counting requests and tool calls alongside tokens,
//! and checks it against a caller's [`UsageLimits`] at three points:
//!
//! | When | Method | Message form |
//! |------|--------|--------------|
//! | before each request | [`UsageLimits::check_before_request`] | `The next request would exceed the …` |
//! | after each response | [`UsageLimits::check`] | `Exceeded the …` |
//! | before dispatching tools | [`UsageLimits::check_before_tool_call`] | `The next tool call(s) would exceed the …` |
//!
//! None of this holds state: the `RunUsage` value is owned by the run and
//! threaded through it.
//!
//! ```rust
//! use parley_core::usage::{RequestUsage, RunUsage, UsageLimits};
//!
//! let mut usage = RunUsage::default();
//! usage.incr(&RequestUsage { input_tokens: 12, output_tokens: 3, ..Default::default() });
//!
//! let limits = UsageLimits { input_tokens_limit: Some(9), ..Default::default() };
//! let err = limits.check(&usage).unwrap_err();
//! assert_eq!(err.to_string(), "Exceeded the input_tokens_limit of 9 (input_tokens=12)");
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

fn add_details(into: &mut BTreeMap<String, u64>, from: &BTreeMap<String, u64>) {
    for (key, value) in from {
        let slot = into.entry(key.clone()).or_insert(0);
        *slot = slot.saturating_add(*value);
    }
}

/// Token counts for a single request/response round.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestUsage {
    /// Tokens consumed by the prompt (messages, instructions, tool defs).
    pub input_tokens: u64,
    /// Tokens produced by the model.
    pub output_tokens: u64,
    /// Input tokens served from the backend's prompt cache.
    pub cache_read_tokens: u64,
    /// Input tokens written into the backend's prompt cache.
    pub cache_write_tokens: u64,
    /// Backend-specific counters, e.g. `thoughts_tokens`.
    pub details: BTreeMap<String, u64>,
}

impl RequestUsage {
    /// `input_tokens + output_tokens`.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    /// Returns `true` if every counter is zero.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl Add for RequestUsage {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self {
        self += &rhs;
        self
    }
}

impl AddAssign<&RequestUsage> for RequestUsage {
    /// Adds another round's counts field by field.
    ///
    /// Streaming adapters report usage incrementally; summing the partial
    /// reports gives the round's total.
    fn add_assign(&mut self, rhs: &Self) {
        self.input_tokens = self.input_tokens.saturating_add(rhs.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(rhs.output_tokens);
        self.cache_read_tokens = self.cache_read_tokens.saturating_add(rhs.cache_read_tokens);
        self.cache_write_tokens = self
            .cache_write_tokens
            .saturating_add(rhs.cache_write_tokens);
        add_details(&mut self.details, &rhs.details);
    }
}

/// Cumulative usage across every round of a run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunUsage {
    /// Provider requests sent.
    pub requests: u64,
    /// Function tool calls executed successfully.
    pub tool_calls: u64,
    /// Sum of every round's input tokens.
    pub input_tokens: u64,
    /// Sum of every round's output tokens.
    pub output_tokens: u64,
    /// Sum of every round's cache-read tokens.
    pub cache_read_tokens: u64,
    /// Sum of every round's cache-write tokens.
    pub cache_write_tokens: u64,
    /// Per-key sums of every round's backend-specific counters.
    pub details: BTreeMap<String, u64>,
}

impl RunUsage {
    /// Folds one round's token counts into the run total.
    ///
    /// `requests` is left alone; the engine counts requests when it sends
    /// them.
    pub fn incr(&mut self, usage: &RequestUsage) {
        self.input_tokens = self.input_tokens.saturating_add(usage.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(usage.output_tokens);
        self.cache_read_tokens = self.cache_read_tokens.saturating_add(usage.cache_read_tokens);
        self.cache_write_tokens = self
            .cache_write_tokens
            .saturating_add(usage.cache_write_tokens);
        add_details(&mut self.details, &usage.details);
    }

    /// `input_tokens + output_tokens`.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

impl AddAssign<&RunUsage> for RunUsage {
    fn add_assign(&mut self, rhs: &Self) {
        self.requests = self.requests.saturating_add(rhs.requests);
        self.tool_calls = self.tool_calls.saturating_add(rhs.tool_calls);
        self.input_tokens = self.input_tokens.saturating_add(rhs.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(rhs.output_tokens);
        self.cache_read_tokens = self.cache_read_tokens.saturating_add(rhs.cache_read_tokens);
        self.cache_write_tokens = self
            .cache_write_tokens
            .saturating_add(rhs.cache_write_tokens);
        add_details(&mut self.details, &rhs.details);
    }
}

impl AddAssign<&RequestUsage> for RunUsage {
    fn add_assign(&mut self, rhs: &RequestUsage) {
        self.incr(rhs);
    }
}

/// Returns `run` with `request`'s counts added.
pub fn merge(run: &RunUsage, request: &RequestUsage) -> RunUsage {
    let mut out = run.clone();
    out.incr(request);
    out
}

// ── Limits ──────────────────────────────────────────────────────────

/// Budgets a run must stay within.
///
/// All limits are inclusive: a count equal to the limit is allowed.
///
/// ```rust
/// use parley_core::usage::UsageLimits;
///
/// let limits = UsageLimits {
///     total_tokens_limit: Some(10_000),
///     count_tokens_before_request: true,
///     ..Default::default()
/// };
/// assert_eq!(limits.request_limit, Some(50));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageLimits {
    /// Maximum provider requests per run.
    pub request_limit: Option<u64>,
    /// Maximum successful function tool calls per run.
    pub tool_calls_limit: Option<u64>,
    /// Maximum cumulative input tokens.
    pub input_tokens_limit: Option<u64>,
    /// Maximum cumulative output tokens.
    pub output_tokens_limit: Option<u64>,
    /// Maximum cumulative input plus output tokens.
    pub total_tokens_limit: Option<u64>,
    /// Ask the backend to count a request's tokens before sending it, so a
    /// request that would breach a token limit is never sent.
    pub count_tokens_before_request: bool,
}

impl Default for UsageLimits {
    fn default() -> Self {
        Self {
            request_limit: Some(50),
            tool_calls_limit: None,
            input_tokens_limit: None,
            output_tokens_limit: None,
            total_tokens_limit: None,
            count_tokens_before_request: false,
        }
    }
}

impl UsageLimits {
    /// No limits at all, not even the default request limit.
    pub fn unlimited() -> Self {
        Self {
            request_limit: None,
            ..Self::default()
        }
    }

    /// Returns `true` if any token limit is set.
    pub fn has_token_limits(&self) -> bool {
        self.input_tokens_limit.is_some()
            || self.output_tokens_limit.is_some()
            || self.total_tokens_limit.is_some()
    }

    /// Checks whether one more request may be sent.
    ///
    /// `prospective` is the run usage as it would stand once the next request
    /// is counted: the current totals, plus a pre-flight token count when one
    /// was taken. The request limit is compared with the requests sent so far.
    pub fn check_before_request(&self, prospective: &RunUsage) -> Result<(), UsageLimitExceeded> {
        if let Some(limit) = self.request_limit.filter(|l| prospective.requests >= *l) {
            return Err(UsageLimitExceeded::prospective(
                LimitKind::Requests,
                limit,
                prospective.requests.saturating_add(1),
            ));
        }
        if let Some(limit) = self.input_tokens_limit.filter(|l| prospective.input_tokens > *l) {
            return Err(UsageLimitExceeded::prospective(
                LimitKind::InputTokens,
                limit,
                prospective.input_tokens,
            ));
        }
        if let Some(limit) = self
            .total_tokens_limit
            .filter(|l| prospective.total_tokens() > *l)
        {
            return Err(UsageLimitExceeded::prospective(
                LimitKind::TotalTokens,
                limit,
                prospective.total_tokens(),
            ));
        }
        Ok(())
    }

    /// Checks the token limits against usage after a response arrived.
    pub fn check(&self, usage: &RunUsage) -> Result<(), UsageLimitExceeded> {
        let checks = [
            (LimitKind::InputTokens, self.input_tokens_limit, usage.input_tokens),
            (LimitKind::OutputTokens, self.output_tokens_limit, usage.output_tokens),
            (LimitKind::TotalTokens, self.total_tokens_limit, usage.total_tokens()),
        ];
        for (kind, limit, observed) in checks {
            if let Some(limit) = limit.filter(|l| observed > *l) {
                return Err(UsageLimitExceeded::exceeded(kind, limit, observed));
            }
        }
        Ok(())
    }

    /// Checks whether a batch of tool calls may run.
    ///
    /// `projected` has `tool_calls` already increased by the batch size.
    pub fn check_before_tool_call(&self, projected: &RunUsage) -> Result<(), UsageLimitExceeded> {
        if let Some(limit) = self.tool_calls_limit.filter(|l| projected.tool_calls > *l) {
            return Err(UsageLimitExceeded::prospective(
                LimitKind::ToolCalls,
                limit,
                projected.tool_calls,
            ));
        }
        Ok(())
    }
}

/// Free-function form of [`UsageLimits::check`].
pub fn check(usage: &RunUsage, limits: &UsageLimits) -> Result<(), UsageLimitExceeded> {
    limits.check(usage)
}

/// Which budget was breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    /// [`UsageLimits::request_limit`].
    Requests,
    /// [`UsageLimits::tool_calls_limit`].
    ToolCalls,
    /// [`UsageLimits::input_tokens_limit`].
    InputTokens,
    /// [`UsageLimits::output_tokens_limit`].
    OutputTokens,
    /// [`UsageLimits::total_tokens_limit`].
    TotalTokens,
}

impl LimitKind {
    /// Name of the limit setting, e.g. `input_tokens_limit`.
    pub fn limit_name(self) -> &'static str {
        match self {
            Self::Requests => "request_limit",
            Self::ToolCalls => "tool_calls_limit",
            Self::InputTokens => "input_tokens_limit",
            Self::OutputTokens => "output_tokens_limit",
            Self::TotalTokens => "total_tokens_limit",
        }
    }

    /// Name of the counter the limit applies to, e.g. `input_tokens`.
    pub fn counter_name(self) -> &'static str {
        match self {
            Self::Requests => "requests",
            Self::ToolCalls => "tool_calls",
            Self::InputTokens => "input_tokens",
            Self::OutputTokens => "output_tokens",
            Self::TotalTokens => "total_tokens",
        }
    }
}

/// A usage budget was, or would be, exceeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLimitExceeded {
    /// The breached budget.
    pub limit: LimitKind,
    /// The configured limit.
    pub limit_value: u64,
    /// The count that breached it.
    pub observed: u64,
    /// `true` if the breach was detected before acting (nothing was sent or
    /// executed); `false` if it was detected after a response arrived.
    pub prospective: bool,
}

impl UsageLimitExceeded {
    fn prospective(limit: LimitKind, limit_value: u64, observed: u64) -> Self {
        Self {
            limit,
            limit_value,
            observed,
            prospective: true,
        }
    }

    fn exceeded(limit: LimitKind, limit_value: u64, observed: u64) -> Self {
        Self {
            limit,
            limit_value,
            observed,
            prospective: false,
        }
    }
}

impl fmt::Display for UsageLimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.limit.limit_name();
        let counter = self.limit.counter_name();
        match (self.prospective, self.limit) {
            (true, LimitKind::Requests) => write!(
                f,
                "The next request would exceed the {name} of {}",
                self.limit_value
            ),
            (true, LimitKind::ToolCalls) => write!(
                f,
                "The next tool call(s) would exceed the {name} of {} ({counter}={})",
                self.limit_value, self.observed
            ),
            (true, _) => write!(
                f,
                "The next request would exceed the {name} of {} ({counter}={})",
                self.limit_value, self.observed
            ),
            (false, _) => write!(
                f,
                "Exceeded the {name} of {} ({counter}={})",
                self.limit_value, self.observed
            ),
        }
    }
}

impl std::error::Error for UsageLimitExceeded {}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(input: u64, output: u64) -> RequestUsage {
        RequestUsage {
            input_tokens: input,
            output_tokens: output,
            ..Default::default()
        }
    }

    #[test]
    fn test_incr_sums_fields_and_details() {
        let mut run = RunUsage::default();
        run.incr(&RequestUsage {
            input_tokens: 57,
            output_tokens: 15,
            details: [("thoughts_tokens".to_owned(), 10)].into(),
            ..Default::default()
        });
        run.incr(&RequestUsage {
            input_tokens: 3,
            output_tokens: 5,
            cache_read_tokens: 2,
            details: [
                ("thoughts_tokens".to_owned(), 5),
                ("text_prompt_tokens".to_owned(), 3),
            ]
            .into(),
            ..Default::default()
        });
        assert_eq!(run.input_tokens, 60);
        assert_eq!(run.output_tokens, 20);
        assert_eq!(run.cache_read_tokens, 2);
        assert_eq!(run.details["thoughts_tokens"], 15);
        assert_eq!(run.details["text_prompt_tokens"], 3);
        assert_eq!(run.requests, 0);
        assert_eq!(run.total_tokens(), 80);
    }

    #[test]
    fn test_merge_leaves_input_untouched() {
        let run = RunUsage {
            requests: 1,
            input_tokens: 5,
            ..Default::default()
        };
        let merged = merge(&run, &request(7, 1));
        assert_eq!(run.input_tokens, 5);
        assert_eq!(merged.input_tokens, 12);
        assert_eq!(merged.output_tokens, 1);
        assert_eq!(merged.requests, 1);
    }

    #[test]
    fn test_request_usage_add_saturates() {
        let sum = request(u64::MAX, 0) + request(1, 2);
        assert_eq!(sum.input_tokens, u64::MAX);
        assert_eq!(sum.output_tokens, 2);
    }

    #[test]
    fn test_run_usage_add_assign() {
        let mut a = RunUsage {
            requests: 1,
            tool_calls: 2,
            input_tokens: 10,
            ..Default::default()
        };
        a += &RunUsage {
            requests: 2,
            tool_calls: 1,
            input_tokens: 5,
            ..Default::default()
        };
        assert_eq!(a.requests, 3);
        assert_eq!(a.tool_calls, 3);
        assert_eq!(a.input_tokens, 15);
    }

    #[test]
    fn test_default_limits() {
        let limits = UsageLimits::default();
        assert_eq!(limits.request_limit, Some(50));
        assert!(!limits.has_token_limits());
        assert!(!limits.count_tokens_before_request);
        assert_eq!(UsageLimits::unlimited().request_limit, None);
    }

    #[test]
    fn test_limits_deserialize_with_defaults() {
        let limits: UsageLimits = serde_json::from_str(r#"{"input_tokens_limit": 9}"#).unwrap();
        assert_eq!(limits.input_tokens_limit, Some(9));
        assert_eq!(limits.request_limit, Some(50));
    }

    #[test]
    fn test_check_after_response() {
        let limits = UsageLimits {
            input_tokens_limit: Some(9),
            ..Default::default()
        };
        let usage = RunUsage {
            input_tokens: 12,
            ..Default::default()
        };
        let err = check(&usage, &limits).unwrap_err();
        assert_eq!(err.limit, LimitKind::InputTokens);
        assert!(!err.prospective);
        assert_eq!(
            err.to_string(),
            "Exceeded the input_tokens_limit of 9 (input_tokens=12)"
        );
    }

    #[test]
    fn test_check_is_inclusive() {
        let limits = UsageLimits {
            output_tokens_limit: Some(10),
            total_tokens_limit: Some(20),
            ..Default::default()
        };
        let usage = RunUsage {
            input_tokens: 10,
            output_tokens: 10,
            ..Default::default()
        };
        assert!(limits.check(&usage).is_ok());
    }

    #[test]
    fn test_check_total_tokens() {
        let limits = UsageLimits {
            total_tokens_limit: Some(15),
            ..Default::default()
        };
        let usage = RunUsage {
            input_tokens: 10,
            output_tokens: 10,
            ..Default::default()
        };
        assert_eq!(
            limits.check(&usage).unwrap_err().to_string(),
            "Exceeded the total_tokens_limit of 15 (total_tokens=20)"
        );
    }

    #[test]
    fn test_check_before_request_tokens() {
        let limits = UsageLimits {
            input_tokens_limit: Some(9),
            ..Default::default()
        };
        let prospective = RunUsage {
            input_tokens: 12,
            ..Default::default()
        };
        let err = limits.check_before_request(&prospective).unwrap_err();
        assert!(err.prospective);
        assert_eq!(
            err.to_string(),
            "The next request would exceed the input_tokens_limit of 9 (input_tokens=12)"
        );
    }

    #[test]
    fn test_check_before_request_request_limit() {
        let limits = UsageLimits {
            request_limit: Some(2),
            ..Default::default()
        };
        let mut usage = RunUsage {
            requests: 1,
            ..Default::default()
        };
        assert!(limits.check_before_request(&usage).is_ok());
        usage.requests = 2;
        let err = limits.check_before_request(&usage).unwrap_err();
        assert_eq!(err.limit, LimitKind::Requests);
        assert_eq!(
            err.to_string(),
            "The next request would exceed the request_limit of 2"
        );
    }

    #[test]
    fn test_check_before_tool_call() {
        let limits = UsageLimits {
            tool_calls_limit: Some(1),
            ..Default::default()
        };
        let projected = RunUsage {
            tool_calls: 2,
            ..Default::default()
        };
        assert_eq!(
            limits.check_before_tool_call(&projected).unwrap_err().to_string(),
            "The next tool call(s) would exceed the tool_calls_limit of 1 (tool_calls=2)"
        );
        assert!(UsageLimits::default().check_before_tool_call(&projected).is_ok());
    }

    #[test]
    fn test_usage_serde_roundtrip() {
        let usage = RunUsage {
            requests: 2,
            input_tokens: 3,
            details: [("x".to_owned(), 1)].into(),
            ..Default::default()
        };
        let json = serde_json::to_string(&usage).unwrap();
        let back: RunUsage = serde_json::from_str(&json).unwrap();
        assert_eq!(usage, back);
    }
}
