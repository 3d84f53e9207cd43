//! Per-request generation settings.
//!
//! [`ModelSettings`] is a fixed set of knobs that every adapter understands,
//! plus an optional adapter-specific [`SettingsExtension`]. Settings are
//! layered: a model's defaults, overridden by the agent's, overridden by a
//! run's, each via [`ModelSettings::merge`].
//!
//! ```rust
//! use parley_core::ModelSettings;
//!
//! let agent = ModelSettings { temperature: Some(0.2), max_tokens: Some(512), ..Default::default() };
//! let run = ModelSettings { max_tokens: Some(64), ..Default::default() };
//! let merged = agent.merge(&run);
//! assert_eq!(merged.max_tokens, Some(64));
//! assert_eq!(merged.temperature, Some(0.2));
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Adapter-specific settings carried alongside [`ModelSettings`].
///
/// Each adapter defines its own extension type (thinking budgets, safety
/// thresholds, cached-content handles…) and downcasts it through
/// [`as_any`](Self::as_any). The engine validates the extension before the
/// first request of a run.
pub trait SettingsExtension: fmt::Debug + Send + Sync {
    /// Name of the provider the extension belongs to.
    fn provider(&self) -> &str;

    /// Checks the extension's own invariants.
    fn validate(&self) -> Result<(), ModelError> {
        Ok(())
    }

    /// Enables downcasting to the concrete type.
    fn as_any(&self) -> &dyn Any;
}

/// Generation settings understood by every adapter.
///
/// Unset fields defer to the next layer down, and ultimately to the
/// backend's own defaults.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f64>,
    /// Nucleus sampling cutoff.
    pub top_p: Option<f64>,
    /// Deadline for a single provider call.
    #[serde(skip)]
    pub timeout: Option<Duration>,
    /// Seed for deterministic sampling, where supported.
    pub seed: Option<i64>,
    /// Sequences that stop generation.
    pub stop_sequences: Option<Vec<String>>,
    /// Penalty for tokens already present.
    pub presence_penalty: Option<f64>,
    /// Penalty proportional to token frequency.
    pub frequency_penalty: Option<f64>,
    /// Whether the model may request several tool calls per response.
    pub parallel_tool_calls: Option<bool>,
    /// Adapter-specific settings.
    #[serde(skip)]
    pub extension: Option<Arc<dyn SettingsExtension>>,
}

impl fmt::Debug for ModelSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelSettings")
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("top_p", &self.top_p)
            .field("timeout", &self.timeout)
            .field("seed", &self.seed)
            .field("stop_sequences", &self.stop_sequences)
            .field("parallel_tool_calls", &self.parallel_tool_calls)
            .field(
                "extension",
                &self.extension.as_ref().map(|ext| ext.provider().to_owned()),
            )
            .finish_non_exhaustive()
    }
}

impl ModelSettings {
    /// Returns a copy of `self` with every field set in `overrides` replaced.
    #[must_use]
    pub fn merge(&self, overrides: &ModelSettings) -> ModelSettings {
        ModelSettings {
            max_tokens: overrides.max_tokens.or(self.max_tokens),
            temperature: overrides.temperature.or(self.temperature),
            top_p: overrides.top_p.or(self.top_p),
            timeout: overrides.timeout.or(self.timeout),
            seed: overrides.seed.or(self.seed),
            stop_sequences: overrides
                .stop_sequences
                .clone()
                .or_else(|| self.stop_sequences.clone()),
            presence_penalty: overrides.presence_penalty.or(self.presence_penalty),
            frequency_penalty: overrides.frequency_penalty.or(self.frequency_penalty),
            parallel_tool_calls: overrides.parallel_tool_calls.or(self.parallel_tool_calls),
            extension: overrides
                .extension
                .clone()
                .or_else(|| self.extension.clone()),
        }
    }

    /// Checks the universal fields and the extension.
    pub fn validate(&self) -> Result<(), ModelError> {
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(ModelError::InvalidSettings(format!(
                    "temperature must be between 0 and 2, got {t}"
                )));
            }
        }
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(ModelError::InvalidSettings(format!(
                    "top_p must be between 0 and 1, got {p}"
                )));
            }
        }
        if self.max_tokens == Some(0) {
            return Err(ModelError::InvalidSettings(
                "max_tokens must be greater than 0".into(),
            ));
        }
        if let Some(ext) = &self.extension {
            ext.validate()?;
        }
        Ok(())
    }

    /// Downcasts the extension to `T`, if present and of that type.
    pub fn extension_as<T: 'static>(&self) -> Option<&T> {
        self.extension.as_deref()?.as_any().downcast_ref::<T>()
    }
}
