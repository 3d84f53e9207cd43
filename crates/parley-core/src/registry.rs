//! Dynamic model registry for configuration-driven model selection.
//!
//! Adapters register a [`ModelFactory`] under a provider name; applications
//! then build models from a [`ModelConfig`], typically parsed from a
//! `"provider:model"` string, without knowing at compile time which
//! adapters are linked in.
//!
//! ```rust,no_run
//! use parley_core::registry::{ModelConfig, ModelRegistry};
//!
//! let config = ModelConfig::parse("google:gemini-2.0-flash")
//!     .unwrap()
//!     .api_key("...");
//! let model = ModelRegistry::global().build(&config).expect("provider registered");
//! ```
//!
//! # Registering adapters
//!
//! ```rust,ignore
//! use parley_core::registry::{ModelConfig, ModelFactory, ModelRegistry};
//!
//! struct GoogleFactory;
//!
//! impl ModelFactory for GoogleFactory {
//!     fn name(&self) -> &str { "google" }
//!
//!     fn build(&self, config: &ModelConfig) -> Result<Arc<dyn DynModel>, ModelError> {
//!         // Build and return the adapter
//!     }
//! }
//!
//! ModelRegistry::global().register(Box::new(GoogleFactory));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::Duration;

use crate::error::ModelError;
use crate::provider::DynModel;

/// Configuration for building a model from the registry.
///
/// Options that are not common to every adapter go in `extra`.
#[derive(Clone, Default)]
pub struct ModelConfig {
    /// Provider name (e.g. `"google"`, `"openai"`).
    pub provider: String,
    /// Model identifier (e.g. `"gemini-2.0-flash"`).
    pub model: String,
    /// API key for authenticated backends.
    pub api_key: Option<String>,
    /// Custom endpoint.
    pub base_url: Option<String>,
    /// Request timeout.
    pub timeout: Option<Duration>,
    /// Adapter-specific options.
    pub extra: HashMap<String, serde_json::Value>,
}

impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("extra", &self.extra)
            .finish()
    }
}

impl ModelConfig {
    /// Creates a config for the given provider and model.
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    /// Parses a `"provider:model"` identifier.
    ///
    /// Only the first `:` separates the two, so model names may contain
    /// colons of their own.
    pub fn parse(id: &str) -> Result<Self, ModelError> {
        match id.split_once(':') {
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => {
                Ok(Self::new(provider, model))
            }
            _ => Err(ModelError::InvalidRequest(format!(
                "model identifier '{id}' must have the form 'provider:model'"
            ))),
        }
    }

    /// Sets the API key.
    #[must_use]
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sets the base URL.
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Adds an adapter-specific option.
    #[must_use]
    pub fn extra(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Gets a string option.
    pub fn get_extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }

    /// Gets a bool option.
    pub fn get_extra_bool(&self, key: &str) -> Option<bool> {
        self.extra.get(key).and_then(serde_json::Value::as_bool)
    }

    /// Gets an integer option.
    pub fn get_extra_i64(&self, key: &str) -> Option<i64> {
        self.extra.get(key).and_then(serde_json::Value::as_i64)
    }
}

/// Creates models from configuration.
pub trait ModelFactory: Send + Sync {
    /// Lowercase provider name used for registration and lookup.
    fn name(&self) -> &str;

    /// Builds a model.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is missing something the
    /// adapter needs.
    fn build(&self, config: &ModelConfig) -> Result<Arc<dyn DynModel>, ModelError>;
}

/// A thread-safe map of provider names to factories.
///
/// Use [`ModelRegistry::global()`] for the process-wide registry, or
/// [`ModelRegistry::new()`] for an isolated one.
pub struct ModelRegistry {
    factories: RwLock<HashMap<String, Arc<dyn ModelFactory>>>,
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the process-wide registry.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<ModelRegistry> = OnceLock::new();
        GLOBAL.get_or_init(ModelRegistry::new)
    }

    /// Registers a factory, replacing any with the same name.
    pub fn register(&self, factory: Box<dyn ModelFactory>) -> &Self {
        self.register_shared(Arc::from(factory))
    }

    /// Registers a shared factory, replacing any with the same name.
    pub fn register_shared(&self, factory: Arc<dyn ModelFactory>) -> &Self {
        let name = factory.name().to_lowercase();
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, factory);
        self
    }

    /// Removes a factory. Returns `true` if one was registered.
    pub fn unregister(&self, name: &str) -> bool {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&name.to_lowercase())
            .is_some()
    }

    /// Checks whether a provider is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&name.to_lowercase())
    }

    /// Names of all registered providers, sorted.
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Builds a model from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidRequest`] if no factory is registered
    /// for `config.provider`, or whatever the factory returns.
    pub fn build(&self, config: &ModelConfig) -> Result<Arc<dyn DynModel>, ModelError> {
        let factory = {
            let factories = self.factories.read().unwrap_or_else(PoisonError::into_inner);
            factories
                .get(&config.provider.to_lowercase())
                .cloned()
                .ok_or_else(|| {
                    let mut available: Vec<_> = factories.keys().cloned().collect();
                    available.sort();
                    ModelError::InvalidRequest(format!(
                        "unknown provider '{}'. Available: {:?}",
                        config.provider, available
                    ))
                })?
        };
        tracing::debug!(provider = %config.provider, model = %config.model, "building model");
        factory.build(config)
    }
}
