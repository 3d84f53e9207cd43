//! The model adapter contract and request parameter types.
//!
//! This module defines two core abstractions:
//!
//! - **[`Model`]**: the trait every backend adapter implements. It uses
//!   Rust 2024's native async-fn-in-traits, so implementations are plain
//!   `async fn`s.
//!
//! - **[`DynModel`]**: an object-safe mirror of `Model` with boxed
//!   futures. A blanket `impl<T: Model> DynModel for T` bridges the two,
//!   so any adapter can be stored as `Arc<dyn DynModel>`.
//!
//! | Situation | Use |
//! |-----------|-----|
//! | Generic code that knows the concrete type | `Model` |
//! | Storing models in a registry or agent | `DynModel` |
//! | Implementing a new backend | `impl Model for MyBackend` |
//!
//! # What an adapter receives
//!
//! Every call gets the full message history, ending with the
//! [`ModelRequest`](crate::messages::ModelRequest) for the current round,
//! the merged [`ModelSettings`], and the [`ModelRequestParameters`] that
//! describe the tools and output mode for this run. Adapters translate those
//! into their wire format; nothing else about the run is visible to them.
//!
//! # Capabilities
//!
//! [`ModelMetadata::profile`] declares what the backend supports. The engine
//! checks it before the first request, so a run that asks for, say, native
//! structured output on a backend without it fails up front with a
//! configuration error instead of an opaque provider rejection.

use std::borrow::Cow;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ModelError;
use crate::messages::{ErrorDetails, ModelMessage, ModelResponse};
use crate::settings::ModelSettings;
use crate::stream::ChunkStream;
use crate::usage::RequestUsage;

/// The trait every model backend implements.
///
/// `Model` is **not** object-safe because its methods return `impl Future`.
/// Use [`DynModel`] for dynamic dispatch; every `Model` implements it
/// automatically.
pub trait Model: Send + Sync {
    /// Sends one round and returns the whole response.
    fn request(
        &self,
        messages: &[ModelMessage],
        settings: &ModelSettings,
        params: &ModelRequestParameters,
    ) -> impl Future<Output = Result<ModelResponse, ModelError>> + Send;

    /// Sends one round and returns the response as a chunk stream.
    ///
    /// Wrap the stream in a [`StreamedResponse`](crate::stream::StreamedResponse)
    /// to assemble it.
    fn request_stream(
        &self,
        messages: &[ModelMessage],
        settings: &ModelSettings,
        params: &ModelRequestParameters,
    ) -> impl Future<Output = Result<ChunkStream, ModelError>> + Send;

    /// Counts the input tokens a request would consume, without sending it.
    ///
    /// The default reports [`ModelError::Unsupported`].
    fn count_tokens(
        &self,
        _messages: &[ModelMessage],
        _settings: &ModelSettings,
        _params: &ModelRequestParameters,
    ) -> impl Future<Output = Result<RequestUsage, ModelError>> + Send {
        let name = self.metadata().provider_name;
        async move {
            Err(ModelError::Unsupported(format!(
                "token counting is not supported by {name}"
            )))
        }
    }

    /// Returns static metadata describing this model.
    fn metadata(&self) -> ModelMetadata;

    /// Checks settings and parameters before a run's first request.
    ///
    /// Adapters validate their settings extension here. The default accepts
    /// everything.
    fn validate_request(
        &self,
        _settings: &ModelSettings,
        _params: &ModelRequestParameters,
    ) -> Result<(), ModelError> {
        Ok(())
    }
}

/// Object-safe counterpart of [`Model`] for dynamic dispatch.
///
/// You rarely implement this directly; the blanket impl does it for you.
///
/// ```rust,no_run
/// use parley_core::{DynModel, ModelMessage, ModelRequest, ModelRequestParameters, ModelSettings};
///
/// async fn ask(model: &dyn DynModel, question: &str) -> Option<String> {
///     let messages = vec![ModelMessage::Request(ModelRequest::user_text_prompt(question))];
///     let params = ModelRequestParameters::default();
///     let resp = model
///         .request_boxed(&messages, &ModelSettings::default(), &params)
///         .await
///         .ok()?;
///     resp.text()
/// }
/// ```
pub trait DynModel: Send + Sync {
    /// Boxed-future version of [`Model::request`].
    fn request_boxed<'a>(
        &'a self,
        messages: &'a [ModelMessage],
        settings: &'a ModelSettings,
        params: &'a ModelRequestParameters,
    ) -> Pin<Box<dyn Future<Output = Result<ModelResponse, ModelError>> + Send + 'a>>;

    /// Boxed-future version of [`Model::request_stream`].
    fn request_stream_boxed<'a>(
        &'a self,
        messages: &'a [ModelMessage],
        settings: &'a ModelSettings,
        params: &'a ModelRequestParameters,
    ) -> Pin<Box<dyn Future<Output = Result<ChunkStream, ModelError>> + Send + 'a>>;

    /// Boxed-future version of [`Model::count_tokens`].
    fn count_tokens_boxed<'a>(
        &'a self,
        messages: &'a [ModelMessage],
        settings: &'a ModelSettings,
        params: &'a ModelRequestParameters,
    ) -> Pin<Box<dyn Future<Output = Result<RequestUsage, ModelError>> + Send + 'a>>;

    /// See [`Model::metadata`].
    fn metadata(&self) -> ModelMetadata;

    /// See [`Model::validate_request`].
    fn validate_request(
        &self,
        settings: &ModelSettings,
        params: &ModelRequestParameters,
    ) -> Result<(), ModelError>;
}

impl<T: Model> DynModel for T {
    fn request_boxed<'a>(
        &'a self,
        messages: &'a [ModelMessage],
        settings: &'a ModelSettings,
        params: &'a ModelRequestParameters,
    ) -> Pin<Box<dyn Future<Output = Result<ModelResponse, ModelError>> + Send + 'a>> {
        Box::pin(self.request(messages, settings, params))
    }

    fn request_stream_boxed<'a>(
        &'a self,
        messages: &'a [ModelMessage],
        settings: &'a ModelSettings,
        params: &'a ModelRequestParameters,
    ) -> Pin<Box<dyn Future<Output = Result<ChunkStream, ModelError>> + Send + 'a>> {
        Box::pin(self.request_stream(messages, settings, params))
    }

    fn count_tokens_boxed<'a>(
        &'a self,
        messages: &'a [ModelMessage],
        settings: &'a ModelSettings,
        params: &'a ModelRequestParameters,
    ) -> Pin<Box<dyn Future<Output = Result<RequestUsage, ModelError>> + Send + 'a>> {
        Box::pin(self.count_tokens(messages, settings, params))
    }

    fn metadata(&self) -> ModelMetadata {
        Model::metadata(self)
    }

    fn validate_request(
        &self,
        settings: &ModelSettings,
        params: &ModelRequestParameters,
    ) -> Result<(), ModelError> {
        Model::validate_request(self, settings, params)
    }
}

/// Describes a model instance: who serves it and what it can do.
///
/// `provider_name` is a [`Cow<'static, str>`] so built-in adapters can use
/// a literal while dynamically configured ones use owned strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Provider name (e.g. `"google"`, `"openai"`).
    pub provider_name: Cow<'static, str>,
    /// Model identifier (e.g. `"gemini-2.0-flash"`).
    pub model_name: String,
    /// Capability flags.
    pub profile: ModelProfile,
}

/// How the final output of a run is extracted from model responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Plain text.
    #[default]
    Text,
    /// The model calls an output tool whose arguments are the output.
    Tool,
    /// The backend constrains its text to a JSON schema.
    Native,
    /// The schema is described in the instructions and the text parsed.
    Prompted,
}

/// Default instructions template for prompted output; `{schema}` is
/// replaced with the JSON schema.
pub const DEFAULT_PROMPTED_OUTPUT_TEMPLATE: &str = "Always respond with a JSON object that's compatible with this schema:\n\n{schema}\n\nDon't include any text or Markdown fencing before or after.";

/// What a backend supports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelProfile {
    /// Function tools can be offered.
    pub supports_tools: bool,
    /// The backend can constrain output to a JSON schema.
    pub supports_json_schema_output: bool,
    /// The backend can constrain output to a JSON object.
    pub supports_json_object_output: bool,
    /// Native structured output may be combined with function tools.
    pub supports_tools_with_native_output: bool,
    /// Output mode used when an output type is declared without one.
    pub default_structured_output_mode: OutputMode,
    /// Instructions template for prompted output.
    pub prompted_output_template: String,
}

impl Default for ModelProfile {
    fn default() -> Self {
        Self {
            supports_tools: true,
            supports_json_schema_output: false,
            supports_json_object_output: false,
            supports_tools_with_native_output: false,
            default_structured_output_mode: OutputMode::Tool,
            prompted_output_template: DEFAULT_PROMPTED_OUTPUT_TEMPLATE.to_owned(),
        }
    }
}

impl ModelProfile {
    /// A profile that supports every feature, used by in-process models.
    pub fn full() -> Self {
        Self {
            supports_json_schema_output: true,
            supports_json_object_output: true,
            supports_tools_with_native_output: true,
            ..Self::default()
        }
    }
}

/// Whether a tool is an ordinary function tool or an output tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// Executed locally; its result is returned to the model.
    #[default]
    Function,
    /// Its arguments are the run's final output.
    Output,
}

/// A tool offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Name the model calls the tool by.
    pub name: String,
    /// Shown to the model so it knows when to use the tool.
    pub description: String,
    /// JSON Schema for the arguments.
    pub parameters: JsonSchema,
    /// Ask the backend for strict schema adherence, where supported.
    #[serde(default)]
    pub strict: Option<bool>,
    /// Function or output tool.
    #[serde(default)]
    pub kind: ToolKind,
}

impl ToolDefinition {
    /// Creates a function tool definition.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: JsonSchema,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            strict: None,
            kind: ToolKind::Function,
        }
    }
}

/// The schema native or prompted output must conform to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputObjectDefinition {
    /// Schema name, when the backend wants one.
    pub name: Option<String>,
    /// Schema description.
    pub description: Option<String>,
    /// The schema.
    pub json_schema: JsonSchema,
    /// Ask the backend for strict schema adherence, where supported.
    #[serde(default)]
    pub strict: Option<bool>,
}

/// A tool the backend executes itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[non_exhaustive]
pub enum BuiltinTool {
    /// Web search.
    WebSearch,
    /// Sandboxed code execution.
    CodeExecution,
    /// Fetching and reading URLs from the prompt.
    UrlContext,
    /// Anything else, by backend-specific name.
    Custom {
        /// The backend's name for the tool.
        name: String,
    },
}

/// Everything about a run that an adapter must encode into each request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelRequestParameters {
    /// Function tools the model may call.
    pub function_tools: Vec<ToolDefinition>,
    /// Builtin tools the backend should enable.
    pub builtin_tools: Vec<BuiltinTool>,
    /// How output is extracted.
    pub output_mode: OutputMode,
    /// Schema for native or prompted output.
    pub output_object: Option<OutputObjectDefinition>,
    /// Output tools for tool output.
    pub output_tools: Vec<ToolDefinition>,
    /// Whether a plain-text response can end the run.
    pub allow_text_output: bool,
}

impl Default for ModelRequestParameters {
    fn default() -> Self {
        Self {
            function_tools: Vec::new(),
            builtin_tools: Vec::new(),
            output_mode: OutputMode::Text,
            output_object: None,
            output_tools: Vec::new(),
            allow_text_output: true,
        }
    }
}

impl ModelRequestParameters {
    /// Function tools followed by output tools.
    pub fn tool_defs(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.function_tools.iter().chain(self.output_tools.iter())
    }
}

// ── JsonSchema ──────────────────────────────────────────────────────

/// A JSON Schema validation failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum SchemaError {
    /// The schema document itself is malformed.
    #[error("invalid JSON schema: {0}")]
    InvalidSchema(String),
    /// The value does not conform to the schema.
    #[error("{} schema violation(s)", .0.len())]
    Violations(Vec<ErrorDetails>),
}

/// A JSON Schema document used for tool parameters or structured output.
///
/// Wraps a [`serde_json::Value`] and validates with the [`jsonschema`]
/// crate.
///
/// ```rust
/// use parley_core::JsonSchema;
///
/// let schema = JsonSchema::new(serde_json::json!({
///     "type": "object",
///     "properties": { "country": { "type": "string" } },
///     "required": ["country"]
/// }));
/// assert!(schema.is_object_schema());
/// assert!(schema.validate(&serde_json::json!({"country": "France"})).is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonSchema(Value);

impl JsonSchema {
    /// Creates a schema from a raw JSON value.
    pub fn new(schema: Value) -> Self {
        Self(schema)
    }

    /// A schema accepting any JSON object.
    pub fn any_object() -> Self {
        Self(serde_json::json!({"type": "object", "properties": {}}))
    }

    /// Returns a reference to the underlying JSON value.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Consumes the schema, returning the JSON value.
    pub fn into_value(self) -> Value {
        self.0
    }

    /// Derives a schema from a type implementing [`schemars::JsonSchema`].
    ///
    /// The `$schema` meta key is dropped; backends reject it in tool
    /// parameter schemas.
    ///
    /// Requires the `schema` feature (enabled by default).
    #[cfg(feature = "schema")]
    pub fn from_type<T: schemars::JsonSchema>() -> Result<Self, serde_json::Error> {
        let schema = schemars::schema_for!(T);
        let mut value = serde_json::to_value(schema)?;
        if let Value::Object(map) = &mut value {
            map.remove("$schema");
        }
        Ok(Self(value))
    }

    /// The schema's `title`, if it has one.
    pub fn title(&self) -> Option<&str> {
        self.0.get("title").and_then(Value::as_str)
    }

    /// The schema's `description`, if it has one.
    pub fn description(&self) -> Option<&str> {
        self.0.get("description").and_then(Value::as_str)
    }

    /// Returns a copy without the top-level `title`.
    #[must_use]
    pub fn without_title(&self) -> Self {
        let mut value = self.0.clone();
        if let Value::Object(map) = &mut value {
            map.remove("title");
        }
        Self(value)
    }

    /// Returns `true` if the schema describes a JSON object.
    pub fn is_object_schema(&self) -> bool {
        self.0.get("type").and_then(Value::as_str) == Some("object")
    }

    /// Wraps a non-object schema as `{"type": "object", "properties":
    /// {"<key>": schema}, "required": ["<key>"]}`.
    ///
    /// `$defs` are hoisted to the wrapper so references still resolve.
    #[must_use]
    pub fn wrap_in_object(&self, key: &str) -> Self {
        let mut inner = self.0.clone();
        let defs = match &mut inner {
            Value::Object(map) => map.remove("$defs"),
            _ => None,
        };
        let mut properties = Map::new();
        properties.insert(key.to_owned(), inner);
        let mut wrapper = Map::new();
        wrapper.insert("type".into(), Value::from("object"));
        wrapper.insert("properties".into(), Value::Object(properties));
        wrapper.insert("required".into(), Value::from(vec![key]));
        if let Some(defs) = defs {
            wrapper.insert("$defs".into(), defs);
        }
        Self(Value::Object(wrapper))
    }

    /// Validates `value` against this schema.
    ///
    /// Requires the `schema` feature (enabled by default).
    #[cfg(feature = "schema")]
    pub fn validate(&self, value: &Value) -> Result<(), SchemaError> {
        let validator = jsonschema::validator_for(&self.0)
            .map_err(|e| SchemaError::InvalidSchema(e.to_string()))?;
        let errors: Vec<ErrorDetails> = validator
            .iter_errors(value)
            .map(|e| ErrorDetails {
                path: e.instance_path.to_string(),
                message: e.to_string(),
            })
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SchemaError::Violations(errors))
        }
    }
}
