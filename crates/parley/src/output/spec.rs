//! Output declarations and how a run extracts them from responses.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parley_core::messages::{ErrorDetails, RetryContent, ToolCallArgs};
use parley_core::provider::{OutputObjectDefinition, SchemaError, ToolKind};
use parley_core::{ModelProfile, OutputMode, ToolDefinition};
use serde_json::{Map, Value};

use super::OutputVariant;
use super::envelope::{envelope_schema, open_envelope, strip_fences};
use crate::error::RunErrorKind;
use crate::tool::ModelRetry;

/// Name of the output tool when there is a single output variant.
pub const DEFAULT_OUTPUT_TOOL_NAME: &str = "final_result";

/// Description of output tools that don't carry their own.
pub const DEFAULT_OUTPUT_TOOL_DESCRIPTION: &str = "The final response which ends this conversation";

/// Key a non-object schema is wrapped under.
const RESPONSE_KEY: &str = "response";

type TextTransform<O> = Arc<dyn Fn(String) -> Result<O, ModelRetry> + Send + Sync>;

// ── OutputError ─────────────────────────────────────────────────────

/// Why a candidate output was rejected.
///
/// Either way the run sends the feedback to the model and asks again,
/// until the output retry budget is spent.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum OutputError {
    /// The payload did not parse or did not match the schema.
    #[error("{}", describe(.0))]
    Invalid(Vec<ErrorDetails>),
    /// A transform or validator asked for another attempt.
    #[error(transparent)]
    Retry(#[from] ModelRetry),
}

impl OutputError {
    pub(crate) fn message(message: impl Into<String>) -> Self {
        Self::Invalid(vec![ErrorDetails {
            path: String::new(),
            message: message.into(),
        }])
    }

    /// The body of the retry prompt sent to the model.
    pub(crate) fn retry_content(&self) -> RetryContent {
        match self {
            Self::Invalid(errors) => RetryContent::Errors(errors.clone()),
            Self::Retry(retry) => RetryContent::Text(retry.message.clone()),
        }
    }

    /// The error recorded as the cause once the budget is spent.
    pub(crate) fn into_cause(self) -> RunErrorKind {
        match self {
            Self::Retry(retry) => RunErrorKind::ModelRetryRequested {
                message: retry.message,
            },
            invalid @ Self::Invalid(_) => RunErrorKind::ValidationFailure {
                message: invalid.to_string(),
            },
        }
    }
}

impl From<SchemaError> for OutputError {
    fn from(err: SchemaError) -> Self {
        match err {
            SchemaError::Violations(errors) => Self::Invalid(errors),
            other => Self::message(other.to_string()),
        }
    }
}

fn describe(errors: &[ErrorDetails]) -> String {
    errors
        .iter()
        .map(|e| {
            if e.path.is_empty() {
                e.message.clone()
            } else {
                format!("{}: {}", e.path, e.message)
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

// ── OutputSpec ──────────────────────────────────────────────────────

enum SpecKind<O> {
    Text(TextTransform<O>),
    Structured {
        mode: Option<OutputMode>,
        variants: Vec<OutputVariant<O>>,
    },
}

impl<O> Clone for SpecKind<O> {
    fn clone(&self) -> Self {
        match self {
            Self::Text(transform) => Self::Text(Arc::clone(transform)),
            Self::Structured { mode, variants } => Self::Structured {
                mode: *mode,
                variants: variants.clone(),
            },
        }
    }
}

/// What a run must produce, and through which channel.
///
/// | Constructor | Channel |
/// |-------------|---------|
/// | [`text`](OutputSpec::text) / [`text_with`](OutputSpec::text_with) | plain text, optionally transformed |
/// | [`tool`](OutputSpec::tool) | the model calls `final_result` with the output as arguments |
/// | [`native`](OutputSpec::native) | the backend constrains its text to the schema |
/// | [`prompted`](OutputSpec::prompted) | the schema is described in the instructions |
/// | [`structured`](OutputSpec::structured) | whatever the model's profile prefers |
///
/// Each constructor has a `_variants` form taking several
/// [`OutputVariant`]s that map into one output type. Variants are looked
/// up by their tag.
///
/// ```rust
/// use parley::output::{OutputSpec, OutputVariant};
/// use serde::Deserialize;
///
/// #[derive(Debug, Deserialize, schemars::JsonSchema)]
/// struct CityLocation {
///     city: String,
///     country: String,
/// }
///
/// let spec = OutputSpec::tool(OutputVariant::<CityLocation>::of().unwrap());
/// assert_eq!(spec.variant_names(), ["CityLocation"]);
/// ```
pub struct OutputSpec<O> {
    kind: SpecKind<O>,
    index: HashMap<String, usize>,
    tool_name: Option<String>,
    tool_description: Option<String>,
    template: Option<String>,
}

impl<O> Clone for OutputSpec<O> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            index: self.index.clone(),
            tool_name: self.tool_name.clone(),
            tool_description: self.tool_description.clone(),
            template: self.template.clone(),
        }
    }
}

impl<O> fmt::Debug for OutputSpec<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("OutputSpec");
        match &self.kind {
            SpecKind::Text(_) => s.field("mode", &OutputMode::Text),
            SpecKind::Structured { mode, variants } => s
                .field("mode", mode)
                .field("variants", &variants.iter().map(OutputVariant::name).collect::<Vec<_>>()),
        };
        s.field("tool_name", &self.tool_name).finish_non_exhaustive()
    }
}

impl OutputSpec<String> {
    /// Plain text output, accepted as-is.
    pub fn text() -> Self {
        Self::text_with(Ok)
    }
}

impl Default for OutputSpec<String> {
    fn default() -> Self {
        Self::text()
    }
}

impl<O: 'static> OutputSpec<O> {
    /// Plain text output passed through `transform`.
    ///
    /// The transform may return [`ModelRetry`] to reject the text.
    pub fn text_with(transform: impl Fn(String) -> Result<O, ModelRetry> + Send + Sync + 'static) -> Self {
        Self::from_kind(SpecKind::Text(Arc::new(transform)))
    }

    /// Tool output for one type.
    pub fn tool(variant: OutputVariant<O>) -> Self {
        Self::tool_variants(vec![variant])
    }

    /// Tool output with one `final_result_<Name>` tool per variant.
    pub fn tool_variants(variants: Vec<OutputVariant<O>>) -> Self {
        Self::structured_in(Some(OutputMode::Tool), variants)
    }

    /// Native structured output for one type.
    pub fn native(variant: OutputVariant<O>) -> Self {
        Self::native_variants(vec![variant])
    }

    /// Native structured output over an envelope of variants.
    pub fn native_variants(variants: Vec<OutputVariant<O>>) -> Self {
        Self::structured_in(Some(OutputMode::Native), variants)
    }

    /// Prompted output for one type.
    pub fn prompted(variant: OutputVariant<O>) -> Self {
        Self::prompted_variants(vec![variant])
    }

    /// Prompted output over an envelope of variants.
    pub fn prompted_variants(variants: Vec<OutputVariant<O>>) -> Self {
        Self::structured_in(Some(OutputMode::Prompted), variants)
    }

    /// Structured output in the model profile's default mode.
    pub fn structured(variant: OutputVariant<O>) -> Self {
        Self::structured_variants(vec![variant])
    }

    /// Structured output over several variants in the profile's default
    /// mode.
    pub fn structured_variants(variants: Vec<OutputVariant<O>>) -> Self {
        Self::structured_in(None, variants)
    }

    fn structured_in(mode: Option<OutputMode>, variants: Vec<OutputVariant<O>>) -> Self {
        Self::from_kind(SpecKind::Structured { mode, variants })
    }

    fn from_kind(kind: SpecKind<O>) -> Self {
        let index = match &kind {
            SpecKind::Text(_) => HashMap::new(),
            SpecKind::Structured { variants, .. } => variants
                .iter()
                .enumerate()
                .map(|(i, v)| (v.name().to_owned(), i))
                .collect(),
        };
        Self {
            kind,
            index,
            tool_name: None,
            tool_description: None,
            template: None,
        }
    }
}

impl<O> OutputSpec<O> {
    /// Overrides the output tool name (the prefix, for several variants).
    #[must_use]
    pub fn with_tool_name(mut self, name: impl Into<String>) -> Self {
        self.tool_name = Some(name.into());
        self
    }

    /// Overrides the description of output tools without their own.
    #[must_use]
    pub fn with_tool_description(mut self, description: impl Into<String>) -> Self {
        self.tool_description = Some(description.into());
        self
    }

    /// Overrides the prompted-output instructions template. `{schema}` is
    /// replaced with the schema.
    #[must_use]
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    /// The declared mode; `None` for structured output that follows the
    /// model profile.
    pub fn mode(&self) -> Option<OutputMode> {
        match &self.kind {
            SpecKind::Text(_) => Some(OutputMode::Text),
            SpecKind::Structured { mode, .. } => *mode,
        }
    }

    /// Tags of the declared variants, in declaration order.
    pub fn variant_names(&self) -> Vec<&str> {
        self.variants().iter().map(OutputVariant::name).collect()
    }

    fn variants(&self) -> &[OutputVariant<O>] {
        match &self.kind {
            SpecKind::Text(_) => &[],
            SpecKind::Structured { variants, .. } => variants,
        }
    }

    fn variant(&self, name: &str) -> Option<&OutputVariant<O>> {
        self.index.get(name).and_then(|&i| self.variants().get(i))
    }

    /// Re-validates a payload this spec accepted.
    ///
    /// `value` is the variant payload (the arguments of the output tool
    /// with any `response` wrapper removed, or the decoded JSON text
    /// without the envelope), or a string for text output. Variants are
    /// tried in declaration order.
    pub fn validate_value(&self, value: &Value) -> Result<O, OutputError> {
        match &self.kind {
            SpecKind::Text(transform) => match value {
                Value::String(text) => Ok(transform(text.clone())?),
                _ => Err(OutputError::message("expected a string")),
            },
            SpecKind::Structured { variants, .. } => {
                let mut last = OutputError::message("no output variants declared");
                for variant in variants {
                    match parse_variant(variant, value.clone()) {
                        Ok(output) => return Ok(output),
                        Err(err) => last = err,
                    }
                }
                Err(last)
            }
        }
    }

    /// Resolves the spec against a model profile.
    pub(crate) fn plan(&self, profile: &ModelProfile) -> Result<OutputPlan, RunErrorKind> {
        let (mode, variants) = match &self.kind {
            SpecKind::Text(_) => {
                return Ok(OutputPlan {
                    mode: OutputMode::Text,
                    allow_text: true,
                    ..OutputPlan::default()
                });
            }
            SpecKind::Structured { mode, variants } => {
                let mode = match mode.unwrap_or(profile.default_structured_output_mode) {
                    OutputMode::Text => OutputMode::Tool,
                    other => other,
                };
                (mode, variants)
            }
        };
        if variants.is_empty() {
            return Err(RunErrorKind::Configuration(
                "structured output needs at least one output variant".into(),
            ));
        }
        if self.index.len() != variants.len() {
            return Err(RunErrorKind::Configuration(
                "output variant names must be unique".into(),
            ));
        }

        let mut plan = OutputPlan {
            mode,
            wrapped: variants.iter().map(|v| !v.schema().is_object_schema()).collect(),
            ..OutputPlan::default()
        };
        match mode {
            OutputMode::Tool => {
                let base = self.tool_name.as_deref().unwrap_or(DEFAULT_OUTPUT_TOOL_NAME);
                for (i, variant) in variants.iter().enumerate() {
                    let name = if variants.len() == 1 {
                        base.to_owned()
                    } else {
                        format!("{base}_{}", variant.name())
                    };
                    let description = variant
                        .description()
                        .or(self.tool_description.as_deref())
                        .unwrap_or(DEFAULT_OUTPUT_TOOL_DESCRIPTION);
                    let parameters = if plan.wrapped[i] {
                        variant.schema().wrap_in_object(RESPONSE_KEY)
                    } else {
                        variant.schema().without_title()
                    };
                    plan.tools.insert(name.clone(), i);
                    plan.output_tools.push(ToolDefinition {
                        kind: ToolKind::Output,
                        ..ToolDefinition::new(name, description, parameters)
                    });
                }
            }
            OutputMode::Native | OutputMode::Prompted => {
                let definition = if let [variant] = variants.as_slice() {
                    OutputObjectDefinition {
                        name: Some(variant.name().to_owned()),
                        description: variant.description().map(str::to_owned),
                        json_schema: if plan.wrapped[0] {
                            variant.schema().wrap_in_object(RESPONSE_KEY)
                        } else {
                            variant.schema().clone()
                        },
                        strict: None,
                    }
                } else {
                    OutputObjectDefinition {
                        name: self.tool_name.clone(),
                        description: self.tool_description.clone(),
                        json_schema: envelope_schema(
                            variants.iter().map(|v| (v.name(), v.description(), v.schema())),
                        ),
                        strict: None,
                    }
                };
                plan.envelope = variants.len() > 1;
                plan.allow_text = true;
                if mode == OutputMode::Prompted {
                    let template = self
                        .template
                        .as_deref()
                        .unwrap_or(profile.prompted_output_template.as_str());
                    let schema = serde_json::to_string(definition.json_schema.as_value())
                        .map_err(|e| RunErrorKind::Configuration(e.to_string()))?;
                    plan.instructions = Some(template.replace("{schema}", &schema));
                }
                plan.output_object = Some(definition);
            }
            OutputMode::Text => {}
        }
        Ok(plan)
    }

    /// Parses the arguments of an output tool call.
    pub(crate) fn parse_tool_call(
        &self,
        plan: &OutputPlan,
        tool_name: &str,
        args: &ToolCallArgs,
    ) -> Result<O, OutputError> {
        let (Some(&i), Some(definition)) = (
            plan.tools.get(tool_name),
            plan.output_tools.iter().find(|t| t.name == tool_name),
        ) else {
            return Err(OutputError::message(format!("Unknown output tool '{tool_name}'")));
        };
        let args = args
            .as_value()
            .map_err(|e| OutputError::message(format!("Invalid JSON: {e}")))?;
        definition.parameters.validate(&args)?;
        let payload = if plan.wrapped.get(i).copied().unwrap_or(false) {
            unwrap_response(args)
        } else {
            args
        };
        let variant = self
            .variants()
            .get(i)
            .ok_or_else(|| OutputError::message("output variant missing"))?;
        variant.parse(payload).map_err(OutputError::message)
    }

    /// Parses a text response under the plan's mode.
    pub(crate) fn parse_text(&self, plan: &OutputPlan, text: String) -> Result<O, OutputError> {
        if let SpecKind::Text(transform) = &self.kind {
            return Ok(transform(text)?);
        }
        let Some(definition) = &plan.output_object else {
            return Err(OutputError::message("text output is not expected"));
        };
        let json_text = if plan.mode == OutputMode::Prompted {
            strip_fences(&text)
        } else {
            text.trim()
        };
        let value: Value = serde_json::from_str(json_text)
            .map_err(|e| OutputError::message(format!("Invalid JSON: {e}")))?;
        definition.json_schema.validate(&value)?;

        if plan.envelope {
            let (kind, data) = open_envelope(value).map_err(OutputError::Invalid)?;
            let variant = self
                .variant(&kind)
                .ok_or_else(|| OutputError::message(format!("Unknown result kind '{kind}'")))?;
            return variant.parse(data).map_err(OutputError::message);
        }
        let payload = if plan.wrapped.first().copied().unwrap_or(false) {
            unwrap_response(value)
        } else {
            value
        };
        let variant = self
            .variants()
            .first()
            .ok_or_else(|| OutputError::message("output variant missing"))?;
        variant.parse(payload).map_err(OutputError::message)
    }
}

fn parse_variant<O>(variant: &OutputVariant<O>, value: Value) -> Result<O, OutputError> {
    variant.schema().validate(&value)?;
    variant.parse(value).map_err(OutputError::message)
}

fn unwrap_response(value: Value) -> Value {
    match value {
        Value::Object(mut map) => map.remove(RESPONSE_KEY).unwrap_or(Value::Object(Map::new())),
        other => other,
    }
}

// ── OutputPlan ──────────────────────────────────────────────────────

/// An [`OutputSpec`] resolved against one model's profile.
#[derive(Debug, Clone, Default)]
pub(crate) struct OutputPlan {
    pub mode: OutputMode,
    pub output_tools: Vec<ToolDefinition>,
    pub output_object: Option<OutputObjectDefinition>,
    pub allow_text: bool,
    /// Prompted-output instructions, already rendered.
    pub instructions: Option<String>,
    /// Output tool name to variant index.
    tools: HashMap<String, usize>,
    /// Per variant: the schema was wrapped under `response`.
    wrapped: Vec<bool>,
    envelope: bool,
}

impl OutputPlan {
    /// Returns `true` if `name` is one of this plan's output tools.
    pub(crate) fn is_output_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Output tool names, in declaration order.
    pub(crate) fn output_tool_names(&self) -> Vec<&str> {
        self.output_tools.iter().map(|t| t.name.as_str()).collect()
    }
}
