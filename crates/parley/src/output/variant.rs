//! One declared output type.

use std::fmt;
use std::sync::Arc;

use parley_core::JsonSchema;
use serde_json::Value;

type ParseFn<O> = Arc<dyn Fn(Value) -> Result<O, String> + Send + Sync>;

/// An output type the model may produce: a tag, a schema, and a parser.
///
/// The tag names the variant to the model: it becomes the
/// `final_result_<Name>` tool suffix or the envelope `kind`. Values reach
/// the parser only after they validated against `schema`.
///
/// ```rust
/// use parley::output::OutputVariant;
/// use serde::Deserialize;
///
/// #[derive(Debug, Deserialize, schemars::JsonSchema)]
/// struct CityLocation {
///     city: String,
///     country: String,
/// }
///
/// let variant = OutputVariant::<CityLocation>::of().unwrap();
/// assert_eq!(variant.name(), "CityLocation");
/// ```
pub struct OutputVariant<O> {
    name: String,
    description: Option<String>,
    schema: JsonSchema,
    parse: ParseFn<O>,
}

impl<O> Clone for OutputVariant<O> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            description: self.description.clone(),
            schema: self.schema.clone(),
            parse: Arc::clone(&self.parse),
        }
    }
}

impl<O> fmt::Debug for OutputVariant<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputVariant")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl<O: 'static> OutputVariant<O> {
    /// Creates a variant from a schema and a parse function.
    ///
    /// The parser's error string is sent back to the model as validation
    /// feedback.
    pub fn new(
        name: impl Into<String>,
        schema: JsonSchema,
        parse: impl Fn(Value) -> Result<O, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: None,
            schema,
            parse: Arc::new(parse),
        }
    }

    /// Sets the description shown to the model.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Converts the parsed value, e.g. into one arm of an output enum.
    #[must_use]
    pub fn map<U: 'static>(
        self,
        f: impl Fn(O) -> U + Send + Sync + 'static,
    ) -> OutputVariant<U> {
        let parse = self.parse;
        OutputVariant {
            name: self.name,
            description: self.description,
            schema: self.schema,
            parse: Arc::new(move |value| parse(value).map(&f)),
        }
    }
}

impl<O> OutputVariant<O> {
    /// The variant's tag.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The description shown to the model, if any.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// The schema values must satisfy.
    pub fn schema(&self) -> &JsonSchema {
        &self.schema
    }

    pub(crate) fn parse(&self, value: Value) -> Result<O, String> {
        (self.parse)(value)
    }
}

impl<O> OutputVariant<O>
where
    O: serde::de::DeserializeOwned + schemars::JsonSchema + 'static,
{
    /// Derives a variant from a type: the schema comes from
    /// [`schemars`], the tag from the schema title, the description from
    /// the type's doc comment.
    pub fn of() -> Result<Self, serde_json::Error> {
        let schema = JsonSchema::from_type::<O>()?;
        let name = schema.title().unwrap_or("output").to_owned();
        let description = schema.description().map(str::to_owned);
        Ok(Self {
            name,
            description,
            schema,
            parse: Arc::new(|value| serde_json::from_value(value).map_err(|e| e.to_string())),
        })
    }
}
