//! The JSON envelope used when several output types share one text
//! channel, and Markdown fence stripping for prompted output.
//!
//! A multi-variant payload looks like:
//!
//! ```json
//! {"result": {"kind": "CityLocation", "data": {"city": "Paris"}}}
//! ```

use parley_core::JsonSchema;
use parley_core::messages::ErrorDetails;
use serde_json::{Map, Value, json};

/// Builds the envelope schema for `(kind, description, schema)` triples.
///
/// Each variant is pinned by a `const` kind and closed with
/// `additionalProperties: false`. Variant `$defs` are hoisted to the
/// envelope root so `#/$defs/...` references keep resolving.
pub(crate) fn envelope_schema<'a>(
    variants: impl IntoIterator<Item = (&'a str, Option<&'a str>, &'a JsonSchema)>,
) -> JsonSchema {
    let mut defs = Map::new();
    let any_of: Vec<Value> = variants
        .into_iter()
        .map(|(kind, description, schema)| {
            let mut data = schema.without_title().into_value();
            if let Value::Object(map) = &mut data {
                if let Some(Value::Object(inner)) = map.remove("$defs") {
                    defs.extend(inner);
                }
            }
            let mut variant = json!({
                "type": "object",
                "title": kind,
                "properties": {
                    "kind": {"type": "string", "const": kind},
                    "data": data,
                },
                "required": ["kind", "data"],
                "additionalProperties": false,
            });
            if let (Some(description), Value::Object(map)) = (description, &mut variant) {
                map.insert("description".into(), Value::from(description));
            }
            variant
        })
        .collect();

    let mut schema = json!({
        "type": "object",
        "properties": {"result": {"anyOf": any_of}},
        "required": ["result"],
        "additionalProperties": false,
    });
    if let (false, Value::Object(map)) = (defs.is_empty(), &mut schema) {
        map.insert("$defs".into(), Value::Object(defs));
    }
    JsonSchema::new(schema)
}

/// Splits an envelope into its kind and data.
pub(crate) fn open_envelope(value: Value) -> Result<(String, Value), Vec<ErrorDetails>> {
    let Value::Object(mut outer) = value else {
        return Err(vec![detail("", "expected an object with a `result` field")]);
    };
    let Some(Value::Object(mut result)) = outer.remove("result") else {
        return Err(vec![detail("/result", "expected an object")]);
    };
    let Some(Value::String(kind)) = result.remove("kind") else {
        return Err(vec![detail("/result/kind", "expected a string")]);
    };
    let data = result.remove("data").unwrap_or(Value::Null);
    Ok((kind, data))
}

/// Removes a surrounding Markdown code fence, if there is one.
///
/// Handles an optional language tag (```` ```json ````) and surrounding
/// whitespace; text without a fence is returned trimmed.
pub(crate) fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return trimmed;
    };
    // Drop the language tag on the opening line.
    match body.find('\n') {
        Some(newline) if !body[..newline].contains(['{', '[']) => body[newline + 1..].trim(),
        _ => body.trim(),
    }
}

fn detail(path: &str, message: &str) -> ErrorDetails {
    ErrorDetails {
        path: path.to_owned(),
        message: message.to_owned(),
    }
}
