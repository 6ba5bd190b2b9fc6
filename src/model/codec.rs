//! Schema-driven codec between raw JSON documents and dynamic models.
//!
//! Decode is a recursive-descent walk over the serialized tree: recognized
//! fields decode into their declared type, unrecognized fields are consumed
//! according to the model's unknown-field policy. Encode is the structural
//! inverse and fabricates nothing.

use super::{AttrType, AttrValue, DynamicModel, ModelFactory, PolicyFactory, Schema};
use crate::error::{EngineError, Result};
use serde_json::Value;

/// Short JSON token name for error messages.
fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Decode a raw document into a model obtained from `factory`.
///
/// The top-level token must be an object; anything else fails with
/// [`EngineError::MalformedDocument`]. A recognized field of the wrong shape
/// fails with [`EngineError::TypeMismatch`] - never silently coerced.
pub fn decode(
    document: &Value,
    schema: &Schema,
    factory: &dyn ModelFactory,
) -> Result<DynamicModel> {
    let fields = match document {
        Value::Object(fields) => fields,
        other => return Err(EngineError::malformed(json_kind(other))),
    };

    let mut model = factory.new_model();
    for (name, raw) in fields {
        match schema.get(name) {
            Some(ty) => {
                let value = decode_value(name, raw, ty, model.policy())?;
                model.set(name.clone(), value);
            }
            None => model.absorb_unknown(name, raw),
        }
    }
    Ok(model)
}

/// Decode a single value against its declared type descriptor.
///
/// Nested records recurse through the same codec with the parent's
/// unknown-field policy.
pub fn decode_value(
    attr: &str,
    raw: &Value,
    ty: &AttrType,
    policy: super::UnknownFieldPolicy,
) -> Result<AttrValue> {
    let mismatch = || EngineError::type_mismatch(attr, ty.name(), json_kind(raw));

    match ty {
        AttrType::Bool => raw.as_bool().map(AttrValue::Bool).ok_or_else(mismatch),
        AttrType::Int => raw.as_i64().map(AttrValue::Int).ok_or_else(mismatch),
        AttrType::Float => raw.as_f64().map(AttrValue::Float).ok_or_else(mismatch),
        AttrType::Str => raw
            .as_str()
            .map(|s| AttrValue::Str(s.to_string()))
            .ok_or_else(mismatch),
        AttrType::List(elem) => {
            let items = raw.as_array().ok_or_else(mismatch)?;
            let mut decoded = Vec::with_capacity(items.len());
            for item in items {
                decoded.push(decode_value(attr, item, elem, policy)?);
            }
            Ok(AttrValue::List(decoded))
        }
        AttrType::Record(nested_schema) => {
            if !raw.is_object() {
                return Err(mismatch());
            }
            let factory = PolicyFactory(policy);
            let nested = decode(raw, nested_schema, &factory)?;
            Ok(AttrValue::Record(nested))
        }
    }
}

/// Encode a model back into a JSON object.
///
/// Every recognized attribute is emitted with its declared shape; under the
/// `Preserve` policy, pass-through fields are re-emitted unchanged.
pub fn encode(model: &DynamicModel) -> Value {
    let mut fields = serde_json::Map::new();
    for (name, value) in model.attrs() {
        fields.insert(name.clone(), encode_value(value));
    }
    for (name, raw) in model.passthrough() {
        fields.insert(name.clone(), raw.clone());
    }
    Value::Object(fields)
}

fn encode_value(value: &AttrValue) -> Value {
    match value {
        AttrValue::Bool(b) => Value::Bool(*b),
        AttrValue::Int(n) => Value::from(*n),
        AttrValue::Float(f) => {
            serde_json::Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null)
        }
        AttrValue::Str(s) => Value::String(s.clone()),
        AttrValue::List(items) => Value::Array(items.iter().map(encode_value).collect()),
        AttrValue::Record(nested) => encode(nested),
    }
}
