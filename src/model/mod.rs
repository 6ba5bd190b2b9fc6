//! Dynamic attribute model: a schema-tolerant key/attribute container.
//!
//! Plugins declare their own attribute schemas at runtime; the engine
//! decodes, diffs and persists that state without compile-time knowledge of
//! any plugin's shape. The model is a plain tagged-variant value tree plus an
//! explicit schema table - no reflection anywhere.

mod codec;
pub mod roles;

pub use codec::{decode, decode_value, encode};

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A typed attribute value. Closed set of tags; nesting happens through
/// `List` and `Record`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<AttrValue>),
    Record(DynamicModel),
}

impl AttrValue {
    /// Short tag name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            AttrValue::Bool(_) => "boolean",
            AttrValue::Int(_) => "integer",
            AttrValue::Float(_) => "float",
            AttrValue::Str(_) => "string",
            AttrValue::List(_) => "list",
            AttrValue::Record(_) => "record",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            AttrValue::Float(f) => Some(*f),
            AttrValue::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[AttrValue]> {
        match self {
            AttrValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&DynamicModel> {
        match self {
            AttrValue::Record(m) => Some(m),
            _ => None,
        }
    }
}

/// Declared type descriptor for a recognized attribute. Recursive: a record
/// attribute carries the schema of its nested model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrType {
    Bool,
    Int,
    Float,
    Str,
    List(Box<AttrType>),
    Record(Schema),
}

impl AttrType {
    /// Human-readable name used in TypeMismatch errors.
    pub fn name(&self) -> String {
        match self {
            AttrType::Bool => "boolean".to_string(),
            AttrType::Int => "integer".to_string(),
            AttrType::Float => "float".to_string(),
            AttrType::Str => "string".to_string(),
            AttrType::List(elem) => format!("list of {}", elem.name()),
            AttrType::Record(_) => "record".to_string(),
        }
    }
}

/// Runtime-supplied mapping from attribute name to its declared type.
///
/// Built by each plugin for its own config and task shapes; the codec walks
/// it during decode, so adding a new optional attribute in a newer plugin
/// version does not break older serialized documents.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Schema {
    attrs: BTreeMap<String, AttrType>,
}

impl Schema {
    /// Create an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an attribute. Builder-style, chainable.
    pub fn with(mut self, name: impl Into<String>, ty: AttrType) -> Self {
        self.attrs.insert(name.into(), ty);
        self
    }

    /// Look up the declared type of an attribute.
    pub fn get(&self, name: &str) -> Option<&AttrType> {
        self.attrs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.attrs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// Iterate over declared attributes in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttrType)> {
        self.attrs.iter()
    }
}

/// What to do with document fields whose names are absent from the schema.
///
/// This is a declared per-instance policy, not an ad hoc decision: each
/// lifecycle role picks one and the codec honors it uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownFieldPolicy {
    /// Consume the field from the input but store nothing.
    Ignore,
    /// Carry the raw value as a pass-through attribute; encode re-emits it
    /// unchanged so an unrelated round trip loses no data.
    Preserve,
}

/// An open-ended mapping from attribute name to typed value.
///
/// Mutable only through [`set`](Self::set) while its owning factory is
/// constructing it; once handed across a transaction boundary it must be
/// treated as immutable. Crossing that boundary always transfers an owned
/// clone, so concurrent tasks never share mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicModel {
    attrs: BTreeMap<String, AttrValue>,
    /// Raw values for unrecognized fields, kept only under `Preserve`.
    passthrough: BTreeMap<String, serde_json::Value>,
    policy: UnknownFieldPolicy,
}

impl DynamicModel {
    /// Create an empty model with the given unknown-field policy.
    pub fn new(policy: UnknownFieldPolicy) -> Self {
        Self {
            attrs: BTreeMap::new(),
            passthrough: BTreeMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> UnknownFieldPolicy {
        self.policy
    }

    /// Set a recognized attribute.
    pub fn set(&mut self, name: impl Into<String>, value: AttrValue) {
        self.attrs.insert(name.into(), value);
    }

    /// Get a recognized attribute.
    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    /// Get a required integer attribute, or fail with TypeMismatch/Planning.
    pub fn get_int(&self, name: &str) -> Result<i64> {
        self.require(name)?
            .as_int()
            .ok_or_else(|| self.mismatch(name, "integer"))
    }

    pub fn get_str(&self, name: &str) -> Result<&str> {
        self.require(name)?
            .as_str()
            .ok_or_else(|| self.mismatch(name, "string"))
    }

    pub fn get_bool(&self, name: &str) -> Result<bool> {
        self.require(name)?
            .as_bool()
            .ok_or_else(|| self.mismatch(name, "boolean"))
    }

    fn require(&self, name: &str) -> Result<&AttrValue> {
        self.attrs
            .get(name)
            .ok_or_else(|| EngineError::Planning(format!("missing attribute '{}'", name)))
    }

    fn mismatch(&self, name: &str, expected: &str) -> EngineError {
        let found = self
            .attrs
            .get(name)
            .map(|v| v.kind())
            .unwrap_or("missing");
        EngineError::type_mismatch(name, expected, found)
    }

    /// Record an unrecognized field according to the policy.
    pub(crate) fn absorb_unknown(&mut self, name: &str, raw: &serde_json::Value) {
        if self.policy == UnknownFieldPolicy::Preserve {
            self.passthrough.insert(name.to_string(), raw.clone());
        }
    }

    /// Recognized attributes in name order.
    pub fn attrs(&self) -> impl Iterator<Item = (&String, &AttrValue)> {
        self.attrs.iter()
    }

    /// Pass-through fields carried under `Preserve`.
    pub fn passthrough(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.passthrough.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty() && self.passthrough.is_empty()
    }

    /// Merge another model into this one. Attributes of `other` win on
    /// collision; used to fold a successor ConfigDiff onto a predecessor.
    pub fn merge_from(&mut self, other: &DynamicModel) {
        for (name, value) in other.attrs() {
            self.attrs.insert(name.clone(), value.clone());
        }
        for (name, raw) in other.passthrough() {
            self.passthrough.insert(name.clone(), raw.clone());
        }
    }
}

/// Injected constructor for model instances.
///
/// The codec obtains every instance through a factory, so a plugin can vary
/// the model's concrete policy (and future shape) without the codec knowing
/// plugin-specific types.
pub trait ModelFactory {
    fn new_model(&self) -> DynamicModel;
}

/// Factory producing plain models with a fixed unknown-field policy.
#[derive(Debug, Clone, Copy)]
pub struct PolicyFactory(pub UnknownFieldPolicy);

impl ModelFactory for PolicyFactory {
    fn new_model(&self) -> DynamicModel {
        DynamicModel::new(self.0)
    }
}
