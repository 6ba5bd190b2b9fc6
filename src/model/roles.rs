//! Role-typed specializations of the dynamic model.
//!
//! Four lifecycle roles ride on the same attribute container:
//!
//! - [`ConfigSource`]: user-authored job configuration
//! - [`TaskSource`]: immutable per-task execution plan
//! - [`ConfigDiff`]: job-level state carried forward after an attempt
//! - [`TaskReport`]: per-task outcome produced at commit time
//!
//! Each role fixes its own unknown-field policy: a ConfigSource drops
//! foreign keys (user typo tolerance, nothing to persist), while the three
//! engine-produced roles preserve them so a document round-tripping through
//! the state file loses nothing it never interpreted.

use super::{codec, DynamicModel, PolicyFactory, Schema, UnknownFieldPolicy};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// User-authored job configuration, decoded against the plugin's declared
/// schema. Created once per job submission and read-only thereafter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSource(DynamicModel);

/// One immutable per-task execution plan. Must be fully self-sufficient to
/// re-execute its task: a resumed job reuses these exact values, never
/// regenerated ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSource(DynamicModel);

/// Job-level state to carry forward (high-water marks, generated ids).
/// Exactly one per transaction attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigDiff(DynamicModel);

/// Per-task outcome metrics, produced by a handle's commit and collected
/// into an index-aligned sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport(DynamicModel);

impl ConfigSource {
    /// Policy: unknown top-level keys are tolerated and ignored.
    pub const POLICY: UnknownFieldPolicy = UnknownFieldPolicy::Ignore;

    /// Decode a raw job document against the plugin's schema.
    pub fn decode(document: &Value, schema: &Schema) -> Result<Self> {
        Ok(Self(codec::decode(
            document,
            schema,
            &PolicyFactory(Self::POLICY),
        )?))
    }

    pub fn model(&self) -> &DynamicModel {
        &self.0
    }
}

impl TaskSource {
    pub const POLICY: UnknownFieldPolicy = UnknownFieldPolicy::Preserve;

    /// Start building a fresh task plan. Mutation is legal only until the
    /// source is handed to `Control::run`.
    pub fn empty() -> Self {
        Self(DynamicModel::new(Self::POLICY))
    }

    pub fn set(&mut self, name: impl Into<String>, value: super::AttrValue) {
        self.0.set(name, value);
    }

    pub fn model(&self) -> &DynamicModel {
        &self.0
    }

    /// Serialize for the persisted resume plan.
    pub fn encode(&self) -> Value {
        codec::encode(&self.0)
    }

    /// Rebuild from a persisted plan entry.
    pub fn decode(document: &Value, schema: &Schema) -> Result<Self> {
        Ok(Self(codec::decode(
            document,
            schema,
            &PolicyFactory(Self::POLICY),
        )?))
    }
}

impl ConfigDiff {
    pub const POLICY: UnknownFieldPolicy = UnknownFieldPolicy::Preserve;

    pub fn empty() -> Self {
        Self(DynamicModel::new(Self::POLICY))
    }

    pub fn set(&mut self, name: impl Into<String>, value: super::AttrValue) {
        self.0.set(name, value);
    }

    pub fn model(&self) -> &DynamicModel {
        &self.0
    }

    pub fn encode(&self) -> Value {
        codec::encode(&self.0)
    }

    /// Fold a successor attempt's diff onto this one; successor wins on
    /// collision. Feeds a chained job stage.
    pub fn merge(&mut self, next: &ConfigDiff) {
        self.0.merge_from(&next.0);
    }
}

impl TaskReport {
    pub const POLICY: UnknownFieldPolicy = UnknownFieldPolicy::Preserve;

    pub fn empty() -> Self {
        Self(DynamicModel::new(Self::POLICY))
    }

    pub fn set(&mut self, name: impl Into<String>, value: super::AttrValue) {
        self.0.set(name, value);
    }

    pub fn model(&self) -> &DynamicModel {
        &self.0
    }

    pub fn encode(&self) -> Value {
        codec::encode(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttrType, AttrValue};
    use serde_json::json;

    #[test]
    fn test_config_source_ignores_unknown_keys() {
        let schema = Schema::new().with("path", AttrType::Str);
        let doc = json!({"path": "/data", "obsolete_option": 9});

        let config = ConfigSource::decode(&doc, &schema).unwrap();
        assert_eq!(config.model().get_str("path").unwrap(), "/data");
        assert_eq!(config.model().passthrough().count(), 0);
    }

    #[test]
    fn test_task_source_preserves_unknown_keys() {
        let schema = Schema::new().with("offset", AttrType::Int);
        let doc = json!({"offset": 10, "vendor_extension": {"k": 1}});

        let task = TaskSource::decode(&doc, &schema).unwrap();
        let encoded = task.encode();
        assert_eq!(encoded["offset"], json!(10));
        assert_eq!(encoded["vendor_extension"], json!({"k": 1}));
    }

    #[test]
    fn test_task_source_persistence_round_trip() {
        let mut task = TaskSource::empty();
        task.set("path", AttrValue::Str("/data/part-2".into()));
        task.set("start_row", AttrValue::Int(2000));

        let json = serde_json::to_string(&task).unwrap();
        let back: TaskSource = serde_json::from_str(&json).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn test_config_diff_merge() {
        let mut first = ConfigDiff::empty();
        first.set("last_pk", AttrValue::Int(100));
        first.set("run_count", AttrValue::Int(1));

        let mut second = ConfigDiff::empty();
        second.set("last_pk", AttrValue::Int(400));

        first.merge(&second);
        assert_eq!(first.model().get_int("last_pk").unwrap(), 400);
        assert_eq!(first.model().get_int("run_count").unwrap(), 1);
    }

    #[test]
    fn test_task_report_encode() {
        let mut report = TaskReport::empty();
        report.set("rows", AttrValue::Int(1000));
        assert_eq!(report.encode(), json!({"rows": 1000}));
    }
}
