//! Engine-level configuration loading and validation.
//!
//! This is the engine's own knob set, distinct from the plugin-shaped job
//! document that the dynamic model decodes. Performance fields use
//! `Option<T>` to distinguish "not set" (use the default) from "explicitly
//! set".

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Root engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of parallel task workers. Defaults to available parallelism.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Transparent per-task retries before the run fails. Default: 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_task_retries: Option<u32>,

    /// Advisory task count handed to the plugin's `transaction`. The plugin
    /// may plan a different count. Default: 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_count_hint: Option<usize>,

    /// Scripting-runtime bridge scope.
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Configuration of the secondary scripting runtime hosting non-native
/// plugins. The bridge's internals live outside this core; only the scope
/// decision is made here, once, and passed explicitly to whoever needs it.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Share one process-wide runtime instance across jobs instead of one
    /// instance per job.
    #[serde(default)]
    pub use_global_runtime: bool,
}

/// Resolved runtime scope. Never ambient global state: resolved once at
/// startup and passed down explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeScope {
    PerJobInstance,
    ProcessWideSingleton,
}

impl RuntimeConfig {
    pub fn scope(&self) -> RuntimeScope {
        if self.use_global_runtime {
            RuntimeScope::ProcessWideSingleton
        } else {
            RuntimeScope::PerJobInstance
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if let Some(0) = self.workers {
            return Err(EngineError::Config("workers must be at least 1".into()));
        }
        if let Some(0) = self.task_count_hint {
            return Err(EngineError::Config(
                "task_count_hint must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Worker count, defaulting to the host's available parallelism.
    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn get_max_task_retries(&self) -> u32 {
        self.max_task_retries.unwrap_or(0)
    }

    pub fn get_task_count_hint(&self) -> usize {
        self.task_count_hint.unwrap_or(1)
    }

    /// SHA256 hash over the engine config and the raw job document,
    /// for resume validation.
    pub fn hash_with(&self, raw_job_config: &serde_json::Value) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let job = raw_job_config.to_string();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        hasher.update(job.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_yaml_defaults() {
        let config = EngineConfig::from_yaml("{}").unwrap();
        assert!(config.get_workers() >= 1);
        assert_eq!(config.get_max_task_retries(), 0);
        assert_eq!(config.get_task_count_hint(), 1);
        assert_eq!(config.runtime.scope(), RuntimeScope::PerJobInstance);
    }

    #[test]
    fn test_from_yaml_explicit() {
        let yaml = "workers: 4\nmax_task_retries: 2\ntask_count_hint: 8\nruntime:\n  use_global_runtime: true\n";
        let config = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.get_workers(), 4);
        assert_eq!(config.get_max_task_retries(), 2);
        assert_eq!(config.get_task_count_hint(), 8);
        assert_eq!(config.runtime.scope(), RuntimeScope::ProcessWideSingleton);
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(EngineConfig::from_yaml("workers: 0").is_err());
    }

    #[test]
    fn test_zero_task_count_hint_rejected() {
        assert!(EngineConfig::from_yaml("task_count_hint: 0").is_err());
    }

    #[test]
    fn test_hash_changes_with_job_config() {
        let config = EngineConfig::default();
        let a = config.hash_with(&json!({"path": "/a"}));
        let b = config.hash_with(&json!({"path": "/b"}));
        assert_ne!(a, b);
        assert_eq!(a, config.hash_with(&json!({"path": "/a"})));
    }

    #[test]
    fn test_hash_changes_with_engine_config() {
        let job = json!({"path": "/a"});
        let base = EngineConfig::default();
        let tuned = EngineConfig {
            workers: Some(8),
            ..Default::default()
        };
        assert_ne!(base.hash_with(&job), tuned.hash_with(&job));
    }
}
