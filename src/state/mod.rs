//! File-based job state for resume capability.
//!
//! The state file carries two things an interrupted attempt needs back:
//! the task plan exactly as the plugin produced it (resume never re-plans),
//! and the index-aligned commit record of every task that already reached
//! its durability boundary.

use crate::error::{EngineError, Result};
use crate::model::roles::{TaskReport, TaskSource};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::path::Path;

type HmacSha256 = Hmac<Sha256>;

/// Persisted state of one job across attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    /// Unique run identifier.
    pub run_id: String,

    /// SHA256 hash of engine config + raw job document.
    pub config_hash: String,

    /// When the first attempt started.
    pub started_at: DateTime<Utc>,

    /// Current attempt status.
    pub status: RunStatus,

    /// The task plan, written exactly once when the plugin hands it to the
    /// executor. `None` means the attempt died during planning and cannot
    /// be resumed.
    pub plan: Option<TaskPlan>,

    /// Per-task state, index-aligned with the plan.
    pub tasks: Vec<TaskSlot>,

    /// When the job completed (if finished).
    pub completed_at: Option<DateTime<Utc>>,

    /// HMAC-SHA256 signature for integrity validation.
    /// Computed over serialized state (excluding this field) using
    /// config_hash as key. Optional for backward compatibility with older
    /// state files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

/// Overall attempt status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Planning,
    Executing,
    /// All tasks committed; cleanup is in flight.
    Committing,
    Committed,
    Aborted,
}

/// The immutable plan of one transaction attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlan {
    /// Number of tasks. Indices are dense: 0..task_count.
    pub task_count: usize,

    /// One source per task, index order significant and stable.
    pub task_sources: Vec<TaskSource>,
}

/// Per-task state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSlot {
    /// Task status.
    pub status: TaskStatus,

    /// Committed report, present only once the task reached its
    /// durability boundary.
    pub report: Option<TaskReport>,

    /// Open attempts so far, across process restarts.
    pub attempts: u32,

    /// Error message of the last failed attempt.
    pub error: Option<String>,

    /// When the task committed.
    pub committed_at: Option<DateTime<Utc>>,
}

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Committed,
    Failed,
}

impl TaskSlot {
    fn new() -> Self {
        Self {
            status: TaskStatus::Pending,
            report: None,
            attempts: 0,
            error: None,
            committed_at: None,
        }
    }
}

impl JobState {
    /// Create a new job state.
    pub fn new(run_id: String, config_hash: String) -> Self {
        Self {
            run_id,
            config_hash,
            started_at: Utc::now(),
            status: RunStatus::Planning,
            plan: None,
            tasks: Vec::new(),
            completed_at: None,
            hmac: None, // Computed on first save
        }
    }

    /// Record the plan the plugin handed to the executor.
    ///
    /// Write-once: a second call with the same task count is a no-op (the
    /// resume path re-runs the same plan), a different count is a protocol
    /// violation.
    pub fn record_plan(&mut self, task_sources: &[TaskSource]) -> Result<()> {
        if let Some(ref plan) = self.plan {
            if plan.task_count != task_sources.len() {
                return Err(EngineError::protocol(format!(
                    "plan of {} tasks does not match the persisted plan of {} tasks",
                    task_sources.len(),
                    plan.task_count
                )));
            }
            self.status = RunStatus::Executing;
            return Ok(());
        }

        self.plan = Some(TaskPlan {
            task_count: task_sources.len(),
            task_sources: task_sources.to_vec(),
        });
        self.tasks = (0..task_sources.len()).map(|_| TaskSlot::new()).collect();
        self.status = RunStatus::Executing;
        Ok(())
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut TaskSlot> {
        let len = self.tasks.len();
        self.tasks.get_mut(index).ok_or_else(|| {
            EngineError::protocol(format!(
                "task index {} outside the plan's range 0..{}",
                index, len
            ))
        })
    }

    /// Mark one more open attempt on a task.
    pub fn mark_in_progress(&mut self, index: usize) -> Result<()> {
        let slot = self.slot_mut(index)?;
        if slot.status == TaskStatus::Committed {
            return Err(EngineError::protocol(format!(
                "task {} reopened after commit",
                index
            )));
        }
        slot.status = TaskStatus::InProgress;
        slot.attempts += 1;
        Ok(())
    }

    /// Record a task's commit. At most one commit per index, ever.
    pub fn record_commit(&mut self, index: usize, report: &TaskReport) -> Result<()> {
        let slot = self.slot_mut(index)?;
        if slot.status == TaskStatus::Committed {
            return Err(EngineError::protocol(format!(
                "task {} committed twice",
                index
            )));
        }
        slot.status = TaskStatus::Committed;
        slot.report = Some(report.clone());
        slot.error = None;
        slot.committed_at = Some(Utc::now());
        Ok(())
    }

    /// Record a task attempt failure.
    pub fn mark_failed(&mut self, index: usize, error: &str) -> Result<()> {
        let slot = self.slot_mut(index)?;
        if slot.status != TaskStatus::Committed {
            slot.status = TaskStatus::Failed;
            slot.error = Some(error.to_string());
        }
        Ok(())
    }

    /// Is this task already past its durability boundary?
    pub fn is_committed(&self, index: usize) -> bool {
        self.tasks
            .get(index)
            .map(|slot| slot.status == TaskStatus::Committed)
            .unwrap_or(false)
    }

    /// Reports of all committed tasks, keyed by index.
    pub fn committed_reports(&self) -> BTreeMap<usize, TaskReport> {
        self.tasks
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.report.clone().map(|report| (index, report)))
            .collect()
    }

    /// Count of committed tasks.
    pub fn committed_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|slot| slot.status == TaskStatus::Committed)
            .count()
    }

    /// All tasks are past their durability boundary; cleanup may start.
    pub fn mark_committing(&mut self) {
        self.status = RunStatus::Committing;
    }

    /// Mark the job as committed.
    pub fn mark_committed(&mut self) {
        self.status = RunStatus::Committed;
        self.completed_at = Some(Utc::now());
    }

    /// Mark the attempt as aborted, keeping committed slots for resume.
    pub fn mark_aborted(&mut self) {
        self.status = RunStatus::Aborted;
        self.completed_at = Some(Utc::now());
    }

    /// Compute HMAC-SHA256 signature for state integrity validation.
    ///
    /// Uses config_hash as HMAC key so a tampered state file needs both
    /// file system access and knowledge of the config hash.
    fn compute_hmac(&self) -> Result<String> {
        // Sign a copy without the signature field
        let mut state_for_signing = self.clone();
        state_for_signing.hmac = None;

        let content = serde_json::to_string(&state_for_signing)
            .map_err(|e| EngineError::State(format!("failed to serialize state for HMAC: {}", e)))?;

        let mut mac = HmacSha256::new_from_slice(self.config_hash.as_bytes())
            .map_err(|e| EngineError::State(format!("failed to create HMAC: {}", e)))?;

        mac.update(content.as_bytes());
        let result = mac.finalize();
        Ok(hex::encode(result.into_bytes()))
    }

    /// Load state from a file with integrity validation.
    ///
    /// Validates the HMAC signature if present. Older state files without
    /// one are still accepted and upgraded on next save.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let state: Self = serde_json::from_str(&content)?;

        if let Some(stored_hmac) = &state.hmac {
            let expected_hmac = state.compute_hmac()?;
            if stored_hmac != &expected_hmac {
                return Err(EngineError::State(
                    "state file integrity check failed: HMAC mismatch (possible tampering)"
                        .to_string(),
                ));
            }
        } else {
            tracing::warn!(
                "State file has no HMAC signature (older format), integrity cannot be verified"
            );
        }

        Ok(state)
    }

    /// Save state to a file (atomic write with HMAC).
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();

        self.hmac = Some(self.compute_hmac()?);

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::State(format!("failed to serialize state: {}", e)))?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;

        Ok(())
    }

    /// Validate that the config hash matches for resume.
    pub fn validate_config(&self, config_hash: &str) -> Result<()> {
        if self.config_hash != config_hash {
            return Err(EngineError::ConfigChanged);
        }
        Ok(())
    }
}
