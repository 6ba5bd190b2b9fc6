//! Job orchestrator - drives one transaction attempt end to end.
//!
//! A fresh job decodes the raw configuration, lets the plugin plan and
//! execute through the engine's executor, and finishes with cleanup. A
//! resumed job re-drives the persisted plan instead of planning afresh;
//! tasks that already committed are never re-run.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::executor::{CommitSink, LocalControl, NullFeed, RecordFeed};
use crate::model::roles::{ConfigSource, TaskReport, TaskSource};
use crate::plugin::OutputPlugin;
use crate::state::JobState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{error, info};

/// Job orchestrator.
pub struct Orchestrator {
    config: EngineConfig,
    plugin: Arc<dyn OutputPlugin>,
    feed: Arc<dyn RecordFeed>,
    state_file: Option<PathBuf>,
    state: Option<JobState>,
}

/// Result of a job attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    /// Unique run identifier, stable across resume attempts.
    pub run_id: String,

    /// Final status.
    pub status: String,

    /// Total duration of this attempt in seconds.
    pub duration_seconds: f64,

    /// When this attempt started.
    pub started_at: DateTime<Utc>,

    /// When this attempt completed.
    pub completed_at: DateTime<Utc>,

    /// Number of tasks in the plan.
    pub task_count: usize,

    /// Tasks committed by this attempt.
    pub tasks_committed: usize,

    /// Tasks that had already committed in a previous attempt.
    pub tasks_resumed: usize,

    /// Error from `cleanup`, if it failed. Committed tasks stay committed.
    pub cleanup_error: Option<String>,

    /// The job-level diff the plugin derived.
    pub config_diff: crate::model::roles::ConfigDiff,
}

impl JobResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Commit sink that mirrors execution progress into the persisted state.
struct StateSink {
    state: Arc<Mutex<JobState>>,
    path: Option<PathBuf>,
}

impl StateSink {
    fn persist(&self, state: &mut JobState) -> Result<()> {
        if let Some(ref path) = self.path {
            state.save(path)?;
        }
        Ok(())
    }
}

#[async_trait]
impl CommitSink for StateSink {
    async fn on_plan(&self, task_sources: &[TaskSource]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.record_plan(task_sources)?;
        self.persist(&mut state)
    }

    async fn on_open(&self, task_index: usize) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mark_in_progress(task_index)?;
        self.persist(&mut state)
    }

    async fn on_commit(&self, task_index: usize, report: &TaskReport) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.record_commit(task_index, report)?;
        self.persist(&mut state)
    }

    async fn on_failed(&self, task_index: usize, error: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mark_failed(task_index, error)?;
        self.persist(&mut state)
    }
}

impl Orchestrator {
    /// Create a new orchestrator for one job.
    pub fn new(config: EngineConfig, plugin: Arc<dyn OutputPlugin>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            plugin,
            feed: Arc::new(NullFeed),
            state_file: None,
            state: None,
        })
    }

    /// Set the record feed driving each task's handle.
    pub fn with_feed(mut self, feed: Arc<dyn RecordFeed>) -> Self {
        self.feed = feed;
        self
    }

    /// Set the state file path for resume capability.
    pub fn with_state_file(mut self, path: PathBuf) -> Self {
        self.state_file = Some(path);
        self
    }

    /// Load existing state for resume. The config hash is validated when
    /// `run` sees the raw job document.
    pub fn resume(mut self) -> Result<Self> {
        if let Some(ref path) = self.state_file {
            if path.exists() {
                let state = JobState::load(path)?;
                info!("Resuming run {} from state file: {:?}", state.run_id, path);
                self.state = Some(state);
            }
        }
        Ok(self)
    }

    /// Run one job attempt.
    ///
    /// Consumes the orchestrator: the transaction protocol is
    /// idempotent-unsafe, one attempt per instance.
    pub async fn run(
        mut self,
        raw_config: &serde_json::Value,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<JobResult> {
        let started_at = Utc::now();
        let config_hash = self.config.hash_with(raw_config);

        // Decode errors surface immediately, before any state is touched.
        info!("Phase 1: decoding job configuration");
        let schema = self.plugin.config_schema();
        let config_source = ConfigSource::decode(raw_config, &schema)?;

        let cancel = cancel.unwrap_or_else(crate::executor::never_cancelled);

        let resumed = self.state.is_some();
        let state = match self.state.take() {
            Some(state) => {
                state.validate_config(&config_hash)?;
                state
            }
            None => JobState::new(uuid::Uuid::new_v4().to_string(), config_hash),
        };
        let run_id = state.run_id.clone();
        let plan = state.plan.clone();

        if resumed && plan.is_none() {
            return Err(EngineError::State(
                "state file has no task plan; the prior attempt died during planning and cannot be resumed".into(),
            ));
        }

        info!(
            "Starting job run: {} ({})",
            run_id,
            if resumed { "resume" } else { "fresh" }
        );

        let shared = Arc::new(Mutex::new(state));
        let sink = Arc::new(StateSink {
            state: shared.clone(),
            path: self.state_file.clone(),
        });

        let committed = shared.lock().unwrap().committed_reports();
        let tasks_resumed = committed.len();

        let control = LocalControl::new(
            self.plugin.clone(),
            self.config.get_workers(),
            cancel.clone(),
        )
        .with_feed(self.feed.clone())
        .with_max_task_retries(self.config.get_max_task_retries())
        .with_committed(committed)
        .with_sink(sink.clone());

        let outcome = match &plan {
            Some(plan) => {
                info!(
                    "Phase 2: re-driving the persisted plan ({} tasks, {} already committed)",
                    plan.task_count, tasks_resumed
                );
                self.plugin
                    .resume(&plan.task_sources, plan.task_count, &control)
                    .await
            }
            None => {
                info!(
                    "Phase 2: planning and executing a fresh transaction (hint: {} tasks)",
                    self.config.get_task_count_hint()
                );
                self.plugin
                    .transaction(
                        &config_source,
                        self.config.get_task_count_hint(),
                        &control,
                    )
                    .await
            }
        };

        let diff = match outcome {
            Ok(diff) => diff,
            Err(e) => {
                let mut state = shared.lock().unwrap();
                state.mark_aborted();
                let _ = sink.persist(&mut state);
                error!("Job {} aborted: {}", run_id, e);
                return Err(e);
            }
        };

        // The plugin handed its plan to the executor along the way; a
        // transaction that never did cannot have committed anything.
        let (task_sources, reports) = {
            let state = shared.lock().unwrap();
            let plan = state.plan.clone().ok_or_else(|| {
                EngineError::protocol("transaction returned without executing its plan")
            })?;
            let mut by_index = state.committed_reports();
            let mut reports = Vec::with_capacity(plan.task_count);
            for index in 0..plan.task_count {
                reports.push(by_index.remove(&index).ok_or_else(|| {
                    EngineError::protocol(format!("no committed report for task {}", index))
                })?);
            }
            (plan.task_sources, reports)
        };

        {
            let mut state = shared.lock().unwrap();
            state.mark_committing();
            let _ = sink.persist(&mut state);
        }

        info!("Phase 3: cleanup ({} task reports)", reports.len());
        let cleanup_error = match self
            .plugin
            .cleanup(&task_sources, task_sources.len(), &reports)
            .await
        {
            Ok(()) => None,
            Err(e) => {
                // Reported, never rolled back: the tasks stay committed.
                error!("Cleanup failed for run {}: {}", run_id, e);
                Some(e.to_string())
            }
        };

        {
            let mut state = shared.lock().unwrap();
            state.mark_committed();
            sink.persist(&mut state)?;
        }

        let completed_at = Utc::now();
        let duration = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;

        let result = JobResult {
            run_id,
            status: "committed".to_string(),
            duration_seconds: duration,
            started_at,
            completed_at,
            task_count: task_sources.len(),
            tasks_committed: task_sources.len() - tasks_resumed,
            tasks_resumed,
            cleanup_error,
            config_diff: diff,
        };

        info!(
            "Job {}: {} tasks committed in {:.1}s",
            result.run_id, result.task_count, result.duration_seconds
        );

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::roles::ConfigDiff;
    use crate::model::{AttrType, AttrValue, Schema};
    use crate::plugin::{Control, Record, TransactionalHandle};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Handle that counts written records into its commit report.
    struct PartHandle {
        index: usize,
        records: i64,
        fail: bool,
    }

    #[async_trait]
    impl TransactionalHandle for PartHandle {
        async fn write(&mut self, _record: Record) -> Result<()> {
            self.records += 1;
            Ok(())
        }

        async fn commit(&mut self) -> Result<TaskReport> {
            if self.fail {
                return Err(EngineError::State("simulated sink outage".into()));
            }
            let mut report = TaskReport::empty();
            report.set("index", AttrValue::Int(self.index as i64));
            report.set("rows", AttrValue::Int(self.records));
            Ok(report)
        }

        async fn abort(&mut self) {}
    }

    /// Plugin that splits a row range into per-task partitions.
    struct PartitionPlugin {
        /// Task index whose commits always fail, if any.
        failing_index: Option<usize>,
        transactions: AtomicUsize,
        resumes: AtomicUsize,
        cleanups: AtomicUsize,
        opens: Mutex<Vec<usize>>,
    }

    impl PartitionPlugin {
        fn new(failing_index: Option<usize>) -> Self {
            Self {
                failing_index,
                transactions: AtomicUsize::new(0),
                resumes: AtomicUsize::new(0),
                cleanups: AtomicUsize::new(0),
                opens: Mutex::new(Vec::new()),
            }
        }

        fn derive_diff(reports: &[TaskReport]) -> Result<ConfigDiff> {
            let mut total = 0;
            for report in reports {
                total += report.model().get_int("rows")?;
            }
            let mut diff = ConfigDiff::empty();
            diff.set("transferred_rows", AttrValue::Int(total));
            Ok(diff)
        }
    }

    #[async_trait]
    impl OutputPlugin for PartitionPlugin {
        fn config_schema(&self) -> Schema {
            Schema::new()
                .with("path", AttrType::Str)
                .with("rows_per_task", AttrType::Int)
        }

        async fn transaction(
            &self,
            config: &ConfigSource,
            task_count_hint: usize,
            control: &dyn Control,
        ) -> Result<ConfigDiff> {
            self.transactions.fetch_add(1, Ordering::SeqCst);
            let path = config.model().get_str("path")?.to_string();
            let rows = config.model().get_int("rows_per_task")?;

            let task_sources: Vec<TaskSource> = (0..task_count_hint)
                .map(|i| {
                    let mut source = TaskSource::empty();
                    source.set("path", AttrValue::Str(path.clone()));
                    source.set("start_row", AttrValue::Int(i as i64 * rows));
                    source.set("rows", AttrValue::Int(rows));
                    source
                })
                .collect();

            let reports = control.run(&task_sources).await?;
            Self::derive_diff(&reports)
        }

        async fn resume(
            &self,
            task_sources: &[TaskSource],
            _task_count: usize,
            control: &dyn Control,
        ) -> Result<ConfigDiff> {
            self.resumes.fetch_add(1, Ordering::SeqCst);
            let reports = control.run(task_sources).await?;
            Self::derive_diff(&reports)
        }

        async fn cleanup(
            &self,
            _task_sources: &[TaskSource],
            task_count: usize,
            success_reports: &[TaskReport],
        ) -> Result<()> {
            assert_eq!(success_reports.len(), task_count);
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn open(
            &self,
            _task_source: &TaskSource,
            task_index: usize,
        ) -> Result<Box<dyn TransactionalHandle>> {
            self.opens.lock().unwrap().push(task_index);
            Ok(Box::new(PartHandle {
                index: task_index,
                records: 0,
                fail: self.failing_index == Some(task_index),
            }))
        }
    }

    /// Feed that writes `rows` records per task.
    struct RowsFeed;

    #[async_trait]
    impl RecordFeed for RowsFeed {
        async fn feed(
            &self,
            task: &TaskSource,
            _task_index: usize,
            out: &mut dyn TransactionalHandle,
        ) -> Result<()> {
            let rows = task.model().get_int("rows")?;
            for _ in 0..rows {
                out.write(Record::new(&b"row\n"[..])).await?;
            }
            Ok(())
        }
    }

    fn engine_config() -> EngineConfig {
        EngineConfig {
            workers: Some(4),
            task_count_hint: Some(3),
            ..Default::default()
        }
    }

    fn raw_config() -> serde_json::Value {
        serde_json::json!({"path": "/data", "rows_per_task": 1000})
    }

    #[tokio::test]
    async fn test_fresh_job_commits_all_tasks() {
        let plugin = Arc::new(PartitionPlugin::new(None));
        let orchestrator = Orchestrator::new(engine_config(), plugin.clone())
            .unwrap()
            .with_feed(Arc::new(RowsFeed));

        let result = orchestrator.run(&raw_config(), None).await.unwrap();

        assert_eq!(result.status, "committed");
        assert_eq!(result.task_count, 3);
        assert_eq!(result.tasks_committed, 3);
        assert_eq!(result.tasks_resumed, 0);
        assert!(result.cleanup_error.is_none());
        assert_eq!(
            result.config_diff.model().get_int("transferred_rows").unwrap(),
            3000
        );
        assert_eq!(plugin.transactions.load(Ordering::SeqCst), 1);
        assert_eq!(plugin.cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_task_aborts_attempt_without_cleanup() {
        let dir = tempdir().unwrap();
        let state_path = dir.path().join("job.state.json");

        let plugin = Arc::new(PartitionPlugin::new(Some(1)));
        let orchestrator = Orchestrator::new(engine_config(), plugin.clone())
            .unwrap()
            .with_feed(Arc::new(RowsFeed))
            .with_state_file(state_path.clone());

        let err = orchestrator.run(&raw_config(), None).await.unwrap_err();
        assert!(matches!(err, EngineError::Task { index: 1, .. }));
        assert_eq!(plugin.cleanups.load(Ordering::SeqCst), 0);

        // The aborted state keeps the plan and the two commits
        let state = JobState::load(&state_path).unwrap();
        assert_eq!(state.status, crate::state::RunStatus::Aborted);
        assert_eq!(state.plan.as_ref().unwrap().task_count, 3);
        assert_eq!(state.committed_count(), 2);
    }

    #[tokio::test]
    async fn test_resume_redrives_only_the_failed_task() {
        let dir = tempdir().unwrap();
        let state_path = dir.path().join("job.state.json");

        // First attempt: task 1 never commits
        let failing = Arc::new(PartitionPlugin::new(Some(1)));
        let first = Orchestrator::new(engine_config(), failing.clone())
            .unwrap()
            .with_feed(Arc::new(RowsFeed))
            .with_state_file(state_path.clone());
        first.run(&raw_config(), None).await.unwrap_err();
        let original_run_id = JobState::load(&state_path).unwrap().run_id;

        // Second attempt: same config, failure repaired
        let healed = Arc::new(PartitionPlugin::new(None));
        let second = Orchestrator::new(engine_config(), healed.clone())
            .unwrap()
            .with_feed(Arc::new(RowsFeed))
            .with_state_file(state_path.clone())
            .resume()
            .unwrap();
        let result = second.run(&raw_config(), None).await.unwrap();

        // The plan was never re-derived
        assert_eq!(healed.transactions.load(Ordering::SeqCst), 0);
        assert_eq!(healed.resumes.load(Ordering::SeqCst), 1);

        // Only task 1 was re-opened
        assert_eq!(*healed.opens.lock().unwrap(), vec![1]);

        // The final diff matches what a single successful attempt produces
        assert_eq!(
            result.config_diff.model().get_int("transferred_rows").unwrap(),
            3000
        );
        assert_eq!(result.run_id, original_run_id);
        assert_eq!(result.tasks_resumed, 2);
        assert_eq!(result.tasks_committed, 1);
        assert_eq!(healed.cleanups.load(Ordering::SeqCst), 1);

        let state = JobState::load(&state_path).unwrap();
        assert_eq!(state.status, crate::state::RunStatus::Committed);
    }

    #[tokio::test]
    async fn test_resume_rejects_changed_config() {
        let dir = tempdir().unwrap();
        let state_path = dir.path().join("job.state.json");

        let plugin = Arc::new(PartitionPlugin::new(Some(1)));
        let first = Orchestrator::new(engine_config(), plugin)
            .unwrap()
            .with_feed(Arc::new(RowsFeed))
            .with_state_file(state_path.clone());
        first.run(&raw_config(), None).await.unwrap_err();

        let healed = Arc::new(PartitionPlugin::new(None));
        let second = Orchestrator::new(engine_config(), healed)
            .unwrap()
            .with_feed(Arc::new(RowsFeed))
            .with_state_file(state_path)
            .resume()
            .unwrap();

        let changed = serde_json::json!({"path": "/elsewhere", "rows_per_task": 1000});
        let err = second.run(&changed, None).await.unwrap_err();
        assert!(matches!(err, EngineError::ConfigChanged));
    }

    #[tokio::test]
    async fn test_malformed_document_surfaces_before_planning() {
        let plugin = Arc::new(PartitionPlugin::new(None));
        let orchestrator = Orchestrator::new(engine_config(), plugin.clone()).unwrap();

        let err = orchestrator
            .run(&serde_json::json!(["not", "an", "object"]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MalformedDocument { .. }));
        assert_eq!(plugin.transactions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_type_mismatch_surfaces_before_planning() {
        let plugin = Arc::new(PartitionPlugin::new(None));
        let orchestrator = Orchestrator::new(engine_config(), plugin.clone()).unwrap();

        let bad = serde_json::json!({"path": "/data", "rows_per_task": "lots"});
        let err = orchestrator.run(&bad, None).await.unwrap_err();
        assert!(matches!(err, EngineError::TypeMismatch { .. }));
        assert_eq!(plugin.transactions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_config_keys_are_tolerated() {
        let plugin = Arc::new(PartitionPlugin::new(None));
        let orchestrator = Orchestrator::new(engine_config(), plugin)
            .unwrap()
            .with_feed(Arc::new(RowsFeed));

        let extra = serde_json::json!({
            "path": "/data",
            "rows_per_task": 1000,
            "option_from_a_newer_release": true
        });
        let result = orchestrator.run(&extra, None).await.unwrap();
        assert_eq!(result.task_count, 3);
    }

    #[tokio::test]
    async fn test_cleanup_failure_is_reported_not_rolled_back() {
        struct SpoilsCleanup(PartitionPlugin);

        #[async_trait]
        impl OutputPlugin for SpoilsCleanup {
            fn config_schema(&self) -> Schema {
                self.0.config_schema()
            }

            async fn transaction(
                &self,
                config: &ConfigSource,
                hint: usize,
                control: &dyn Control,
            ) -> Result<ConfigDiff> {
                self.0.transaction(config, hint, control).await
            }

            async fn resume(
                &self,
                task_sources: &[TaskSource],
                task_count: usize,
                control: &dyn Control,
            ) -> Result<ConfigDiff> {
                self.0.resume(task_sources, task_count, control).await
            }

            async fn cleanup(
                &self,
                _task_sources: &[TaskSource],
                _task_count: usize,
                _success_reports: &[TaskReport],
            ) -> Result<()> {
                Err(EngineError::State("publish step unavailable".into()))
            }

            fn open(
                &self,
                task_source: &TaskSource,
                task_index: usize,
            ) -> Result<Box<dyn TransactionalHandle>> {
                self.0.open(task_source, task_index)
            }
        }

        let dir = tempdir().unwrap();
        let state_path = dir.path().join("job.state.json");

        let plugin = Arc::new(SpoilsCleanup(PartitionPlugin::new(None)));
        let orchestrator = Orchestrator::new(engine_config(), plugin)
            .unwrap()
            .with_feed(Arc::new(RowsFeed))
            .with_state_file(state_path.clone());

        let result = orchestrator.run(&raw_config(), None).await.unwrap();
        assert_eq!(result.status, "committed");
        assert!(result.cleanup_error.is_some());

        let state = JobState::load(&state_path).unwrap();
        assert_eq!(state.status, crate::state::RunStatus::Committed);
    }
}
