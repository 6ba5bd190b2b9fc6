//! In-process task executor behind the [`Control`] callback.
//!
//! `transaction`/`resume` hand their task plan to [`LocalControl::run`],
//! which fans the tasks out over a bounded tokio worker pool and joins
//! before returning. Success is all-or-nothing: the returned report
//! sequence has exactly one committed report per index, in index order, or
//! the whole run fails.

use crate::error::{EngineError, Result};
use crate::model::roles::{TaskReport, TaskSource};
use crate::plugin::{Control, OutputPlugin, Record, TransactionalHandle};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

/// Guard around a plugin handle that turns terminal-operation misuse into
/// [`EngineError::Protocol`].
///
/// At most one terminal operation ever reaches the inner handle; a second
/// commit, a commit after abort, or a write after either fails loudly
/// instead of being masked.
pub struct HandleGuard {
    inner: Box<dyn TransactionalHandle>,
    state: GuardState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GuardState {
    Open,
    Committed,
    Aborted,
}

impl HandleGuard {
    pub fn new(inner: Box<dyn TransactionalHandle>) -> Self {
        Self {
            inner,
            state: GuardState::Open,
        }
    }

    /// Has this handle reached its durability boundary?
    pub fn is_committed(&self) -> bool {
        self.state == GuardState::Committed
    }
}

#[async_trait]
impl TransactionalHandle for HandleGuard {
    async fn write(&mut self, record: Record) -> Result<()> {
        if self.state != GuardState::Open {
            return Err(EngineError::protocol(format!(
                "write on a handle already {:?}",
                self.state
            )));
        }
        self.inner.write(record).await
    }

    async fn commit(&mut self) -> Result<TaskReport> {
        match self.state {
            GuardState::Open => {
                let report = self.inner.commit().await?;
                self.state = GuardState::Committed;
                Ok(report)
            }
            GuardState::Committed => Err(EngineError::protocol("commit called twice")),
            GuardState::Aborted => Err(EngineError::protocol("commit after abort")),
        }
    }

    async fn abort(&mut self) {
        // Abort after commit must not roll anything back; after abort it is
        // a no-op.
        if self.state == GuardState::Open {
            self.inner.abort().await;
            self.state = GuardState::Aborted;
        }
    }
}

/// The external transfer-logic boundary: pumps a task's records into its
/// open handle. What the records are and where they come from is the
/// concern of the surrounding engine, not of this protocol core.
#[async_trait]
pub trait RecordFeed: Send + Sync {
    async fn feed(
        &self,
        task: &TaskSource,
        task_index: usize,
        out: &mut dyn TransactionalHandle,
    ) -> Result<()>;
}

/// Feed that pushes nothing; the handle commits whatever its own transfer
/// logic produced.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullFeed;

#[async_trait]
impl RecordFeed for NullFeed {
    async fn feed(
        &self,
        _task: &TaskSource,
        _task_index: usize,
        _out: &mut dyn TransactionalHandle,
    ) -> Result<()> {
        Ok(())
    }
}

/// Observer for execution progress; the orchestrator wires this to the
/// persisted job state so commits survive a crash.
#[async_trait]
pub trait CommitSink: Send + Sync {
    /// The plugin handed its plan to the executor.
    async fn on_plan(&self, task_sources: &[TaskSource]) -> Result<()>;

    /// One more open attempt on a task.
    async fn on_open(&self, _task_index: usize) -> Result<()> {
        Ok(())
    }

    /// A task reached its durability boundary.
    async fn on_commit(&self, task_index: usize, report: &TaskReport) -> Result<()>;

    /// A task attempt failed for good.
    async fn on_failed(&self, _task_index: usize, _error: &str) -> Result<()> {
        Ok(())
    }
}

/// Conforming [`Control`] executor: bounded parallel fan-out with
/// commit-once enforcement and transparent per-task retry.
pub struct LocalControl {
    plugin: Arc<dyn OutputPlugin>,
    feed: Arc<dyn RecordFeed>,
    workers: usize,
    max_task_retries: u32,
    /// Reports of tasks that committed in a previous attempt; their indices
    /// are never re-run.
    committed: BTreeMap<usize, TaskReport>,
    sink: Option<Arc<dyn CommitSink>>,
    cancel: watch::Receiver<bool>,
}

impl LocalControl {
    /// Create an executor over `plugin` with the given worker bound.
    pub fn new(
        plugin: Arc<dyn OutputPlugin>,
        workers: usize,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            plugin,
            feed: Arc::new(NullFeed),
            workers: workers.max(1),
            max_task_retries: 0,
            committed: BTreeMap::new(),
            sink: None,
            cancel,
        }
    }

    /// Set the record feed driving each handle.
    pub fn with_feed(mut self, feed: Arc<dyn RecordFeed>) -> Self {
        self.feed = feed;
        self
    }

    /// Allow transparent per-task retries.
    pub fn with_max_task_retries(mut self, retries: u32) -> Self {
        self.max_task_retries = retries;
        self
    }

    /// Seed reports committed by a previous attempt (resume). Those indices
    /// are returned as-is and never re-opened.
    pub fn with_committed(mut self, committed: BTreeMap<usize, TaskReport>) -> Self {
        self.committed = committed;
        self
    }

    /// Attach a progress sink.
    pub fn with_sink(mut self, sink: Arc<dyn CommitSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// One open-feed-commit attempt on one task.
    async fn attempt(
        plugin: &dyn OutputPlugin,
        feed: &dyn RecordFeed,
        task: &TaskSource,
        index: usize,
    ) -> Result<TaskReport> {
        let inner = plugin.open(task, index)?;
        let mut guard = HandleGuard::new(inner);
        match feed.feed(task, index, &mut guard).await {
            Ok(()) => guard.commit().await,
            Err(e) => {
                guard.abort().await;
                Err(e)
            }
        }
    }

    /// Drive one task to commit, retrying transparently with the same
    /// source and index.
    async fn run_task(
        plugin: Arc<dyn OutputPlugin>,
        feed: Arc<dyn RecordFeed>,
        sink: Option<Arc<dyn CommitSink>>,
        cancel: watch::Receiver<bool>,
        task: TaskSource,
        index: usize,
        max_retries: u32,
    ) -> Result<TaskReport> {
        let mut attempt = 0u32;
        loop {
            if *cancel.borrow() {
                return Err(EngineError::Cancelled);
            }
            attempt += 1;
            if let Some(sink) = &sink {
                sink.on_open(index).await?;
            }
            match Self::attempt(&*plugin, &*feed, &task, index).await {
                Ok(report) => {
                    if let Some(sink) = &sink {
                        sink.on_commit(index, &report).await?;
                    }
                    info!("task {}: committed (attempt {})", index, attempt);
                    return Ok(report);
                }
                Err(e) if attempt <= max_retries => {
                    warn!("task {}: attempt {} failed, retrying: {}", index, attempt, e);
                }
                Err(e) => {
                    let message = e.to_string();
                    if let Some(sink) = &sink {
                        let _ = sink.on_failed(index, &message).await;
                    }
                    return Err(EngineError::task(index, message));
                }
            }
        }
    }
}

#[async_trait]
impl Control for LocalControl {
    async fn run(&self, task_sources: &[TaskSource]) -> Result<Vec<TaskReport>> {
        if let Some(sink) = &self.sink {
            sink.on_plan(task_sources).await?;
        }

        info!(
            "Executing {} tasks with {} workers ({} already committed)",
            task_sources.len(),
            self.workers,
            self.committed.len()
        );

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut handles = Vec::new();

        for (index, source) in task_sources.iter().enumerate() {
            if self.committed.contains_key(&index) {
                debug!("task {}: already committed, skipping", index);
                continue;
            }
            if *self.cancel.borrow() {
                info!("Cancellation requested, not starting further tasks");
                break;
            }

            let permit = semaphore.clone().acquire_owned().await.unwrap();
            let plugin = self.plugin.clone();
            let feed = self.feed.clone();
            let sink = self.sink.clone();
            let cancel = self.cancel.clone();
            let task = source.clone();
            let max_retries = self.max_task_retries;

            let handle = tokio::spawn(async move {
                let _permit = permit;
                Self::run_task(plugin, feed, sink, cancel, task, index, max_retries).await
            });

            handles.push((index, handle));
        }

        // Join everything before judging the run; first error wins but
        // every task gets to finish or abort.
        let joined = futures::future::join_all(
            handles
                .into_iter()
                .map(|(index, handle)| async move { (index, handle.await) }),
        )
        .await;

        let mut fresh: BTreeMap<usize, TaskReport> = BTreeMap::new();
        let mut first_error: Option<EngineError> = None;

        for (index, outcome) in joined {
            match outcome {
                Ok(Ok(report)) => {
                    fresh.insert(index, report);
                }
                Ok(Err(e)) => {
                    error!("task {}: failed - {}", index, e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(e) => {
                    error!("task {}: panicked - {}", index, e);
                    if first_error.is_none() {
                        first_error = Some(EngineError::task(index, format!("task panicked: {}", e)));
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if *self.cancel.borrow() {
            return Err(EngineError::Cancelled);
        }

        // All-or-nothing: exactly one committed report per index, in order.
        let mut reports = Vec::with_capacity(task_sources.len());
        for index in 0..task_sources.len() {
            let report = fresh
                .remove(&index)
                .or_else(|| self.committed.get(&index).cloned())
                .ok_or_else(|| {
                    EngineError::protocol(format!("no committed report for task {}", index))
                })?;
            reports.push(report);
        }
        Ok(reports)
    }
}

/// A cancellation receiver that never fires; for callers without a
/// cancellation source.
pub fn never_cancelled() -> watch::Receiver<bool> {
    let (_, rx) = watch::channel(false);
    rx
}
