//! Plugin transaction protocol.
//!
//! An output plugin and the engine jointly execute a small state machine:
//! the plugin plans (`transaction`/`resume`), the engine executes the plan
//! through the [`Control`] callback, per-task [`TransactionalHandle`]s
//! commit into [`TaskReport`]s, and the plugin derives a [`ConfigDiff`] from
//! the aggregate. `cleanup` runs exactly once after total success.

use crate::error::{EngineError, Result};
use crate::model::roles::{ConfigDiff, ConfigSource, TaskReport, TaskSource};
use crate::model::Schema;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

/// An opaque record payload handed to a handle's `write`.
///
/// Buffer allocation strategy belongs to the transfer logic outside this
/// core; the type exists so the handle seam is concrete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record(Bytes);

impl Record {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self(payload.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Per-task transactional resource: repeated appends, then exactly one
/// terminal operation.
///
/// `commit` is the sole durability boundary - it must be called at most once
/// and only after all of the task's data has been durably written. `abort`
/// must leave no durable side effect attributable to the task. Calling
/// either terminal operation after the other, or twice, is a usage error;
/// the engine's [`HandleGuard`](crate::executor::HandleGuard) turns it into
/// [`EngineError::Protocol`].
#[async_trait]
pub trait TransactionalHandle: Send {
    /// Append one record. Only legal before a terminal operation.
    async fn write(&mut self, record: Record) -> Result<()>;

    /// Terminal: durably commit and produce this task's report.
    async fn commit(&mut self) -> Result<TaskReport>;

    /// Terminal: discard everything this task wrote.
    async fn abort(&mut self);
}

/// The inversion point between planning (owned by the plugin) and execution
/// (owned by the engine's task executor).
///
/// `run` is blocking from the plugin's perspective: it returns only once all
/// tasks have collectively committed, with exactly one report per task in
/// index order, or fails as a whole. There is no partial-success return
/// path.
#[async_trait]
pub trait Control: Send + Sync {
    async fn run(&self, task_sources: &[TaskSource]) -> Result<Vec<TaskReport>>;
}

/// The contract every output plugin satisfies.
///
/// `transaction` and `resume` are pure planners: they decide the task plan
/// and delegate all scheduling to [`Control::run`]. The caller-supplied
/// `task_count_hint` is advisory - a plugin may plan a different count.
#[async_trait]
pub trait OutputPlugin: Send + Sync {
    /// The attribute schema this plugin declares for its job configuration.
    fn config_schema(&self) -> Schema;

    /// Plan and execute a fresh job. Called exactly once per job attempt.
    ///
    /// The plugin inspects `config`, constructs its task sources, invokes
    /// `control.run` over them, and derives the job-level diff from the
    /// committed reports.
    async fn transaction(
        &self,
        config: &ConfigSource,
        task_count_hint: usize,
        control: &dyn Control,
    ) -> Result<ConfigDiff>;

    /// Re-drive a previously planned job after an interrupted attempt.
    ///
    /// `task_sources` is the exact plan produced by the original
    /// `transaction` call; the plugin must re-invoke `control.run` over it
    /// and never recompute the plan. The resulting diff must be compatible
    /// with what a fully successful single-attempt `transaction` would have
    /// produced.
    async fn resume(
        &self,
        task_sources: &[TaskSource],
        task_count: usize,
        control: &dyn Control,
    ) -> Result<ConfigDiff>;

    /// Exactly-once side effects after total success (publishing, making
    /// the destination visible). Never called if any task failed.
    async fn cleanup(
        &self,
        task_sources: &[TaskSource],
        task_count: usize,
        success_reports: &[TaskReport],
    ) -> Result<()>;

    /// Open a transactional handle bound to one task of the plan.
    fn open(&self, task_source: &TaskSource, task_index: usize)
        -> Result<Box<dyn TransactionalHandle>>;
}

type PluginFactory = dyn Fn() -> Arc<dyn OutputPlugin> + Send + Sync;

/// Boundary to the wiring layer: given a plugin identifier, return an
/// object implementing the transaction protocol.
///
/// The dependency-injection container proper lives outside this core; the
/// registry is the lookup it must satisfy. A plugin obtained through a
/// scripting-runtime bridge registers here like any native one.
#[derive(Default)]
pub struct PluginRegistry {
    factories: HashMap<String, Box<PluginFactory>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin factory under a name. Last registration wins.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn OutputPlugin> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Instantiate the plugin registered under `name`.
    pub fn create(&self, name: &str) -> Result<Arc<dyn OutputPlugin>> {
        match self.factories.get(name) {
            Some(factory) => Ok(factory()),
            None => {
                let mut known: Vec<_> = self.factories.keys().cloned().collect();
                known.sort();
                Err(EngineError::Config(format!(
                    "Unknown plugin: '{}'. Registered plugins: {}",
                    name,
                    if known.is_empty() {
                        "(none)".to_string()
                    } else {
                        known.join(", ")
                    }
                )))
            }
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}
