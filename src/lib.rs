//! # bulkflow
//!
//! Control core of a pluggable bulk data-transfer engine.
//!
//! Independently authored output plugins move large datasets in parallel,
//! tolerate partial failure, and resume an interrupted job without redoing
//! completed work. The core provides:
//!
//! - **Dynamic attribute model** - plugins declare their own attribute
//!   schemas at runtime; the engine decodes, validates and persists that
//!   state without compile-time knowledge of any plugin's shape
//! - **Transactional task protocol** - a job splits into N independent
//!   tasks, each driven to exactly one commit even across resume attempts
//! - **Resume capability** via HMAC-signed JSON state files
//! - **Parallel execution** with a bounded tokio worker pool
//!
//! ## Example
//!
//! ```rust,no_run
//! use bulkflow::{EngineConfig, Orchestrator, PluginRegistry};
//! use std::path::PathBuf;
//!
//! #[tokio::main]
//! async fn main() -> bulkflow::Result<()> {
//!     let registry = PluginRegistry::new(); // plugins register here at wiring time
//!     let plugin = registry.create("csv")?;
//!
//!     let config = EngineConfig::load("engine.yaml")?;
//!     let job = serde_json::json!({"path": "/data", "rows_per_task": 1000});
//!
//!     let result = Orchestrator::new(config, plugin)?
//!         .with_state_file(PathBuf::from("job.state.json"))
//!         .resume()?
//!         .run(&job, None)
//!         .await?;
//!     println!("{}", result.to_json()?);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod executor;
pub mod model;
pub mod orchestrator;
pub mod plugin;
pub mod state;

// Re-exports for convenient access
pub use config::{EngineConfig, RuntimeConfig, RuntimeScope};
pub use error::{EngineError, Result};
pub use executor::{CommitSink, HandleGuard, LocalControl, NullFeed, RecordFeed};
pub use model::roles::{ConfigDiff, ConfigSource, TaskReport, TaskSource};
pub use model::{
    AttrType, AttrValue, DynamicModel, ModelFactory, PolicyFactory, Schema, UnknownFieldPolicy,
};
pub use orchestrator::{JobResult, Orchestrator};
pub use plugin::{Control, OutputPlugin, PluginRegistry, Record, TransactionalHandle};
pub use state::{JobState, RunStatus, TaskPlan, TaskSlot, TaskStatus};
