//! Error types for the engine core.

use thiserror::Error;

/// Main error type for engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Engine configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A raw job document whose top level is not an object.
    #[error("Malformed document: expected an object at the top level, found {found}")]
    MalformedDocument { found: String },

    /// A recognized attribute carries a value of the wrong shape.
    #[error("Type mismatch for attribute '{attr}': expected {expected}, found {found}")]
    TypeMismatch {
        attr: String,
        expected: String,
        found: String,
    },

    /// The plugin could not produce a valid task plan from the given config.
    #[error("Planning failed: {0}")]
    Planning(String),

    /// A task's handle never reached commit.
    #[error("Task {index} failed: {message}")]
    Task { index: usize, message: String },

    /// A plugin or executor broke the transaction protocol.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// State file error
    #[error("State file error: {0}")]
    State(String),

    /// Config hash mismatch on resume
    #[error("Config has changed since last run - cannot resume. Start a fresh job instead.")]
    ConfigChanged,

    /// Job was cancelled (SIGINT, etc.)
    #[error("Job cancelled")]
    Cancelled,

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl EngineError {
    /// Create a MalformedDocument error naming the offending token kind.
    pub fn malformed(found: impl Into<String>) -> Self {
        EngineError::MalformedDocument {
            found: found.into(),
        }
    }

    /// Create a TypeMismatch error for a recognized attribute.
    pub fn type_mismatch(
        attr: impl Into<String>,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        EngineError::TypeMismatch {
            attr: attr.into(),
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Create a Task error.
    pub fn task(index: usize, message: impl Into<String>) -> Self {
        EngineError::Task {
            index,
            message: message.into(),
        }
    }

    /// Create a Protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        EngineError::Protocol(message.into())
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        // Add error chain for wrapped errors
        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
