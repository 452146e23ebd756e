//! Error taxonomy for provisioning runs
//!
//! Task implementations return `anyhow::Result` and attach context the way the
//! rest of the crate does; the executor and the CLI classify those failures into
//! [`ProvisionError`] so a run can decide what is fatal and which exit status to
//! report.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("unknown target '{name}': not in inventory (known: {known}) and no address/credentials supplied")]
    UnknownTarget { name: String, known: String },

    #[error("target '{target}' is unreachable: {reason}")]
    Unreachable { target: String, reason: String },

    #[error("task '{task}' could not probe current state: {source:#}")]
    ProbeFailed {
        task: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("task '{task}' failed to converge: {source:#}")]
    ApplyFailed {
        task: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("handler '{handler}' failed: {source:#}")]
    HandlerFailed {
        handler: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("task {index}: {reason}")]
    InvalidTask { index: usize, reason: String },

    #[error("role not found: {0}")]
    RoleNotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl ProvisionError {
    /// Process exit status for a run that ended with this error.
    ///
    /// 1 is reserved for runs that started and had failing tasks.
    pub fn exit_code(&self) -> i32 {
        match self {
            ProvisionError::Unreachable { .. } => 3,
            ProvisionError::ProbeFailed { .. }
            | ProvisionError::ApplyFailed { .. }
            | ProvisionError::HandlerFailed { .. } => 1,
            _ => 2,
        }
    }
}

pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;
