//! Error types for CareWatch.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CareError>;

#[derive(Debug, Error)]
pub enum CareError {
    /// A registry operation named a task that has no record.
    #[error("task not found: {0}")]
    NotFound(String),

    /// The same task name was declared twice with different triggers.
    #[error("task '{0}' is declared more than once with conflicting triggers")]
    DuplicateTrigger(String),

    #[error("task '{task}' references unknown action '{action}'")]
    UnknownAction { task: String, action: String },

    #[error("task '{task}' has an invalid trigger: {reason}")]
    InvalidTrigger { task: String, reason: String },

    #[error("task '{task}' is outside namespace '{namespace}'")]
    OutsideNamespace { task: String, namespace: String },

    /// The backing store could not be reached or rejected the operation.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("reconciliation aborted after {} applied task(s): {source}", applied.len())]
    ReconcileAborted {
        applied: Vec<String>,
        #[source]
        source: Box<CareError>,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CareError {
    /// Whether the error is transient and the operation may be retried on the next poll.
    pub fn is_transient(&self) -> bool {
        match self {
            CareError::StorageUnavailable(_) | CareError::Io(_) => true,
            CareError::ReconcileAborted { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}
