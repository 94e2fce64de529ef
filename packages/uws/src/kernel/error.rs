//! Engine error taxonomy.
//!
//! Client-request failures (bad parameter, illegal transition, permission
//! denied, not found) are typed variants so callers and the HTTP binding
//! can map them to precise responses. Internal failures wrap
//! `anyhow::Error` and are logged where they occur.

use thiserror::Error;

use super::phase::ExecutionPhase;

#[derive(Debug, Error)]
pub enum UwsError {
    #[error("illegal phase transition from {from} to {to}")]
    IllegalPhaseTransition {
        from: ExecutionPhase,
        to: ExecutionPhase,
    },

    #[error("invalid value for parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("parameter {0} cannot be modified")]
    ModificationForbidden(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("job {0} not found")]
    JobNotFound(String),

    #[error("result {result} of job {job} not found")]
    ResultNotFound { job: String, result: String },

    #[error("job list {0} not found")]
    ListNotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type UwsResult<T> = Result<T, UwsError>;

impl UwsError {
    /// Whether the error was caused by the client request (as opposed to
    /// an engine-side failure).
    pub fn is_client_error(&self) -> bool {
        !matches!(self, UwsError::Internal(_))
    }
}
