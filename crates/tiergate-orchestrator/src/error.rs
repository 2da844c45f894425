//! Orchestrator error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid orchestrator url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("connection to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    #[error("request {method} {path} timed out")]
    Timeout { method: String, path: String },

    #[error("http error: {0}")]
    Http(String),

    #[error("{method} {path} returned {status}: {body}")]
    Status {
        method: String,
        path: String,
        status: u16,
        body: String,
    },

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("task group {group} not found in job {job}")]
    GroupNotFound { job: String, group: String },
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl OrchestratorError {
    /// Whether the orchestrator reported the object as missing.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            OrchestratorError::JobNotFound(_)
                | OrchestratorError::GroupNotFound { .. }
                | OrchestratorError::Status { status: 404, .. }
        )
    }
}
