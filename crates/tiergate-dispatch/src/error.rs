use thiserror::Error;

use tiergate_bridge::BridgeError;
use tiergate_orchestrator::OrchestratorError;
use tiergate_state::StateError;

pub type DispatchResult<T> = Result<T, DispatchError>;

/// Failures of an accepted command. Rejections are not errors, see [`crate::Rejection`].
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("tier `{0}` is not configured")]
    UnknownTier(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
