//! Bridge and container runtime error types.

use thiserror::Error;

/// Errors reported by a [`ContainerRuntime`](crate::ContainerRuntime).
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("cannot connect to container runtime at {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("no such object: {0}")]
    NotFound(String),

    #[error("container runtime error: {0}")]
    Api(String),

    #[error("stream i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors ending a bridged session.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("allocation {0} has no known node")]
    NoNode(String),

    #[error("container {0} not found")]
    ContainerNotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("container {0} has no global IPv6 address")]
    NoAddress(String),

    #[error("container {0} has no running process")]
    NoProcess(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

pub type BridgeResult<T> = Result<T, BridgeError>;
