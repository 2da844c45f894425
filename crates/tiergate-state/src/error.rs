//! Error types for snapshot lookups.

use thiserror::Error;

/// Result type alias for snapshot operations.
pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("not found: {0}")]
    NotFound(String),

    /// The id was valid for an earlier listing but the allocation it named is gone.
    #[error("stale short id {id} (generation {generation}), re-run ps")]
    StaleHandle { id: String, generation: u64 },

    #[error("unknown tier: {0}")]
    UnknownTier(String),
}
