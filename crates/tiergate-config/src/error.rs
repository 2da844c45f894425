//! Error types for configuration loading and validation.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while reading, parsing, or validating the gateway configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("no orchestrator tiers configured")]
    NoTiers,

    #[error("tier name `{0}` is reserved")]
    ReservedTier(String),

    #[error("tier `{tier}` has an invalid url `{url}`: {reason}")]
    InvalidUrl {
        tier: String,
        url: String,
        reason: String,
    },

    #[error("tiers `{first}` and `{second}` have overlapping prefixes `{first_prefix}` / `{second_prefix}`")]
    OverlappingPrefixes {
        first: String,
        second: String,
        first_prefix: String,
        second_prefix: String,
    },

    #[error("command name `{name}` declared by {owner} is already taken")]
    DuplicateCommand { name: String, owner: String },

    #[error("alias `{0}` expands to an empty command")]
    EmptyAlias(String),

    #[error("user `{user}` references unknown prefix group `{group}`")]
    UnknownPrefixGroup { user: String, group: String },

    #[error("users `{first}` and `{second}` share the same key")]
    DuplicateKey { first: String, second: String },

    #[error("invalid docker api version `{0}` (expected major.minor)")]
    InvalidApiVersion(String),
}
