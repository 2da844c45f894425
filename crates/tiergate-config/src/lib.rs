//! tiergate-config — configuration for the tiergate SSH gateway.
//!
//! One TOML file describes everything the gateway needs to know:
//!
//! ```text
//! [general]            listener, host key, docker/nomad knobs
//! [tiers.<name>]       orchestrator url, token, owned job prefixes, listing aliases
//! [users.<id>]         display name, public key, prefix groups
//! [prefix.<group>]     named sets of job-name prefixes
//! [alias]              command shortcuts, expanded once
//! ```
//!
//! [`GatewayConfig`] is the parsed, validated file. [`ConfigStore`] wraps it
//! for hot reload: sessions grab an `Arc` snapshot per command and never see a
//! half-applied change.

pub mod error;
pub mod schema;
pub mod store;

pub use error::{ConfigError, ConfigResult};
pub use schema::{
    ALL_TIERS, GatewayConfig, GeneralConfig, PrefixGroup, TierConfig, UserConfig, normalize_key,
};
pub use store::ConfigStore;
