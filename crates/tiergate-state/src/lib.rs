//! tiergate-state — the cluster snapshot model.
//!
//! A refresh produces one [`TierSnapshot`] per orchestrator tier. The
//! snapshots are merged into a [`ClusterSnapshot`], which also owns the
//! [`ShortIdIndex`] operators use to address individual task instances.
//!
//! ```text
//!   tier "test"  ─┐
//!   tier "prod"  ─┼─► ClusterSnapshot { tiers, all, index(generation) }
//!   tier "qual"  ─┘
//! ```
//!
//! Snapshots are plain values: nothing here talks to the network, and
//! nothing is mutated once a snapshot has been assembled.

pub mod error;
pub mod principal;
pub mod shortid;
pub mod snapshot;
pub mod types;

pub use error::{StateError, StateResult};
pub use principal::{Principal, has_prefix};
pub use shortid::{AllocationHandle, SHORT_ID_LEN, ShortIdIndex, short_id};
pub use snapshot::{ALL_TIER, ClusterSnapshot, DeploymentBadge, TierSnapshot};
pub use types::*;
