//! tiergate-orchestrator — everything that talks to the Nomad tiers.
//!
//! ```text
//! OrchestratorApi (trait)
//!   ├── NomadClient        HTTP/1.1 over hyper, one connection per request
//!   └── MemoryOrchestrator in-memory double (feature `test-util`)
//!
//! fetch_tier_snapshot  one tier  → TierSnapshot
//! Aggregator           all tiers → Arc<ClusterSnapshot> (ttl cache, generations)
//! JobControl           stop / restart / restart_group / inspect on one tier
//! ```

pub mod aggregator;
pub mod api;
pub mod client;
pub mod control;
pub mod error;
pub mod fetcher;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;

pub use aggregator::{Aggregator, NomadConnector, TierConnector};
pub use api::OrchestratorApi;
pub use client::NomadClient;
pub use control::JobControl;
pub use error::{OrchestratorError, OrchestratorResult};
pub use fetcher::fetch_tier_snapshot;
#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryOrchestrator, Op};
