//! Fans snapshot fetches out to every tier and merges the results.
//!
//! ```text
//!            ┌─ fetch(test) ───────┐
//! refresh ──►├─ fetch(quality) ────┼──► ClusterSnapshot::assemble ──► Arc<ClusterSnapshot>
//!            └─ fetch(production) ─┘         (previous index ⇒ stale ids)
//! ```
//!
//! A tier that fails to connect, or whose fetch task dies, contributes an
//! empty snapshot for that refresh. There is no retry.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tiergate_config::{GatewayConfig, TierConfig};
use tiergate_state::{ClusterSnapshot, TierSnapshot};

use crate::api::OrchestratorApi;
use crate::client::NomadClient;
use crate::error::OrchestratorResult;
use crate::fetcher::fetch_tier_snapshot;

/// Produces an API handle for a configured tier.
pub trait TierConnector: Send + Sync + 'static {
    fn connect(&self, tier: &str, config: &TierConfig) -> OrchestratorResult<Arc<dyn OrchestratorApi>>;
}

/// Connects to tiers over the Nomad HTTP API.
#[derive(Debug, Clone)]
pub struct NomadConnector {
    timeout: Duration,
}

impl NomadConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl TierConnector for NomadConnector {
    fn connect(&self, _tier: &str, config: &TierConfig) -> OrchestratorResult<Arc<dyn OrchestratorApi>> {
        let client = NomadClient::new(&config.url, config.token.clone(), self.timeout)?;
        Ok(Arc::new(client))
    }
}

struct Latest {
    built_at: Instant,
    snapshot: Arc<ClusterSnapshot>,
}

/// Shared snapshot source for all sessions.
pub struct Aggregator {
    connector: Arc<dyn TierConnector>,
    latest: Mutex<Option<Latest>>,
}

impl Aggregator {
    pub fn new(connector: Arc<dyn TierConnector>) -> Self {
        Self {
            connector,
            latest: Mutex::new(None),
        }
    }

    /// Connector used for job control on a single tier.
    pub fn connect(&self, tier: &str, config: &TierConfig) -> OrchestratorResult<Arc<dyn OrchestratorApi>> {
        self.connector.connect(tier, config)
    }

    /// Return a snapshot no older than `snapshot_ttl`, refreshing if needed.
    pub async fn snapshot(&self, config: &GatewayConfig) -> Arc<ClusterSnapshot> {
        let ttl = config.general.snapshot_ttl();
        if !ttl.is_zero() {
            let latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(latest) = latest.as_ref() {
                if latest.built_at.elapsed() < ttl {
                    debug!(generation = latest.snapshot.generation(), "reusing cached snapshot");
                    return latest.snapshot.clone();
                }
            }
        }
        self.refresh(config).await
    }

    /// Fetch every tier now.
    pub async fn refresh(&self, config: &GatewayConfig) -> Arc<ClusterSnapshot> {
        let started = Instant::now();
        let tiers = self.fetch_all(config).await;

        let mut latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = latest.as_ref().map(|l| l.snapshot.index());
        let snapshot = Arc::new(ClusterSnapshot::assemble(tiers, previous));
        *latest = Some(Latest {
            built_at: Instant::now(),
            snapshot: snapshot.clone(),
        });

        info!(
            generation = snapshot.generation(),
            jobs = snapshot.all().jobs.len(),
            handles = snapshot.index().len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "cluster snapshot refreshed"
        );
        snapshot
    }

    async fn fetch_all(&self, config: &GatewayConfig) -> BTreeMap<String, TierSnapshot> {
        // Every configured tier gets an entry, even if its fetch fails.
        let mut tiers: BTreeMap<String, TierSnapshot> = config
            .tier_names()
            .map(|name| (name.to_string(), TierSnapshot::empty(name)))
            .collect();

        let mut fetches = JoinSet::new();
        for (name, tier) in &config.tiers {
            match self.connector.connect(name, tier) {
                Ok(api) => {
                    let name = name.clone();
                    fetches.spawn(async move { fetch_tier_snapshot(&name, api).await });
                }
                Err(e) => warn!(tier = %name, error = %e, "cannot reach tier, using empty snapshot"),
            }
        }

        while let Some(joined) = fetches.join_next().await {
            match joined {
                Ok(snapshot) => {
                    tiers.insert(snapshot.tier.clone(), snapshot);
                }
                Err(e) => warn!(error = %e, "tier fetch task failed, using empty snapshot"),
            }
        }
        tiers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::memory::{MemoryOrchestrator, Op};
    use tiergate_state::{Allocation, StateError, TaskState, short_id};

    struct StaticConnector {
        tiers: HashMap<String, Arc<MemoryOrchestrator>>,
    }

    impl TierConnector for StaticConnector {
        fn connect(&self, tier: &str, _config: &TierConfig) -> OrchestratorResult<Arc<dyn OrchestratorApi>> {
            let api = self.tiers.get(tier).cloned().ok_or_else(|| {
                crate::OrchestratorError::InvalidUrl {
                    url: tier.to_string(),
                    reason: "no such test tier".into(),
                }
            })?;
            Ok(api)
        }
    }

    fn config(ttl: u64) -> GatewayConfig {
        let text = format!(
            r#"
[general]
bind = "127.0.0.1:2222"
host_key = "/tmp/k"
snapshot_ttl_secs = {ttl}

[tiers.test]
url = "http://test:4646"
prefix = ["t-"]

[tiers.production]
url = "http://prod:4646"
prefix = ["p-"]

[tiers.quality]
url = "http://qual:4646"
prefix = ["q-"]
"#
        );
        GatewayConfig::from_toml_str(&text, &[]).unwrap()
    }

    fn running(id: &str, job: &str) -> Allocation {
        Allocation {
            id: id.into(),
            job_id: job.into(),
            task_group: "g".into(),
            client_status: "running".into(),
            task_states: [("main".to_string(), TaskState::default())].into(),
            ..Default::default()
        }
    }

    fn setup() -> (Aggregator, HashMap<String, Arc<MemoryOrchestrator>>) {
        let tiers: HashMap<String, Arc<MemoryOrchestrator>> = HashMap::from([
            (
                "test".to_string(),
                Arc::new(
                    MemoryOrchestrator::new()
                        .with_job("t-api", &[("g", 1)])
                        .with_allocation(running("ta1", "t-api")),
                ),
            ),
            (
                "production".to_string(),
                Arc::new(
                    MemoryOrchestrator::new()
                        .with_job("p-api", &[("g", 1)])
                        .with_job("p-web", &[("g", 1)])
                        .with_allocation(running("pa1", "p-api")),
                ),
            ),
            (
                "quality".to_string(),
                Arc::new(MemoryOrchestrator::new().with_job("q-api", &[("g", 1)])),
            ),
        ]);
        let connector = StaticConnector { tiers: tiers.clone() };
        (Aggregator::new(Arc::new(connector)), tiers)
    }

    #[tokio::test]
    async fn all_is_union_of_tiers() {
        let (aggregator, _) = setup();
        let snapshot = aggregator.refresh(&config(0)).await;
        let jobs: Vec<_> = snapshot.all().jobs.keys().cloned().collect();
        assert_eq!(jobs, vec!["p-api", "p-web", "q-api", "t-api"]);
        assert_eq!(snapshot.tier("production").unwrap().jobs.len(), 2);
        assert_eq!(snapshot.tier_names().count(), 3);
    }

    #[tokio::test]
    async fn failed_tier_removes_exactly_its_jobs() {
        let (aggregator, tiers) = setup();
        tiers["production"].fail(Op::ListJobs);
        tiers["production"].fail(Op::ListAllocations);
        let snapshot = aggregator.refresh(&config(0)).await;
        let jobs: Vec<_> = snapshot.all().jobs.keys().cloned().collect();
        assert_eq!(jobs, vec!["q-api", "t-api"]);
        assert!(snapshot.tier("production").unwrap().jobs.is_empty());
    }

    #[tokio::test]
    async fn unreachable_tier_is_empty() {
        let (aggregator, mut tiers) = setup();
        tiers.remove("quality");
        let aggregator = Aggregator {
            connector: Arc::new(StaticConnector { tiers }),
            latest: aggregator.latest,
        };
        let snapshot = aggregator.refresh(&config(0)).await;
        assert!(snapshot.tier("quality").unwrap().jobs.is_empty());
        assert_eq!(snapshot.all().jobs.len(), 3);
    }

    #[tokio::test]
    async fn vanished_ids_become_stale() {
        let (aggregator, tiers) = setup();
        let first = aggregator.refresh(&config(0)).await;
        let id = short_id("main", "pa1");
        assert!(first.resolve(&id).is_ok());

        tiers["production"].fail(Op::ListAllocations);
        let second = aggregator.refresh(&config(0)).await;
        assert_eq!(second.generation(), first.generation() + 1);
        assert!(matches!(second.resolve(&id), Err(StateError::StaleHandle { .. })));
        // The older snapshot still resolves it.
        assert!(first.resolve(&id).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_reuses_snapshot() {
        let (aggregator, _) = setup();
        let config = config(10);
        let first = aggregator.snapshot(&config).await;
        let again = aggregator.snapshot(&config).await;
        assert!(Arc::ptr_eq(&first, &again));

        tokio::time::advance(Duration::from_secs(11)).await;
        let later = aggregator.snapshot(&config).await;
        assert_eq!(later.generation(), first.generation() + 1);
    }

    #[tokio::test]
    async fn zero_ttl_always_refreshes() {
        let (aggregator, _) = setup();
        let config = config(0);
        let first = aggregator.snapshot(&config).await;
        let second = aggregator.snapshot(&config).await;
        assert_eq!(second.generation(), first.generation() + 1);
    }
}
