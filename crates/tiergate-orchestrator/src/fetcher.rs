//! Builds one [`TierSnapshot`] from one orchestrator tier.
//!
//! Every list call degrades independently: a failure leaves that part of the
//! snapshot empty and is logged, but the rest of the snapshot is still built.
//! Per-allocation stats are fetched concurrently and the function only
//! returns once every stats task has finished.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinSet;
use tracing::{debug, warn};

use tiergate_state::{AllocStats, TierSnapshot};

use crate::api::OrchestratorApi;

/// Fetch a complete snapshot of `tier`.
pub async fn fetch_tier_snapshot(tier: &str, api: Arc<dyn OrchestratorApi>) -> TierSnapshot {
    let mut snapshot = TierSnapshot::empty(tier);

    let (nodes, jobs, deployments, allocations) = tokio::join!(
        api.list_nodes(),
        api.list_jobs(),
        api.list_deployments(),
        api.list_allocations(),
    );

    match nodes {
        Ok(nodes) => {
            snapshot.nodes = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
        }
        Err(e) => warn!(tier, error = %e, "failed to list nodes"),
    }

    match jobs {
        Ok(jobs) => {
            for stub in jobs {
                if stub.periodic {
                    match api.job(&stub.id).await {
                        Ok(definition) => {
                            snapshot.periodic.insert(stub.id.clone(), definition);
                        }
                        Err(e) => warn!(tier, job = %stub.id, error = %e, "failed to read periodic job"),
                    }
                }
                snapshot.jobs.insert(stub.id.clone(), stub);
            }
        }
        Err(e) => warn!(tier, error = %e, "failed to list jobs"),
    }

    match deployments {
        Ok(deployments) => {
            snapshot.deployments = deployments
                .into_iter()
                .map(|d| (d.id.clone(), d))
                .collect();
        }
        Err(e) => warn!(tier, error = %e, "failed to list deployments"),
    }

    match allocations {
        Ok(allocations) => snapshot.set_allocations(allocations),
        Err(e) => warn!(tier, error = %e, "failed to list allocations"),
    }

    snapshot.index_handles();

    let alloc_ids: Vec<String> = snapshot
        .allocations
        .values()
        .flatten()
        .map(|a| a.id.clone())
        .collect();
    snapshot.stats = collect_stats(tier, &api, alloc_ids).await;

    debug!(
        tier,
        jobs = snapshot.jobs.len(),
        allocations = snapshot.allocation_count(),
        nodes = snapshot.nodes.len(),
        stats = snapshot.stats.len(),
        "tier snapshot built"
    );
    snapshot
}

/// One task per allocation; results meet in a shared map.
async fn collect_stats(
    tier: &str,
    api: &Arc<dyn OrchestratorApi>,
    alloc_ids: Vec<String>,
) -> BTreeMap<String, AllocStats> {
    let stats: Arc<Mutex<BTreeMap<String, AllocStats>>> = Arc::default();
    let mut tasks = JoinSet::new();

    for alloc_id in alloc_ids {
        let api = api.clone();
        let stats = stats.clone();
        let tier = tier.to_string();
        tasks.spawn(async move {
            match api.allocation_stats(&alloc_id).await {
                Ok(sample) => {
                    // Held for the insert only.
                    stats
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(alloc_id, sample);
                }
                Err(e) => debug!(%tier, alloc = %alloc_id, error = %e, "allocation stats unavailable"),
            }
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!(tier, error = %e, "stats task aborted");
        }
    }

    let mut map = stats.lock().unwrap_or_else(PoisonError::into_inner);
    std::mem::take(&mut *map)
}
