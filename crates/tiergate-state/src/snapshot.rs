//! Point-in-time views of one tier and of the whole cluster.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{StateError, StateResult};
use crate::shortid::{AllocationHandle, ShortIdIndex, short_id};
use crate::types::{
    AllocId, AllocStats, Allocation, Deployment, DeploymentStatus, JobDefinition, JobId, JobStub,
    Node, NodeId,
};

/// Name of the synthetic tier merging every configured tier.
pub const ALL_TIER: &str = "all";

/// Everything fetched from one orchestrator tier in one refresh.
///
/// Built by the fetcher and never modified afterwards.
#[derive(Debug, Clone, Default)]
pub struct TierSnapshot {
    pub tier: String,
    pub jobs: BTreeMap<JobId, JobStub>,
    /// Actionable allocations grouped by job.
    pub allocations: BTreeMap<JobId, Vec<Allocation>>,
    /// Full definitions of periodic jobs.
    pub periodic: BTreeMap<JobId, JobDefinition>,
    pub nodes: BTreeMap<NodeId, Node>,
    pub deployments: BTreeMap<String, Deployment>,
    pub stats: BTreeMap<AllocId, AllocStats>,
    pub handles: BTreeMap<String, AllocationHandle>,
}

/// Deployment health badge shown next to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentBadge {
    Ok,
    Fail,
}

impl DeploymentBadge {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentBadge::Ok => "OK",
            DeploymentBadge::Fail => "FAIL",
        }
    }
}

impl TierSnapshot {
    pub fn empty(tier: impl Into<String>) -> Self {
        Self {
            tier: tier.into(),
            ..Default::default()
        }
    }

    /// Keep actionable allocations, grouped by job.
    pub fn set_allocations(&mut self, allocations: impl IntoIterator<Item = Allocation>) {
        self.allocations.clear();
        for alloc in allocations.into_iter().filter(Allocation::is_actionable) {
            self.allocations
                .entry(alloc.job_id.clone())
                .or_default()
                .push(alloc);
        }
    }

    /// Compute a handle for every task of every kept allocation.
    ///
    /// Must run after nodes and allocations are in place.
    pub fn index_handles(&mut self) {
        let mut handles = BTreeMap::new();
        for alloc in self.allocations.values().flatten() {
            let node_name = self.nodes.get(&alloc.node_id).map(|n| n.name.clone());
            for task in alloc.task_states.keys() {
                let id = short_id(task, &alloc.id);
                handles.insert(
                    id.clone(),
                    AllocationHandle {
                        short_id: id,
                        task: task.clone(),
                        alloc_id: alloc.id.clone(),
                        tier: self.tier.clone(),
                        job_id: alloc.job_id.clone(),
                        task_group: alloc.task_group.clone(),
                        node_id: alloc.node_id.clone(),
                        node_name: node_name.clone(),
                    },
                );
            }
        }
        self.handles = handles;
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.values().map(Vec::len).sum()
    }

    pub fn node_name(&self, node_id: &str) -> Option<&str> {
        self.nodes.get(node_id).map(|n| n.name.as_str())
    }

    /// `Fail` if any deployment of `job` failed, else `Ok` if one succeeded.
    pub fn deployment_badge(&self, job: &str) -> Option<DeploymentBadge> {
        let mut badge = None;
        for deployment in self.deployments.values().filter(|d| d.job_id == job) {
            match deployment.status {
                DeploymentStatus::Failed => return Some(DeploymentBadge::Fail),
                DeploymentStatus::Successful => badge = Some(DeploymentBadge::Ok),
                _ => {}
            }
        }
        badge
    }

    /// Fold `other` into `self` by key union; later entries win.
    fn absorb(&mut self, other: &TierSnapshot) {
        self.jobs.extend(other.jobs.clone());
        self.allocations.extend(other.allocations.clone());
        self.periodic.extend(other.periodic.clone());
        self.nodes.extend(other.nodes.clone());
        self.deployments.extend(other.deployments.clone());
        self.stats.extend(other.stats.clone());
        self.handles.extend(other.handles.clone());
    }
}

/// One refresh of every configured tier plus their union.
#[derive(Debug, Clone)]
pub struct ClusterSnapshot {
    tiers: BTreeMap<String, Arc<TierSnapshot>>,
    all: Arc<TierSnapshot>,
    index: ShortIdIndex,
}

impl ClusterSnapshot {
    /// Merge per-tier snapshots into the synthetic `all` tier.
    ///
    /// Tiers are folded in name order, so the union is deterministic.
    /// `previous` is the index of the prior refresh, used to flag stale ids.
    pub fn assemble(
        tiers: BTreeMap<String, TierSnapshot>,
        previous: Option<&ShortIdIndex>,
    ) -> Self {
        let mut all = TierSnapshot::empty(ALL_TIER);
        for snapshot in tiers.values() {
            all.absorb(snapshot);
        }
        let index = match previous {
            Some(previous) => ShortIdIndex::succeed(previous, all.handles.clone()),
            None => ShortIdIndex::new(1, all.handles.clone()),
        };
        Self {
            tiers: tiers
                .into_iter()
                .map(|(name, snapshot)| (name, Arc::new(snapshot)))
                .collect(),
            all: Arc::new(all),
            index,
        }
    }

    pub fn generation(&self) -> u64 {
        self.index.generation()
    }

    pub fn all(&self) -> &TierSnapshot {
        &self.all
    }

    /// Snapshot of `name`, where `all` names the union.
    pub fn tier(&self, name: &str) -> StateResult<&TierSnapshot> {
        if name == ALL_TIER {
            return Ok(&self.all);
        }
        self.tiers
            .get(name)
            .map(Arc::as_ref)
            .ok_or_else(|| StateError::UnknownTier(name.to_string()))
    }

    pub fn tier_names(&self) -> impl Iterator<Item = &str> {
        self.tiers.keys().map(String::as_str)
    }

    pub fn index(&self) -> &ShortIdIndex {
        &self.index
    }

    pub fn resolve(&self, short_id: &str) -> StateResult<&AllocationHandle> {
        self.index.resolve(short_id)
    }
}
