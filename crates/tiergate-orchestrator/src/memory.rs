//! In-memory orchestrator used by tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use tiergate_state::{
    AllocStats, Allocation, Deployment, JobDefinition, JobStub, Node, TaskGroup,
};

use crate::api::OrchestratorApi;
use crate::error::{OrchestratorError, OrchestratorResult};

/// Operations that can be forced to fail.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Op {
    ListNodes,
    ListJobs,
    Job,
    ListDeployments,
    ListAllocations,
    Stats(String),
    Register,
    Deregister,
}

#[derive(Debug, Default)]
struct Inner {
    nodes: Vec<Node>,
    jobs: BTreeMap<String, JobDefinition>,
    periodic: HashSet<String>,
    deployments: Vec<Deployment>,
    allocations: Vec<Allocation>,
    stats: BTreeMap<String, AllocStats>,
    failing: HashSet<Op>,
    registered: Vec<JobDefinition>,
    deregistered: Vec<String>,
}

/// A scriptable orchestrator tier.
#[derive(Debug, Default)]
pub struct MemoryOrchestrator {
    inner: Mutex<Inner>,
}

impl MemoryOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_node(self, id: &str, name: &str) -> Self {
        self.lock().nodes.push(Node {
            id: id.into(),
            name: name.into(),
            status: "ready".into(),
            ..Default::default()
        });
        self
    }

    /// Add a job with one task group per `(name, count)`.
    pub fn with_job(self, id: &str, groups: &[(&str, u32)]) -> Self {
        self.lock().jobs.insert(
            id.into(),
            JobDefinition {
                id: id.into(),
                stop: Some(false),
                task_groups: groups
                    .iter()
                    .map(|(name, count)| TaskGroup {
                        name: name.to_string(),
                        count: Some(*count),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            },
        );
        self
    }

    pub fn with_job_definition(self, job: JobDefinition) -> Self {
        {
            let mut inner = self.lock();
            if job.periodic.is_some() {
                inner.periodic.insert(job.id.clone());
            }
            inner.jobs.insert(job.id.clone(), job);
        }
        self
    }

    pub fn with_deployment(self, deployment: Deployment) -> Self {
        self.lock().deployments.push(deployment);
        self
    }

    pub fn with_allocation(self, allocation: Allocation) -> Self {
        self.lock().allocations.push(allocation);
        self
    }

    pub fn with_stats(self, alloc_id: &str, stats: AllocStats) -> Self {
        self.lock().stats.insert(alloc_id.into(), stats);
        self
    }

    pub fn fail(&self, op: Op) {
        self.lock().failing.insert(op);
    }

    pub fn heal(&self, op: &Op) {
        self.lock().failing.remove(op);
    }

    /// Every definition passed to `register_job`, in order.
    pub fn registered(&self) -> Vec<JobDefinition> {
        self.lock().registered.clone()
    }

    pub fn deregistered(&self) -> Vec<String> {
        self.lock().deregistered.clone()
    }

    pub fn current_job(&self, id: &str) -> Option<JobDefinition> {
        self.lock().jobs.get(id).cloned()
    }

    fn check(&self, op: Op) -> OrchestratorResult<()> {
        if self.lock().failing.contains(&op) {
            return Err(OrchestratorError::Status {
                method: "TEST".into(),
                path: format!("{op:?}"),
                status: 500,
                body: "injected failure".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl OrchestratorApi for MemoryOrchestrator {
    async fn list_nodes(&self) -> OrchestratorResult<Vec<Node>> {
        self.check(Op::ListNodes)?;
        Ok(self.lock().nodes.clone())
    }

    async fn list_jobs(&self) -> OrchestratorResult<Vec<JobStub>> {
        self.check(Op::ListJobs)?;
        let inner = self.lock();
        Ok(inner
            .jobs
            .values()
            .map(|job| JobStub {
                id: job.id.clone(),
                name: job.id.clone(),
                r#type: if inner.periodic.contains(&job.id) { "batch" } else { "service" }.into(),
                status: if job.stop == Some(true) { "dead" } else { "running" }.into(),
                periodic: inner.periodic.contains(&job.id),
            })
            .collect())
    }

    async fn job(&self, id: &str) -> OrchestratorResult<JobDefinition> {
        self.check(Op::Job)?;
        self.lock()
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::JobNotFound(id.to_string()))
    }

    async fn list_deployments(&self) -> OrchestratorResult<Vec<Deployment>> {
        self.check(Op::ListDeployments)?;
        Ok(self.lock().deployments.clone())
    }

    async fn list_allocations(&self) -> OrchestratorResult<Vec<Allocation>> {
        self.check(Op::ListAllocations)?;
        Ok(self.lock().allocations.clone())
    }

    async fn allocation_stats(&self, alloc_id: &str) -> OrchestratorResult<AllocStats> {
        self.check(Op::Stats(alloc_id.to_string()))?;
        Ok(self
            .lock()
            .stats
            .get(alloc_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn register_job(&self, job: &JobDefinition) -> OrchestratorResult<()> {
        self.check(Op::Register)?;
        let mut inner = self.lock();
        inner.registered.push(job.clone());
        inner.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn deregister_job(&self, id: &str) -> OrchestratorResult<()> {
        self.check(Op::Deregister)?;
        let mut inner = self.lock();
        inner.deregistered.push(id.to_string());
        match inner.jobs.get_mut(id) {
            Some(job) => {
                job.stop = Some(true);
                Ok(())
            }
            None => Err(OrchestratorError::JobNotFound(id.to_string())),
        }
    }
}
