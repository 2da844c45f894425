//! The orchestrator operations the gateway consumes.

use async_trait::async_trait;

use tiergate_state::{AllocStats, Allocation, Deployment, JobDefinition, JobStub, Node};

use crate::error::OrchestratorResult;

/// Read and register/deregister access to one orchestrator tier.
///
/// Implemented over HTTP by [`NomadClient`](crate::NomadClient) and in memory
/// by the test double.
#[async_trait]
pub trait OrchestratorApi: Send + Sync + 'static {
    async fn list_nodes(&self) -> OrchestratorResult<Vec<Node>>;

    async fn list_jobs(&self) -> OrchestratorResult<Vec<JobStub>>;

    /// Full job definition. Missing jobs are `JobNotFound`.
    async fn job(&self, id: &str) -> OrchestratorResult<JobDefinition>;

    async fn list_deployments(&self) -> OrchestratorResult<Vec<Deployment>>;

    async fn list_allocations(&self) -> OrchestratorResult<Vec<Allocation>>;

    async fn allocation_stats(&self, alloc_id: &str) -> OrchestratorResult<AllocStats>;

    async fn register_job(&self, job: &JobDefinition) -> OrchestratorResult<()>;

    /// Deregister without purging, so running allocations drain normally.
    async fn deregister_job(&self, id: &str) -> OrchestratorResult<()>;
}
