//! Stop, restart and inspect operations against one tier.
//!
//! None of these roll back. A restart that fails after deregistering leaves
//! the job stopped, and the error says where the sequence stopped.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use tiergate_state::RegisterRequest;

use crate::api::OrchestratorApi;
use crate::error::{OrchestratorError, OrchestratorResult};

pub struct JobControl {
    api: Arc<dyn OrchestratorApi>,
    settle: Duration,
}

impl JobControl {
    /// `settle` is the pause between deregistering and re-registering a job.
    pub fn new(api: Arc<dyn OrchestratorApi>, settle: Duration) -> Self {
        Self { api, settle }
    }

    /// Deregister `job` after checking it exists.
    pub async fn stop(&self, job: &str) -> OrchestratorResult<()> {
        self.api.job(job).await?;
        self.api.deregister_job(job).await?;
        info!(job, "job deregistered");
        Ok(())
    }

    /// Deregister, wait for the settle delay, and register the same definition again.
    pub async fn restart(&self, job: &str) -> OrchestratorResult<()> {
        let mut definition = self.api.job(job).await?;
        self.api.deregister_job(job).await?;
        info!(job, settle_ms = self.settle.as_millis() as u64, "job deregistered for restart");

        tokio::time::sleep(self.settle).await;

        definition.stop = Some(false);
        if let Err(e) = self.api.register_job(&definition).await {
            warn!(job, error = %e, "re-register failed, job left stopped");
            return Err(e);
        }
        info!(job, "job re-registered");
        Ok(())
    }

    /// Scale `group` to zero and straight back to its count, recreating its
    /// allocations without touching the job's other groups.
    pub async fn restart_group(&self, job: &str, group: &str) -> OrchestratorResult<()> {
        let mut definition = self.api.job(job).await?;
        let original = match definition.task_group_mut(group) {
            Some(tg) => tg.count.replace(0),
            None => {
                return Err(OrchestratorError::GroupNotFound {
                    job: job.to_string(),
                    group: group.to_string(),
                });
            }
        };
        self.api.register_job(&definition).await?;
        info!(job, group, "task group scaled to zero");

        if let Some(tg) = definition.task_group_mut(group) {
            tg.count = original;
        }
        self.api.register_job(&definition).await?;
        info!(job, group, count = ?original, "task group restored");
        Ok(())
    }

    /// The job as a register request body, indented by four spaces.
    pub async fn inspect(&self, job: &str) -> OrchestratorResult<String> {
        let definition = self.api.job(job).await?;
        let request = RegisterRequest { job: definition };

        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        request.serialize(&mut serializer)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}
