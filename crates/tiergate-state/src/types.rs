//! Orchestrator records as they appear on the Nomad HTTP API.
//!
//! Field names follow the API's PascalCase. Only the fields the gateway reads
//! are typed; job definitions additionally keep every unknown field so they
//! can be registered back unchanged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Identifier of a job (also its name).
pub type JobId = String;

/// Identifier of an allocation.
pub type AllocId = String;

/// Identifier of a client node.
pub type NodeId = String;

/// Allocation client states that are still actionable.
pub const ACTIONABLE_CLIENT_STATUSES: &[&str] = &["running", "pending", "failed"];

// ── Nodes ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct Node {
    #[serde(rename = "ID")]
    pub id: NodeId,
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub datacenter: String,
}

// ── Jobs ──────────────────────────────────────────────────────────

/// Entry of the job list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct JobStub {
    #[serde(rename = "ID")]
    pub id: JobId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub periodic: bool,
}

/// Full job definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct JobDefinition {
    #[serde(rename = "ID")]
    pub id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<bool>,
    #[serde(default)]
    pub task_groups: Vec<TaskGroup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub periodic: Option<PeriodicConfig>,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct TaskGroup {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct PeriodicConfig {
    #[serde(default)]
    pub spec: String,
    #[serde(default)]
    pub time_zone: Option<String>,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

/// Body of a register request: `{"Job": …}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct RegisterRequest {
    pub job: JobDefinition,
}

impl JobDefinition {
    pub fn task_group_mut(&mut self, name: &str) -> Option<&mut TaskGroup> {
        self.task_groups.iter_mut().find(|g| g.name == name)
    }
}

// ── Deployments ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Running,
    Paused,
    Failed,
    Successful,
    Cancelled,
    Pending,
    Blocked,
    Unblocking,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Deployment {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "JobID")]
    pub job_id: JobId,
    pub status: DeploymentStatus,
    #[serde(default)]
    pub status_description: String,
}

// ── Allocations ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct Allocation {
    #[serde(rename = "ID")]
    pub id: AllocId,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "JobID")]
    pub job_id: JobId,
    #[serde(default)]
    pub task_group: String,
    #[serde(rename = "NodeID", default)]
    pub node_id: NodeId,
    #[serde(default)]
    pub client_status: String,
    /// Last modification, unix nanoseconds.
    #[serde(default)]
    pub modify_time: i64,
    #[serde(default)]
    pub task_states: BTreeMap<String, TaskState>,
}

impl Allocation {
    pub fn is_actionable(&self) -> bool {
        ACTIONABLE_CLIENT_STATUSES.contains(&self.client_status.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct TaskState {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub failed: bool,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub events: Vec<TaskEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct TaskEvent {
    pub r#type: String,
    /// Unix nanoseconds.
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub display_message: String,
}

/// Nomad encodes empty lists as `null`.
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

// ── Resource usage ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct AllocStats {
    #[serde(default)]
    pub resource_usage: ResourceUsage,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceUsage {
    #[serde(default)]
    pub memory_stats: MemoryStats,
    #[serde(default)]
    pub cpu_stats: CpuStats,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct MemoryStats {
    #[serde(rename = "RSS", default)]
    pub rss: u64,
    #[serde(default)]
    pub max_usage: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct CpuStats {
    #[serde(default)]
    pub total_ticks: f64,
    #[serde(default)]
    pub percent: f64,
}
