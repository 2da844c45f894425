//! Short operator-facing handles for (task, allocation) pairs.
//!
//! A short id is the first ten hex characters of `sha1(task ++ alloc_id)`.
//! It is not collision-checked and only means something within the snapshot
//! that produced it. The index remembers which ids disappeared in the latest
//! refresh so callers can tell "stale" apart from "never existed".

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use sha1::{Digest, Sha1};

use crate::error::{StateError, StateResult};
use crate::types::{AllocId, JobId, NodeId};

/// Number of hex characters kept from the digest.
pub const SHORT_ID_LEN: usize = 10;

/// Compute the short id of `task` inside allocation `alloc_id`.
pub fn short_id(task: &str, alloc_id: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(task.as_bytes());
    hasher.update(alloc_id.as_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(SHORT_ID_LEN);
    digest
}

/// Everything needed to reach one task instance.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AllocationHandle {
    pub short_id: String,
    pub task: String,
    pub alloc_id: AllocId,
    pub tier: String,
    pub job_id: JobId,
    pub task_group: String,
    pub node_id: NodeId,
    /// Node name, the container runtime host. `None` when the node list was unavailable.
    pub node_name: Option<String>,
}

/// Short-id lookup table for one snapshot generation.
#[derive(Debug, Clone, Default)]
pub struct ShortIdIndex {
    generation: u64,
    handles: BTreeMap<String, AllocationHandle>,
    retired: BTreeSet<String>,
}

impl ShortIdIndex {
    /// Index `handles` as generation `generation` with nothing retired.
    pub fn new(generation: u64, handles: BTreeMap<String, AllocationHandle>) -> Self {
        Self {
            generation,
            handles,
            retired: BTreeSet::new(),
        }
    }

    /// Build the index that follows `previous`.
    ///
    /// Ids present in `previous` but absent now are kept as retired.
    pub fn succeed(previous: &ShortIdIndex, handles: BTreeMap<String, AllocationHandle>) -> Self {
        let retired = previous
            .handles
            .keys()
            .filter(|id| !handles.contains_key(*id))
            .cloned()
            .collect();
        Self {
            generation: previous.generation + 1,
            handles,
            retired,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&AllocationHandle> {
        self.handles.get(id)
    }

    /// Resolve `id`, distinguishing stale ids from unknown ones.
    pub fn resolve(&self, id: &str) -> StateResult<&AllocationHandle> {
        if let Some(handle) = self.handles.get(id) {
            return Ok(handle);
        }
        if self.retired.contains(id) {
            return Err(StateError::StaleHandle {
                id: id.to_string(),
                generation: self.generation,
            });
        }
        Err(StateError::NotFound(format!("short id {id}")))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AllocationHandle)> {
        self.handles.iter()
    }
}
