use serde::{Deserialize, Serialize};

use crate::chunk_id::ChunkId;

/// `session_id = (chunk_id, target medium index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId {
    pub chunk_id: ChunkId,
    pub medium_index: u32,
}

impl SessionId {
    pub fn new(chunk_id: ChunkId, medium_index: u32) -> Self {
        Self {
            chunk_id,
            medium_index,
        }
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.chunk_id, self.medium_index)
    }
}

/// Who opened the session; informs placement and throttler selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionType {
    User,
    Replication,
    Repair,
}

/// Lifecycle state of a [`crate::session_types::SessionId`]-keyed session
/// (spec.md §3, "Lifecycles").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Waiting,
    Running,
    Finishing,
    Cancelled,
    Finished,
}
