use crate::chunk_id::ChunkId;
use crate::error::LocationId;

/// One reportable change to the node's chunk set, as it would be batched
/// into an incremental heartbeat delta (spec.md §6, "Heartbeat outputs").
/// This crate only emits these; batching, full-vs-incremental framing, and
/// the wire protocol to the master are out of scope (spec.md §1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkEvent {
    Added { chunk_id: ChunkId, location: LocationId },
    Removed { chunk_id: ChunkId, location: LocationId },
    MediumChanged {
        chunk_id: ChunkId,
        old_location: LocationId,
        new_location: LocationId,
    },
}

/// Collaborator the chunk registry reports structural changes to.
///
/// A real master-heartbeat reporter would batch these into the event-capped
/// deltas spec.md §6 describes and cancel out an add immediately followed
/// by a remove before a heartbeat goes out; that reconciliation lives
/// outside the core (spec.md §9, "Heartbeat-delta reconciliation").
pub trait HeartbeatSink: Send + Sync {
    fn on_chunk_event(&self, event: ChunkEvent);
}

/// A sink that drops every event; useful for tests and for nodes that have
/// not yet completed master registration.
pub struct NullHeartbeatSink;

impl HeartbeatSink for NullHeartbeatSink {
    fn on_chunk_event(&self, _event: ChunkEvent) {}
}
