use dn_types::heartbeat::{ChunkEvent, HeartbeatSink};

/// Default [`HeartbeatSink`] for a standalone node: logs every chunk
/// event at debug level rather than batching it into full/incremental
/// reports to a master.
///
/// The master-heartbeat protocol itself — full vs. incremental reports,
/// event-cap chunking, add/remove cancellation across a report window —
/// is explicitly out of scope (spec.md §1): this core only needs to call
/// `on_chunk_event` reliably. A real deployment swaps this sink for one
/// that forwards into that protocol.
pub struct LoggingHeartbeatSink;

impl HeartbeatSink for LoggingHeartbeatSink {
    fn on_chunk_event(&self, event: ChunkEvent) {
        match event {
            ChunkEvent::Added { chunk_id, location } => {
                log::debug!("chunk {chunk_id} added on location {location}");
            }
            ChunkEvent::Removed { chunk_id, location } => {
                log::debug!("chunk {chunk_id} removed from location {location}");
            }
            ChunkEvent::MediumChanged { chunk_id, old_location, new_location } => {
                log::debug!("chunk {chunk_id} moved from location {old_location} to {new_location}");
            }
        }
    }
}
