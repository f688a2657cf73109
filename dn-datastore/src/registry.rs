use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use dn_types::error::{LocationId, NodeError};
use dn_types::heartbeat::{ChunkEvent, HeartbeatSink};
use dn_types::ChunkId;

use crate::chunk::{Chunk, ChunkVariant, ReadLock};
use crate::location::Location;

/// The authoritative in-memory index of every chunk this node currently
/// claims to hold, plus the collaborator that turns "removal scheduled,
/// read locks outstanding" into an eventual file deletion.
///
/// Grounded on `pbs-datastore::DataStore`'s `Arc<DataStoreImpl>` sharing
/// pattern (one shared, cheaply-cloneable handle backing every session and
/// RPC handler), generalized from a single flat chunk-store directory to a
/// multi-location registry that also tracks read-lock state (spec.md
/// §4.2, invariants I1-I3).
#[derive(Clone)]
pub struct ChunkRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    chunks: RwLock<HashMap<ChunkId, Chunk>>,
    heartbeat: Arc<dyn HeartbeatSink>,
}

impl ChunkRegistry {
    pub fn new(heartbeat: Arc<dyn HeartbeatSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                chunks: RwLock::new(HashMap::new()),
                heartbeat,
            }),
        }
    }

    pub fn find_chunk(&self, id: ChunkId) -> Option<Chunk> {
        self.inner.chunks.read().unwrap().get(&id).cloned()
    }

    /// I1: "A chunk id is registered at most once across this node's
    /// lifetime; a second registration of the same id is an error, not a
    /// silent overwrite."
    pub fn register_new_chunk(
        &self,
        id: ChunkId,
        location: LocationId,
        variant: ChunkVariant,
        data_size: u64,
    ) -> Result<Chunk, NodeError> {
        let mut chunks = self.inner.chunks.write().unwrap();
        if chunks.contains_key(&id) {
            return Err(NodeError::ChunkAlreadyExists(id));
        }
        let chunk = Chunk::new(id, location, variant, data_size);
        chunks.insert(id, chunk.clone());
        drop(chunks);
        self.inner.heartbeat.on_chunk_event(ChunkEvent::Added { chunk_id: id, location });
        Ok(chunk)
    }

    /// Replaces an existing chunk's variant/location/size in place (used
    /// when a replication or repair pass relocates a chunk's authoritative
    /// copy). Bumps the chunk's version so concurrent cache entries can
    /// detect staleness.
    pub fn update_existing_chunk(
        &self,
        id: ChunkId,
        new_location: LocationId,
        variant: ChunkVariant,
        data_size: u64,
    ) -> Result<u32, NodeError> {
        let chunk = self.find_chunk(id).ok_or(NodeError::NoSuchChunk(id))?;
        let old_location = chunk.location();
        chunk.set_variant(variant);
        chunk.set_data_size(data_size);
        chunk.set_location(new_location);
        let version = chunk.bump_version();
        if old_location != new_location {
            self.inner.heartbeat.on_chunk_event(ChunkEvent::MediumChanged {
                chunk_id: id,
                old_location,
                new_location,
            });
        }
        Ok(version)
    }

    /// Acquire a read lock on a chunk: `NoSuchChunk` if this id was never
    /// registered (or has already been dropped from the index), and the
    /// distinct `ChunkUnavailable` if it's still indexed but lost the race
    /// against a concurrent `remove_chunk` scheduling its removal between
    /// the lookup and the lock attempt (spec.md §4.2, I3; §7).
    pub fn read_lock(&self, id: ChunkId) -> Result<(Chunk, ReadLock), NodeError> {
        let chunk = self.find_chunk(id).ok_or(NodeError::NoSuchChunk(id))?;
        let lock = chunk.try_read_lock().ok_or(NodeError::ChunkUnavailable(id))?;
        Ok((chunk, lock))
    }

    /// Schedules a chunk's removal. The chunk stays in the index — so a
    /// racing `read_lock` still finds it and correctly reports
    /// `ChunkUnavailable` rather than `NoSuchChunk` — until its files are
    /// actually gone. If no read locks are outstanding the files are
    /// deleted before this returns and the chunk is dropped from the index
    /// immediately; otherwise a background task deletes them, and drops
    /// the index entry, as soon as the last [`ReadLock`] releases (I3).
    pub async fn remove_chunk(&self, id: ChunkId, location: &Location) -> Result<(), NodeError> {
        let chunk = self.find_chunk(id).ok_or(NodeError::NoSuchChunk(id))?;
        let delete_now = chunk.schedule_removal();
        let loc = location.clone();
        let loc_id = location.id();

        if delete_now {
            loc.delete_chunk_files(id).await?;
            self.inner.chunks.write().unwrap().remove(&id);
            self.inner
                .heartbeat
                .on_chunk_event(ChunkEvent::Removed { chunk_id: id, location: loc_id });
        } else {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                chunk.wait_for_unlocked().await;
                if let Err(err) = loc.delete_chunk_files(id).await {
                    log::error!("deferred removal of chunk {id} failed: {err}");
                    return;
                }
                inner.chunks.write().unwrap().remove(&id);
                inner
                    .heartbeat
                    .on_chunk_event(ChunkEvent::Removed { chunk_id: id, location: loc_id });
            });
        }
        Ok(())
    }

    /// Fixes a journal chunk's row count and rejects further appends
    /// (I9). The quorum protocol that decides *when* to seal a journal
    /// chunk lives outside this core (spec.md §1, Non-goals); this is the
    /// mechanism such a caller invokes once it has reached agreement.
    pub fn seal_journal_chunk(&self, id: ChunkId, row_count: u64) -> Result<(), NodeError> {
        let chunk = self.find_chunk(id).ok_or(NodeError::NoSuchChunk(id))?;
        chunk.seal(row_count)
    }

    pub fn len(&self) -> usize {
        self.inner.chunks.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::BlobMeta;
    use dn_types::heartbeat::NullHeartbeatSink;
    use dn_types::MediumDescriptor;

    fn test_id(unique: u128) -> ChunkId {
        ChunkId::new(dn_types::ObjectType::Blob, 1, unique)
    }

    fn registry() -> ChunkRegistry {
        ChunkRegistry::new(Arc::new(NullHeartbeatSink))
    }

    #[test]
    fn sealing_a_journal_chunk_through_the_registry() {
        let reg = registry();
        let id = ChunkId::new(dn_types::ObjectType::Journal, 1, 9);
        reg.register_new_chunk(id, 1, ChunkVariant::Journal(crate::chunk::JournalMeta::default()), 0)
            .unwrap();
        reg.seal_journal_chunk(id, 7).unwrap();
        let chunk = reg.find_chunk(id).unwrap();
        assert!(chunk.is_sealed());
        assert!(matches!(reg.seal_journal_chunk(id, 8), Err(NodeError::JournalSealed(_))));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let reg = registry();
        let id = test_id(1);
        reg.register_new_chunk(id, 1, ChunkVariant::Blob(BlobMeta::default()), 10)
            .unwrap();
        let err = reg.register_new_chunk(id, 1, ChunkVariant::Blob(BlobMeta::default()), 10);
        assert!(matches!(err, Err(NodeError::ChunkAlreadyExists(_))));
    }

    #[test]
    fn removed_chunk_is_no_longer_findable_for_new_locks() {
        let reg = registry();
        let id = test_id(2);
        reg.register_new_chunk(id, 1, ChunkVariant::Blob(BlobMeta::default()), 10)
            .unwrap();
        assert!(reg.find_chunk(id).is_some());
        {
            let mut chunks = reg.inner.chunks.write().unwrap();
            chunks.remove(&id);
        }
        assert!(reg.find_chunk(id).is_none());
        assert!(reg.read_lock(id).is_err());
    }

    async fn tempdir_location() -> Location {
        let mut dir = std::env::temp_dir();
        dir.push(format!("dn-registry-test-{}", rand::random::<u64>()));
        let config = dn_types::config::LocationConfig {
            root: dir,
            medium: MediumDescriptor::new("ssd_blobs", 0),
            quota: 1_000_000,
            low_watermark: 100_000,
            high_watermark: 50_000,
            disable_writes_watermark: 10_000,
            trash_cleanup_watermark: 5_000,
            data_read_concurrency: 4,
            meta_read_concurrency: 2,
        };
        Location::open(1, config, "cell-a").await.unwrap()
    }

    #[tokio::test]
    async fn removal_with_outstanding_read_lock_waits_for_release() {
        let reg = registry();
        let loc = tempdir_location().await;
        let id = test_id(3);
        reg.register_new_chunk(id, loc.id(), ChunkVariant::Blob(BlobMeta::default()), 0)
            .unwrap();
        let (chunk, lock) = reg.read_lock(id).unwrap();

        reg.remove_chunk(id, &loc).await.unwrap();
        assert!(reg.find_chunk(id).is_some(), "still indexed while the lock is outstanding");
        assert!(matches!(reg.read_lock(id), Err(NodeError::ChunkUnavailable(_))));
        assert_eq!(chunk.read_lock_count(), 1, "and the lock is still held");

        drop(lock);
        // give the spawned deferred-deletion task a chance to run
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(reg.find_chunk(id).is_none(), "dropped from the index once deletion completes");
        std::fs::remove_dir_all(loc.root()).ok();
    }
}
