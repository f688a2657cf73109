use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use dn_types::error::{LocationId, NodeError};
use dn_types::{BlockId, ChunkId};

use crate::cache::{BlockCache, BlockFetcher};
use crate::chunk::Chunk;
use crate::location::Location;
use crate::memory_tracker::MemoryTracker;
use crate::registry::ChunkRegistry;

/// Which read lane a fetch should run on. Meta reads (chunk headers,
/// extension blobs) stay off the data-read lane so a backlog of large
/// block reads never starves a quick metadata lookup (spec.md §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadKind {
    Data,
    Meta,
}

/// Ties together the chunk registry, the per-location disk layout, and the
/// block cache into the node's read path (spec.md §4.4, "Block store").
///
/// `block_size` is the fixed stride at which chunk payloads are sliced
/// into addressable blocks; the final block of a chunk may be shorter.
#[derive(Clone)]
pub struct BlockStore {
    registry: ChunkRegistry,
    locations: Arc<HashMap<LocationId, Location>>,
    cache: BlockCache,
    pending_read_bytes: MemoryTracker,
    block_size: u64,
}

struct DiskFetcher {
    chunk: Chunk,
    location: Location,
    kind: ReadKind,
    block_size: u64,
}

impl BlockFetcher for DiskFetcher {
    fn fetch(
        &self,
        id: BlockId,
    ) -> Box<dyn Future<Output = Result<Option<Arc<[u8]>>, anyhow::Error>> + Send> {
        let chunk = self.chunk.clone();
        let location = self.location.clone();
        let kind = self.kind;
        let block_size = self.block_size;

        Box::new(async move {
            let total = chunk.data_size();
            let offset = id.block_index as u64 * block_size;
            if offset >= total {
                return Ok(None);
            }
            let len = std::cmp::min(block_size, total - offset) as usize;
            let path = location.data_file_path(id.chunk_id);

            let invoker = match kind {
                ReadKind::Data => location.get_data_read_invoker(),
                ReadKind::Meta => location.get_meta_read_invoker(),
            };

            let data = invoker
                .run(async move {
                    use tokio::io::{AsyncReadExt, AsyncSeekExt};
                    let mut file = tokio::fs::File::open(&path).await?;
                    file.seek(std::io::SeekFrom::Start(offset)).await?;
                    let mut buf = vec![0u8; len];
                    file.read_exact(&mut buf).await?;
                    Ok::<Vec<u8>, std::io::Error>(buf)
                })
                .await?;

            Ok(Some(Arc::from(data)))
        })
    }
}

impl BlockStore {
    pub fn new(
        registry: ChunkRegistry,
        locations: Arc<HashMap<LocationId, Location>>,
        cache: BlockCache,
        pending_read_bytes: MemoryTracker,
        block_size: u64,
    ) -> Self {
        Self {
            registry,
            locations,
            cache,
            pending_read_bytes,
            block_size,
        }
    }

    fn location_for(&self, location: LocationId) -> Result<Location, NodeError> {
        self.locations
            .get(&location)
            .cloned()
            .ok_or_else(|| NodeError::Invariant(format!("no such location: {location}")))
    }

    /// Look up a block without touching disk; `None` means "not resident",
    /// not "doesn't exist" (use [`Self::read_block`] to resolve that).
    pub fn find_cached_block(&self, id: BlockId) -> Option<Arc<[u8]>> {
        self.cache.peek(id)
    }

    /// Seed the cache directly, e.g. right after a write session finishes
    /// sealing a block and the bytes are already in memory.
    pub fn put_cached_block(&self, id: BlockId, data: Arc<[u8]>) {
        self.cache.put(id, data);
    }

    /// Read one block, taking a registry read lock for the duration of the
    /// fetch (I2: no removal may complete while a read is outstanding) and
    /// accounting its weight against the pending-read-bytes budget while
    /// the fetch is in flight (spec.md §5, "Shared-resource policy").
    pub async fn read_block(&self, chunk_id: ChunkId, block_index: u32, kind: ReadKind) -> Result<Arc<[u8]>, NodeError> {
        let (chunk, _lock) = match self.registry.read_lock(chunk_id) {
            Ok(locked) => locked,
            Err(err @ NodeError::ChunkUnavailable(_)) => {
                self.cache.evict_chunk(chunk_id);
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        let location = self.location_for(chunk.location())?;
        let id = BlockId::new(chunk_id, block_index);

        let reservation = self.pending_read_bytes.try_reserve(self.block_size);
        let fetcher = DiskFetcher {
            chunk,
            location,
            kind,
            block_size: self.block_size,
        };

        let result = self.cache.access(id, &fetcher).await;
        drop(reservation);

        match result? {
            Some(data) => Ok(data),
            None => Err(NodeError::NoSuchBlock(id)),
        }
    }

    /// Read a contiguous run of blocks starting at `first_index`. May
    /// return fewer blocks than `count` if the chunk ends earlier: for a
    /// blob chunk a missing block inside the declared range is an error,
    /// but a journal chunk's reads past its sealed tail return an empty
    /// suffix without error (spec.md §4.4, "Read operations").
    pub async fn read_block_range(
        &self,
        chunk_id: ChunkId,
        first_index: u32,
        count: u32,
        kind: ReadKind,
    ) -> Result<Vec<Arc<[u8]>>, NodeError> {
        let is_journal = chunk_id.object_type().is_journal();
        let mut blocks = Vec::with_capacity(count as usize);
        for index in first_index..first_index + count {
            match self.read_block(chunk_id, index, kind).await {
                Ok(data) => blocks.push(data),
                Err(NodeError::NoSuchBlock(_)) if is_journal => break,
                Err(err) => return Err(err),
            }
        }
        Ok(blocks)
    }

    /// Read an explicit, possibly non-contiguous, set of block indices;
    /// missing blocks come back as absent entries rather than errors
    /// (mirrors `GetBlockSetRequest`, spec.md §4.4, §6).
    pub async fn read_block_set(
        &self,
        chunk_id: ChunkId,
        indices: &[u32],
        kind: ReadKind,
    ) -> Result<Vec<Option<Arc<[u8]>>>, NodeError> {
        let mut blocks = Vec::with_capacity(indices.len());
        for &index in indices {
            match self.read_block(chunk_id, index, kind).await {
                Ok(data) => blocks.push(Some(data)),
                Err(NodeError::NoSuchBlock(_)) => blocks.push(None),
                Err(err) => return Err(err),
            }
        }
        Ok(blocks)
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{BlobMeta, ChunkVariant};
    use dn_types::heartbeat::NullHeartbeatSink;
    use dn_types::MediumDescriptor;

    async fn test_location() -> Location {
        let mut dir = std::env::temp_dir();
        dir.push(format!("dn-block-store-test-{}", rand::random::<u64>()));
        let config = dn_types::config::LocationConfig {
            root: dir,
            medium: MediumDescriptor::new("ssd_blobs", 0),
            quota: 10_000_000,
            low_watermark: 1_000_000,
            high_watermark: 500_000,
            disable_writes_watermark: 100_000,
            trash_cleanup_watermark: 50_000,
            data_read_concurrency: 4,
            meta_read_concurrency: 2,
        };
        Location::open(1, config, "cell-a").await.unwrap()
    }

    #[tokio::test]
    async fn read_block_splits_fixed_stride_and_stops_at_chunk_end() {
        let location = test_location().await;
        let registry = ChunkRegistry::new(Arc::new(NullHeartbeatSink));

        let chunk_id = ChunkId::new(dn_types::ObjectType::Blob, 1, 77);
        let payload = b"0123456789abcdef".to_vec(); // 16 bytes, block_size 4 => 4 blocks
        let data_path = location.data_file_path(chunk_id);
        tokio::fs::create_dir_all(data_path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&data_path, &payload).await.unwrap();

        registry
            .register_new_chunk(chunk_id, location.id(), ChunkVariant::Blob(BlobMeta::default()), payload.len() as u64)
            .unwrap();

        let mut locations = HashMap::new();
        locations.insert(location.id(), location.clone());

        let store = BlockStore::new(
            registry,
            Arc::new(locations),
            BlockCache::new(1024),
            MemoryTracker::new("pending-read", 1024),
            4,
        );

        let block0 = store.read_block(chunk_id, 0, ReadKind::Data).await.unwrap();
        assert_eq!(block0.as_ref(), b"0123");
        let block3 = store.read_block(chunk_id, 3, ReadKind::Data).await.unwrap();
        assert_eq!(block3.as_ref(), b"cdef");

        let err = store.read_block(chunk_id, 4, ReadKind::Data).await;
        assert!(matches!(err, Err(NodeError::NoSuchBlock(_))));

        std::fs::remove_dir_all(location.root()).ok();
    }

    async fn store_with_chunk(object_type: dn_types::ObjectType, payload: &[u8]) -> (BlockStore, Location, ChunkId) {
        let location = test_location().await;
        let registry = ChunkRegistry::new(Arc::new(NullHeartbeatSink));
        let chunk_id = ChunkId::new(object_type, 1, 88);
        let data_path = location.data_file_path(chunk_id);
        tokio::fs::create_dir_all(data_path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&data_path, payload).await.unwrap();
        registry
            .register_new_chunk(chunk_id, location.id(), ChunkVariant::Blob(BlobMeta::default()), payload.len() as u64)
            .unwrap();
        let mut locations = HashMap::new();
        locations.insert(location.id(), location.clone());
        let store = BlockStore::new(
            registry,
            Arc::new(locations),
            BlockCache::new(1024),
            MemoryTracker::new("pending-read", 1024),
            4,
        );
        (store, location, chunk_id)
    }

    #[tokio::test]
    async fn read_block_range_stops_early_on_journal_tail_but_errors_for_blob() {
        let (store, location, blob_id) = store_with_chunk(dn_types::ObjectType::Blob, b"0123456789ab").await; // 3 blocks
        let err = store.read_block_range(blob_id, 0, 4, ReadKind::Data).await;
        assert!(matches!(err, Err(NodeError::NoSuchBlock(_))));
        std::fs::remove_dir_all(location.root()).ok();

        let (store, location, journal_id) = store_with_chunk(dn_types::ObjectType::Journal, b"0123456789ab").await;
        let blocks = store.read_block_range(journal_id, 0, 4, ReadKind::Data).await.unwrap();
        assert_eq!(blocks.len(), 3, "reads past the sealed tail return an empty suffix, not an error");
        std::fs::remove_dir_all(location.root()).ok();
    }

    #[tokio::test]
    async fn chunk_unavailable_evicts_its_cache_entries() {
        let (store, location, chunk_id) = store_with_chunk(dn_types::ObjectType::Blob, b"0123456789ab").await;
        store.read_block(chunk_id, 0, ReadKind::Data).await.unwrap();
        assert!(store.find_cached_block(BlockId::new(chunk_id, 0)).is_some());

        let chunk = store.registry.find_chunk(chunk_id).unwrap();
        chunk.schedule_removal();

        let err = store.read_block(chunk_id, 0, ReadKind::Data).await;
        assert!(matches!(err, Err(NodeError::ChunkUnavailable(_))));
        assert!(store.find_cached_block(BlockId::new(chunk_id, 0)).is_none());
        std::fs::remove_dir_all(location.root()).ok();
    }

    #[tokio::test]
    async fn read_block_set_returns_absent_entries_for_missing_indices() {
        let (store, location, chunk_id) = store_with_chunk(dn_types::ObjectType::Blob, b"0123456789ab").await; // 3 blocks
        let blocks = store.read_block_set(chunk_id, &[0, 5, 2], ReadKind::Data).await.unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].as_deref(), Some(b"0123".as_ref()));
        assert!(blocks[1].is_none());
        assert_eq!(blocks[2].as_deref(), Some(b"89ab".as_ref()));
        std::fs::remove_dir_all(location.root()).ok();
    }
}
