use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use dn_datastore::{BlockCache, BlockStore, ChunkRegistry, Location, MemoryTracker, ThrottlerRegistry};
use dn_session::SessionManager;
use dn_types::error::LocationId;
use dn_types::heartbeat::HeartbeatSink;
use dn_types::rpc::PeerDescriptor;
use dn_types::worker::WorkerContext;
use dn_types::BlockId;

/// One node's full storage core: every location it owns, the chunk
/// registry, the write-session manager, and the block store/cache, all
/// behind one cheaply-cloneable handle.
///
/// Grounded on `pbs-datastore::DataStore`'s `Arc<DataStoreImpl>` pattern:
/// a single shared struct handed to every RPC handler and background task,
/// rather than passing five separate `Arc`s around.
#[derive(Clone)]
pub struct DataNode {
    inner: Arc<Inner>,
}

struct Inner {
    cell_guid: String,
    locations: RwLock<HashMap<LocationId, Location>>,
    registry: ChunkRegistry,
    sessions: SessionManager,
    block_store: BlockStore,
    peer_table: RwLock<HashMap<BlockId, Vec<(PeerDescriptor, SystemTime)>>>,
    read_throttlers: ThrottlerRegistry,
}

impl DataNode {
    pub fn new(
        cell_guid: String,
        locations: HashMap<LocationId, Location>,
        registry: ChunkRegistry,
        sessions: SessionManager,
        cache: BlockCache,
        pending_read_bytes: MemoryTracker,
        block_size: u64,
        read_throttlers: ThrottlerRegistry,
    ) -> Self {
        let block_store = BlockStore::new(
            registry.clone(),
            Arc::new(locations.clone()),
            cache,
            pending_read_bytes,
            block_size,
        );
        Self {
            inner: Arc::new(Inner {
                cell_guid,
                locations: RwLock::new(locations),
                registry,
                sessions,
                block_store,
                peer_table: RwLock::new(HashMap::new()),
                read_throttlers,
            }),
        }
    }

    pub fn cell_guid(&self) -> &str {
        &self.inner.cell_guid
    }

    pub fn registry(&self) -> &ChunkRegistry {
        &self.inner.registry
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    /// Fixes a journal chunk's row count and rejects further appends
    /// (I9). Not part of the RPC surface: the quorum protocol that
    /// decides when to seal a journal chunk lives outside this core
    /// (spec.md §1, Non-goals), which calls into this mechanism once it
    /// reaches agreement.
    pub fn seal_journal_chunk(&self, chunk_id: dn_types::ChunkId, row_count: u64) -> Result<(), dn_types::error::NodeError> {
        self.inner.sessions.seal_journal_chunk(chunk_id, row_count)
    }

    pub fn block_store(&self) -> &BlockStore {
        &self.inner.block_store
    }

    pub fn read_throttlers(&self) -> &ThrottlerRegistry {
        &self.inner.read_throttlers
    }

    /// Paces an outbound read response against its workload's named
    /// throttler: delayed, never rejected (spec.md §5, "Throttling").
    pub async fn delay_for_outbound(&self, workload: dn_types::WorkloadDescriptor, bytes: u64) {
        let delay = self.inner.read_throttlers.delay_for(workload, bytes);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    pub fn location(&self, id: LocationId) -> Option<Location> {
        self.inner.locations.read().unwrap().get(&id).cloned()
    }

    pub fn locations(&self) -> Vec<Location> {
        self.inner.locations.read().unwrap().values().cloned().collect()
    }

    /// Registers a peer as a known holder of `block_ids`, used to redirect
    /// future `GetBlockSet` callers instead of re-fetching locally
    /// (spec.md §4.4, "Cooperation with the registry"; §6 `UpdatePeer`).
    pub fn update_peer(&self, peer: PeerDescriptor, expiration: SystemTime, block_ids: Vec<BlockId>) {
        let mut table = self.inner.peer_table.write().unwrap();
        for id in block_ids {
            table.entry(id).or_default().push((peer.clone(), expiration));
        }
    }

    pub fn peer_hints(&self, block_id: BlockId) -> Vec<PeerDescriptor> {
        let now = SystemTime::now();
        self.inner
            .peer_table
            .read()
            .unwrap()
            .get(&block_id)
            .map(|peers| {
                peers
                    .iter()
                    .filter(|(_, expiration)| *expiration > now)
                    .map(|(peer, _)| peer.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Runs all locations' periodic health checks and the node-wide lease
    /// reaper; intended to be driven by a control-pool tick (spec.md §5,
    /// "Scheduling model").
    pub async fn run_maintenance_tick(&self, heartbeat: &dyn HeartbeatSink, worker: &dyn WorkerContext) {
        for location in self.locations() {
            location.health_check(worker).await;
        }
        let expired = self.inner.sessions.reap_expired().await;
        for id in expired {
            log::info!("session {id} cancelled after lease expiry");
        }
        let _ = heartbeat;
    }
}
