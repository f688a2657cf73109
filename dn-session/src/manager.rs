use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use dn_datastore::chunk::{BlobMeta, JournalMeta};
use dn_datastore::{ChunkRegistry, ChunkVariant, Location, MemoryTracker};
use dn_types::config::SessionConfig;
use dn_types::error::{LocationId, NodeError};
use dn_types::medium::PlacementScore;
use dn_types::session_types::{SessionId, SessionState, SessionType};
use dn_types::{BlockId, ChunkId};

use crate::session::Session;

/// Shared table of in-progress write sessions, keyed by [`SessionId`].
///
/// Grounded on `src/api2/backup/environment.rs`'s `SharedBackupState`:
/// one mutex-guarded `HashMap<id, per-session state>` shared by every RPC
/// handler for the lifetime of a connection. Here the table spans the
/// whole node rather than one connection, and the value is our streaming
/// [`Session`] state machine instead of a fixed/dynamic writer pair.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    locations: RwLock<HashMap<LocationId, Location>>,
    registry: ChunkRegistry,
    session_memory: MemoryTracker,
    config: SessionConfig,
}

/// Options accepted by `StartChunk` (spec.md §4.3, "Operations exposed").
pub struct StartOptions {
    pub session_type: SessionType,
    pub sync_on_close: bool,
    pub medium_index: u32,
}

impl SessionManager {
    pub fn new(
        registry: ChunkRegistry,
        locations: HashMap<LocationId, Location>,
        session_memory: MemoryTracker,
        config: SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: RwLock::new(HashMap::new()),
                locations: RwLock::new(locations),
                registry,
                session_memory,
                config,
            }),
        }
    }

    fn get(&self, id: SessionId) -> Result<Arc<Session>, NodeError> {
        self.inner
            .sessions
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| NodeError::NoSuchSession(id.to_string()))
    }

    /// Picks a writable location of the requested medium by
    /// `(session_count, used_space/quota)` lexicographic order, with a
    /// small jitter (spec.md §4.1, "Placement fairness").
    fn pick_location(&self, medium_index: u32) -> Result<Location, NodeError> {
        let locations = self.inner.locations.read().unwrap();
        let mut candidates: Vec<&Location> = locations
            .values()
            .filter(|loc| loc.medium_index() == medium_index && loc.accepts_new_sessions())
            .collect();

        if candidates.is_empty() {
            return Err(NodeError::NoLocationAvailable(format!("medium {medium_index}")));
        }

        candidates.sort_by(|a, b| {
            let (sa, fa) = a.placement_key();
            let (sb, fb) = b.placement_key();
            PlacementScore {
                location: a.id(),
                session_count: sa,
                fill_ratio: fa,
            }
            .compare(&PlacementScore {
                location: b.id(),
                session_count: sb,
                fill_ratio: fb,
            })
        });

        // jitter among the best few candidates to avoid thundering herds
        let pool_size = candidates.len().min(3);
        let choice = rand::random::<usize>() % pool_size;
        Ok(candidates[choice].clone())
    }

    pub async fn start(&self, session_id: SessionId, options: StartOptions) -> Result<(), NodeError> {
        {
            let sessions = self.inner.sessions.read().unwrap();
            if sessions.contains_key(&session_id) {
                return Err(NodeError::SessionAlreadyExists(session_id.to_string()));
            }
        }

        let location = self.pick_location(options.medium_index)?;
        let session = Arc::new(Session::new(
            session_id,
            options.session_type,
            options.sync_on_close,
            location.clone(),
            self.inner.config.lease_duration,
            self.inner.config.window_size,
            self.inner.config.bytes_per_write,
        ));
        session.open_writer().await?;
        location.update_session_count(1);

        self.inner.sessions.write().unwrap().insert(session_id, session.clone());
        Ok(())
    }

    /// Accepts a batch of blocks into a session. A failed write (e.g.
    /// `NoSpaceLeftOnDevice`) aborts the whole session rather than leaving
    /// it half-written: the partial file is removed and the session record
    /// dropped, but the location itself stays enabled and keeps accepting
    /// new sessions unless the error was also location-fatal (spec.md §8,
    /// scenario S6).
    pub async fn put_blocks(
        &self,
        session_id: SessionId,
        first_block_index: u32,
        blocks: Vec<Arc<[u8]>>,
    ) -> Result<(), NodeError> {
        let session = self.get(session_id)?;
        match session.put_blocks(first_block_index, blocks, &self.inner.session_memory).await {
            Ok(()) => Ok(()),
            // Retriable conditions (throttling) leave the session intact so
            // the client can simply try the same put again.
            Err(err) if err.is_retriable() => Err(err),
            Err(err) => {
                session.cancel().await;
                session.location.update_session_count(-1);
                self.inner.sessions.write().unwrap().remove(&session_id);
                Err(err)
            }
        }
    }

    /// Forwards `[first_block_index, first_block_index + block_count)` to
    /// `target` as a `PutBlocks` call (spec.md §4.3, "send_blocks"). The
    /// transport itself is out of scope here (see `dn_types::rpc::NodeRpc`);
    /// callers supply the already-resolved forwarding function.
    pub async fn send_blocks<F, Fut>(
        &self,
        session_id: SessionId,
        first_block_index: u32,
        block_count: u32,
        forward: F,
    ) -> Result<(), NodeError>
    where
        F: FnOnce(Vec<BlockId>) -> Fut,
        Fut: std::future::Future<Output = Result<(), anyhow::Error>>,
    {
        let session = self.get(session_id)?;
        if session_id.chunk_id.object_type().is_journal() {
            return Err(NodeError::Invariant(
                "send_blocks is not supported for journal sessions".to_string(),
            ));
        }
        let ids: Vec<BlockId> = (first_block_index..first_block_index + block_count)
            .map(|i| session.block_id(i))
            .collect();
        forward(ids).await.map_err(|source| NodeError::PipelineFailed {
            target: format!("session {session_id}"),
            source,
        })
    }

    pub async fn flush_blocks(&self, session_id: SessionId, block_index: u32) -> Result<(), NodeError> {
        let session = self.get(session_id)?;
        session.flush_blocks(block_index).await
    }

    pub async fn ping(&self, session_id: SessionId) -> Result<(), NodeError> {
        let session = self.get(session_id)?;
        session.lease.ping().await;
        Ok(())
    }

    pub async fn cancel(&self, session_id: SessionId) -> Result<(), NodeError> {
        let session = self.get(session_id)?;
        session.cancel().await;
        session.location.update_session_count(-1);
        self.inner.sessions.write().unwrap().remove(&session_id);
        Ok(())
    }

    /// Finalizes a session: validates completeness, registers the new
    /// chunk atomically, and removes the session record (spec.md §4.3,
    /// "Finalize"; I4). Blob chunks additionally get a chunk-meta footer
    /// written alongside the data file; journal chunks skip the footer
    /// and instead get their record count set on [`ChunkVariant::Journal`]
    /// for a later, externally-triggered [`ChunkRegistry::seal_journal_chunk`]
    /// (spec.md §4.3, "Journal sessions"; I9).
    pub async fn finish(
        &self,
        session_id: SessionId,
        chunk_meta: Arc<[u8]>,
        expected_block_count: Option<u32>,
    ) -> Result<ChunkId, NodeError> {
        let session = self.get(session_id)?;
        let outcome = match session.finish(expected_block_count).await {
            Ok(outcome) => outcome,
            Err(err) => {
                session.cancel().await;
                session.location.update_session_count(-1);
                self.inner.sessions.write().unwrap().remove(&session_id);
                return Err(err);
            }
        };

        let is_journal = session_id.chunk_id.object_type().is_journal();
        if !is_journal {
            let meta_path = session.location.meta_file_path(session_id.chunk_id);
            tokio::fs::write(&meta_path, chunk_meta.as_ref())
                .await
                .map_err(|source| NodeError::IoError { location: session.location.id(), source })?;
        }

        let variant = if is_journal {
            ChunkVariant::Journal(JournalMeta {
                row_count: outcome.block_count as u64,
                sealed: false,
            })
        } else {
            ChunkVariant::Blob(BlobMeta::default())
        };

        self.inner.registry.register_new_chunk(
            session_id.chunk_id,
            session.location.id(),
            variant,
            outcome.data_size,
        )?;

        session.location.update_used_space(outcome.data_size as i64);
        session.location.update_session_count(-1);
        session.mark_finished().await;
        self.inner.sessions.write().unwrap().remove(&session_id);

        Ok(session_id.chunk_id)
    }

    /// Fixes a journal chunk's row count and rejects further appends
    /// (I9). Forwards to [`ChunkRegistry::seal_journal_chunk`]; the
    /// quorum protocol that decides when to call this lives outside this
    /// core (spec.md §1, Non-goals).
    pub fn seal_journal_chunk(&self, chunk_id: ChunkId, row_count: u64) -> Result<(), NodeError> {
        self.inner.registry.seal_journal_chunk(chunk_id, row_count)
    }

    /// Sweeps every live session and cancels those whose lease has
    /// expired (spec.md §4.3, "Lease"). Intended to run on a periodic
    /// control-pool tick rather than per-session timers.
    pub async fn reap_expired(&self) -> Vec<SessionId> {
        let candidates: Vec<(SessionId, Arc<Session>)> = self
            .inner
            .sessions
            .read()
            .unwrap()
            .iter()
            .map(|(id, s)| (*id, s.clone()))
            .collect();

        let mut expired = Vec::new();
        for (id, session) in candidates {
            if matches!(session.state().await, SessionState::Finished | SessionState::Cancelled) {
                continue;
            }
            if session.lease.is_expired().await {
                session.cancel().await;
                session.location.update_session_count(-1);
                self.inner.sessions.write().unwrap().remove(&id);
                expired.push(id);
            }
        }
        expired
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().unwrap().len()
    }
}
