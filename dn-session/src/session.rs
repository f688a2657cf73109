use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;

use dn_datastore::{Location, MemoryTracker, Reservation};
use dn_types::error::NodeError;
use dn_types::session_types::{SessionId, SessionState, SessionType};
use dn_types::BlockId;

use crate::lease::Lease;
use crate::window::SlidingWindow;

/// What a session accumulated by the time it finished (spec.md §4.3,
/// "Finalize"). `block_count` doubles as a journal's record count when
/// the session manager registers a [`dn_datastore::ChunkVariant::Journal`].
pub struct SessionFinishOutcome {
    pub data_size: u64,
    pub block_count: u32,
}

/// One in-progress streaming upload (spec.md §3, "Session").
///
/// The writer handle, the sliding window, and the per-slot memory
/// reservations are all owned here so that `SessionManager` only has to
/// coordinate session *lifecycle* (lookup, registration on finish,
/// placement) rather than the write protocol's bookkeeping.
pub struct Session {
    pub session_id: SessionId,
    pub session_type: SessionType,
    pub sync_on_close: bool,
    pub location: Location,
    pub lease: Arc<Lease>,
    pub bytes_per_write: usize,
    state: AsyncMutex<SessionState>,
    window: AsyncMutex<SlidingWindow>,
    reservations: AsyncMutex<HashMap<u32, Reservation>>,
    writer: AsyncMutex<Option<File>>,
    received_bytes: AtomicU64,
}

impl Session {
    pub fn new(
        session_id: SessionId,
        session_type: SessionType,
        sync_on_close: bool,
        location: Location,
        lease_duration: Duration,
        window_size: u32,
        bytes_per_write: usize,
    ) -> Self {
        Self {
            session_id,
            session_type,
            sync_on_close,
            location,
            lease: Lease::new(lease_duration),
            bytes_per_write,
            state: AsyncMutex::new(SessionState::Waiting),
            window: AsyncMutex::new(SlidingWindow::new(session_id.chunk_id, window_size)),
            reservations: AsyncMutex::new(HashMap::new()),
            writer: AsyncMutex::new(None),
            received_bytes: AtomicU64::new(0),
        }
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    async fn set_state(&self, state: SessionState) {
        *self.state.lock().await = state;
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::SeqCst)
    }

    /// Opens (creating and truncating any stale temp file) the session's
    /// on-disk writer. Journal and blob sessions share a writer; the
    /// distinction only matters at `finish` time.
    pub async fn open_writer(&self) -> Result<(), NodeError> {
        let path = self.location.data_file_path(self.session_id.chunk_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| NodeError::IoError { location: self.location.id(), source })?;
        }
        let file = File::create(&path)
            .await
            .map_err(|source| NodeError::IoError { location: self.location.id(), source })?;
        *self.writer.lock().await = Some(file);
        self.set_state(SessionState::Running).await;
        Ok(())
    }

    /// Accept (or idempotently re-accept) a batch of blocks starting at
    /// `first_block_index`, reserving memory per slot (spec.md §4.3,
    /// "Back-pressure"), then flushing whatever contiguous prefix is now
    /// writable to disk.
    pub async fn put_blocks(
        &self,
        first_block_index: u32,
        blocks: Vec<Arc<[u8]>>,
        memory: &MemoryTracker,
    ) -> Result<(), NodeError> {
        if !matches!(self.state().await, SessionState::Running) {
            return Err(NodeError::NoSuchSession(self.session_id.to_string()));
        }

        let incoming_bytes: u64 = blocks.iter().map(|b| b.len() as u64).sum();
        if !self.location.has_enough_space(incoming_bytes) {
            return Err(NodeError::NoSpaceLeftOnDevice(self.location.id()));
        }

        let mut new_reservations = Vec::with_capacity(blocks.len());
        for block in &blocks {
            let reservation = memory
                .try_reserve(block.len() as u64)
                .ok_or(NodeError::WriteThrottlingActive(self.location.id()))?;
            new_reservations.push(reservation);
        }

        {
            let mut window = self.window.lock().await;
            for (offset, data) in blocks.into_iter().enumerate() {
                let index = first_block_index + offset as u32;
                window.put(&self.session_id.to_string(), index, data.clone())?;
                self.received_bytes.fetch_add(data.len() as u64, Ordering::SeqCst);
            }
        }

        {
            let mut reservations = self.reservations.lock().await;
            for (offset, reservation) in new_reservations.into_iter().enumerate() {
                reservations.insert(first_block_index + offset as u32, reservation);
            }
        }

        self.flush_writable_prefix().await
    }

    /// Writes every contiguous `Received` slot at the front of the window
    /// to disk, batching up to `bytes_per_write` per write call (spec.md
    /// §4.3: "Writes to disk happen in order, batched up to
    /// `bytes_per_write`"), then advances `window_start`.
    async fn flush_writable_prefix(&self) -> Result<(), NodeError> {
        let writable = { self.window.lock().await.drain_writable_prefix() };
        if writable.is_empty() {
            return Ok(());
        }

        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or_else(|| {
            NodeError::Invariant(format!("session {} has no open writer", self.session_id))
        })?;

        let mut batch = Vec::new();
        let mut batch_bytes = 0usize;
        let mut written_indices = Vec::new();

        for (index, data) in writable {
            batch_bytes += data.len();
            batch.push(data);
            written_indices.push(index);
            if batch_bytes >= self.bytes_per_write {
                self.write_batch(writer, &mut batch, &mut batch_bytes).await?;
            }
        }
        if !batch.is_empty() {
            self.write_batch(writer, &mut batch, &mut batch_bytes).await?;
        }
        drop(writer_guard);

        {
            let mut window = self.window.lock().await;
            for index in &written_indices {
                window.mark_written(*index);
            }
            window.advance_past_written_prefix();
        }
        {
            let mut reservations = self.reservations.lock().await;
            for index in &written_indices {
                reservations.remove(index);
            }
        }
        Ok(())
    }

    /// Runs the actual disk write on the location's write invoker, so
    /// concurrent sessions writing to the same location are serialized on
    /// one lane rather than racing the OS's own file-descriptor scheduling
    /// (spec.md §5, "writes across sessions are serialized on the write
    /// invoker").
    async fn write_batch(&self, writer: &mut File, batch: &mut Vec<Arc<[u8]>>, batch_bytes: &mut usize) -> Result<(), NodeError> {
        let pending: Vec<Arc<[u8]>> = batch.drain(..).collect();
        self.location
            .get_write_invoker()
            .run(async {
                for data in &pending {
                    writer.write_all(data).await.map_err(|source| self.classify_io_error(source))?;
                }
                Ok::<(), NodeError>(())
            })
            .await?;
        *batch_bytes = 0;
        Ok(())
    }

    fn classify_io_error(&self, err: std::io::Error) -> NodeError {
        self.location.report_io_error(&err)
    }

    /// Completes once every block up to and including `index` has been
    /// written to the OS. Not fsynced — `sync_on_close` only fsyncs at
    /// `finish`, so this barrier guarantees OS-durable, not disk-durable.
    pub async fn flush_blocks(&self, index: u32) -> Result<(), NodeError> {
        self.flush_writable_prefix().await?;
        let window = self.window.lock().await;
        if !window.is_written(index) {
            return Err(NodeError::Invariant(format!(
                "flush_blocks({index}) requested before block was accepted"
            )));
        }
        Ok(())
    }

    /// Validates and finalizes: every slot below `window_start` must be
    /// Written, and (if given) `expected_block_count` must equal the
    /// highest accepted index plus one (spec.md §4.3, "Finalize").
    pub async fn finish(&self, expected_block_count: Option<u32>) -> Result<SessionFinishOutcome, NodeError> {
        self.flush_writable_prefix().await?;

        let window = self.window.lock().await;
        let highest = window.highest_accepted();
        let block_count = highest.map(|h| h + 1).unwrap_or(0);
        if let Some(expected) = expected_block_count {
            if block_count != expected {
                return Err(NodeError::Invariant(format!(
                    "expected {expected} blocks, session {} received {block_count}",
                    self.session_id
                )));
            }
        }
        if let Some(highest) = highest {
            if !window.all_written_below(highest + 1) {
                return Err(NodeError::Invariant(format!(
                    "session {} finished with un-written blocks below the highest index",
                    self.session_id
                )));
            }
        }
        drop(window);

        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard
            .as_mut()
            .ok_or_else(|| NodeError::Invariant(format!("session {} has no open writer", self.session_id)))?;

        if self.sync_on_close {
            writer.sync_all().await.map_err(|source| self.classify_io_error(source))?;
        }

        self.set_state(SessionState::Finishing).await;
        Ok(SessionFinishOutcome {
            data_size: self.received_bytes(),
            block_count,
        })
    }

    pub async fn cancel(&self) {
        self.lease.cancel();
        self.set_state(SessionState::Cancelled).await;
        let path = self.location.data_file_path(self.session_id.chunk_id);
        let _ = tokio::fs::remove_file(&path).await;
    }

    pub async fn mark_finished(&self) {
        self.set_state(SessionState::Finished).await;
    }

    pub fn block_id(&self, index: u32) -> BlockId {
        BlockId::new(self.session_id.chunk_id, index)
    }
}
