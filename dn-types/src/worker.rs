use anyhow::{bail, Error};

/// Local equivalent of `proxmox_sys::WorkerTaskContext`, the collaborator
/// `pbs-datastore::chunk_store::ChunkStore::sweep_unused_chunks` and
/// `datastore::garbage_collection` accept so long-running operations can
/// report progress and honor cooperative abort without depending on a
/// concrete job-tracking implementation.
///
/// Kept as a crate-local trait (rather than depending on `proxmox-sys` for
/// it) because this core must stay independent of whatever job-tracking
/// layer the embedding binary uses (spec.md §1, "RPC transport, CLI, ...
/// logging, tracing, metrics export" are explicit non-goals); any binary
/// wiring this crate up to a real worker-task system only needs to impl
/// this trait once.
pub trait WorkerContext: Send + Sync {
    /// Returns an error if the operation has been asked to abort.
    fn check_abort(&self) -> Result<(), Error>;

    /// Emit a progress line.
    fn log(&self, message: &str);
}

/// A [`WorkerContext`] that never aborts and logs through the `log` facade;
/// suitable for tests and for call sites with no external job tracker.
pub struct LoggingWorker;

impl WorkerContext for LoggingWorker {
    fn check_abort(&self) -> Result<(), Error> {
        Ok(())
    }

    fn log(&self, message: &str) {
        log::info!("{message}");
    }
}

/// A [`WorkerContext`] whose `check_abort` can be toggled, for tests of
/// cancellation behavior.
pub struct AbortableWorker {
    aborted: std::sync::atomic::AtomicBool,
}

impl AbortableWorker {
    pub fn new() -> Self {
        Self {
            aborted: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn abort(&self) {
        self.aborted.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Default for AbortableWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerContext for AbortableWorker {
    fn check_abort(&self) -> Result<(), Error> {
        if self.aborted.load(std::sync::atomic::Ordering::SeqCst) {
            bail!("aborted");
        }
        Ok(())
    }

    fn log(&self, message: &str) {
        log::debug!("{message}");
    }
}
