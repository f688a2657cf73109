use crate::chunk_id::{BlockId, ChunkId};

/// Opaque handle for a location, stable for the process lifetime.
pub type LocationId = u32;

/// The error kinds catalogued in the design (errors, not names): every
/// public operation of the core returns `Result<T, NodeError>`.
///
/// Grounded on `pbs-tape::tape_read::BlockReadError`'s style of one
/// `thiserror` enum per subsystem with short `#[error]` messages; here the
/// whole core shares one enum because the four subsystems are one coherent
/// design (spec.md §1) and errors cross between them constantly (a session
/// error can come from the location it writes to, a read error from the
/// registry it locks against).
#[derive(thiserror::Error, Debug)]
pub enum NodeError {
    #[error("no such session {0}")]
    NoSuchSession(String),

    #[error("session {0} already exists")]
    SessionAlreadyExists(String),

    #[error("chunk {0} already exists")]
    ChunkAlreadyExists(ChunkId),

    #[error("no such chunk {0}")]
    NoSuchChunk(ChunkId),

    #[error("no such block {0}")]
    NoSuchBlock(BlockId),

    #[error("block index {got} out of window [{window_start}, {window_end}) for session {session}")]
    WindowError {
        session: String,
        got: u32,
        window_start: u32,
        window_end: u32,
    },

    #[error("replayed block {0} does not match previously received content")]
    BlockContentMismatch(BlockId),

    #[error("write throttling active on location {0}")]
    WriteThrottlingActive(LocationId),

    #[error("read throttling active on location {0}")]
    ReadThrottlingActive(LocationId),

    #[error("no writable location available for medium {0}")]
    NoLocationAvailable(String),

    #[error("no space left on device (location {0})")]
    NoSpaceLeftOnDevice(LocationId),

    #[error("invalid checksum for chunk {0}")]
    InvalidBlockChecksum(ChunkId),

    #[error("I/O error on location {location}: {source}")]
    IoError {
        location: LocationId,
        #[source]
        source: std::io::Error,
    },

    #[error("pipeline write to {target} failed: {source}")]
    PipelineFailed {
        target: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("chunk {0} is unavailable (scheduled for removal or unknown)")]
    ChunkUnavailable(ChunkId),

    #[error("journal chunk {0} is already sealed")]
    JournalSealed(ChunkId),

    #[error("operation cancelled")]
    Cancelled,

    #[error("session lease expired for {0}")]
    LeaseExpired(String),

    #[error("{0}")]
    Invariant(String),
}

impl NodeError {
    /// Distinguishes transient, retriable conditions from fatal ones, so
    /// that an RPC-layer retry policy (out of scope for this crate, see
    /// spec.md §7) has something stable to dispatch on.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            NodeError::WriteThrottlingActive(_)
                | NodeError::ReadThrottlingActive(_)
                | NodeError::Cancelled
        )
    }

    /// True for errors that mean the *location* itself is unhealthy, as
    /// opposed to one session or one chunk.
    pub fn is_location_fatal(&self) -> bool {
        matches!(self, NodeError::IoError { .. })
    }
}
