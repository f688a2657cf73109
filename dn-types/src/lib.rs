//! Shared vocabulary for the data-node storage core: chunk/block ids,
//! error kinds, config shapes, and the external RPC surface.
//!
//! Split out of `dn-datastore` the way `pbs-api-types` is split out of
//! `pbs-datastore` in the teacher repository: every other crate in this
//! workspace depends on this one, and this one depends on nothing in the
//! workspace.

pub mod chunk_id;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod medium;
pub mod rpc;
pub mod session_types;
pub mod workload;
pub mod worker;

pub use chunk_id::{BlockId, ChunkId, ObjectType};
pub use error::{LocationId, NodeError};
pub use medium::MediumDescriptor;
pub use session_types::{SessionId, SessionState, SessionType};
pub use workload::WorkloadDescriptor;
