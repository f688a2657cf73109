//! Top-level data-node wiring: composes the location manager, chunk
//! registry, session manager, and block store into one [`node::DataNode`]
//! and binds it to the external RPC surface (`dn_types::rpc::NodeRpc`).
//!
//! Split into a library plus a thin `main.rs` the way `proxmox-backup`
//! exposes `proxmox_backup::*` for its `src/bin/*.rs` entrypoints, so the
//! wiring here is exercisable from integration tests without going through
//! a binary.

pub mod heartbeat;
pub mod node;
pub mod rpc;

pub use heartbeat::LoggingHeartbeatSink;
pub use node::DataNode;
