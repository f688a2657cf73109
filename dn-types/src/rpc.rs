use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::chunk_id::{BlockId, ChunkId};
use crate::error::NodeError;
use crate::session_types::{SessionId, SessionType};
use crate::workload::WorkloadDescriptor;

/// Another data node known to hold a particular block (GLOSSARY "Peer").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub node_id: String,
    pub address: String,
}

/// One block's bytes plus whatever came back with it.
#[derive(Debug, Clone)]
pub struct Block {
    pub block_id: BlockId,
    pub data: Arc<[u8]>,
}

/// Disk-space / sealed-flag / metadata-footprint summary returned for a
/// finalized chunk (spec.md §3, Chunk `info` field).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct ChunkInfo {
    pub disk_space: u64,
    pub sealed: bool,
    pub meta_footprint: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartChunkRequest {
    pub session_id: SessionId,
    pub session_type: SessionType,
    pub sync_on_close: bool,
    pub medium_index: u32,
}

#[derive(Debug, Clone)]
pub struct FinishChunkRequest {
    pub session_id: SessionId,
    pub chunk_meta: Arc<[u8]>,
    pub expected_block_count: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct PutBlocksRequest {
    pub session_id: SessionId,
    pub first_block_index: u32,
    pub blocks: Vec<Arc<[u8]>>,
    pub populate_cache: bool,
    pub flush_after: bool,
}

#[derive(Debug, Clone)]
pub struct SendBlocksRequest {
    pub session_id: SessionId,
    pub first_block_index: u32,
    pub block_count: u32,
    pub target: PeerDescriptor,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FlushBlocksRequest {
    pub session_id: SessionId,
    pub block_index: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PingSessionRequest {
    pub session_id: SessionId,
}

#[derive(Debug, Clone)]
pub struct GetBlockSetRequest {
    pub chunk_id: ChunkId,
    pub block_indices: Vec<u32>,
    pub populate_cache: bool,
    pub workload: WorkloadDescriptor,
    pub peer_hint: Option<PeerDescriptor>,
}

#[derive(Debug, Clone, Copy)]
pub struct GetBlockRangeRequest {
    pub chunk_id: ChunkId,
    pub first_index: u32,
    pub count: u32,
    pub workload: WorkloadDescriptor,
}

#[derive(Debug, Clone)]
pub struct GetChunkMetaRequest {
    pub chunk_id: ChunkId,
    pub extension_tags: Vec<String>,
    pub partition_tag: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProbeChunkSetRequest {
    pub chunk_ids: Vec<ChunkId>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChunkProbeResult {
    pub chunk_id: ChunkId,
    pub exists: bool,
    pub healthy: bool,
}

#[derive(Debug, Clone)]
pub struct UpdatePeerRequest {
    pub peer: PeerDescriptor,
    pub expiration: SystemTime,
    pub block_ids: Vec<BlockId>,
}

/// The external RPC surface of spec.md §6, expressed as a plain async
/// trait rather than a wire protocol: transport, framing, and
/// (de)serialization are out of scope for this core (spec.md §1). A real
/// server binds each of these methods to an HTTP/2 or gRPC handler the way
/// `proxmox-rest-server` binds `pbs-datastore` operations to `api2/backup`
/// handlers, without this crate knowing about hyper, h2, or tonic.
#[async_trait]
pub trait NodeRpc: Send + Sync {
    async fn start_chunk(&self, req: StartChunkRequest) -> Result<(), NodeError>;
    async fn finish_chunk(&self, req: FinishChunkRequest) -> Result<ChunkInfo, NodeError>;
    async fn put_blocks(&self, req: PutBlocksRequest) -> Result<(), NodeError>;
    async fn send_blocks(&self, req: SendBlocksRequest) -> Result<(), NodeError>;
    async fn flush_blocks(&self, req: FlushBlocksRequest) -> Result<(), NodeError>;
    async fn ping_session(&self, req: PingSessionRequest) -> Result<(), NodeError>;
    async fn get_block_set(&self, req: GetBlockSetRequest) -> Result<Vec<Option<Block>>, NodeError>;
    async fn get_block_range(&self, req: GetBlockRangeRequest) -> Result<Vec<Block>, NodeError>;
    async fn get_chunk_meta(&self, req: GetChunkMetaRequest) -> Result<Arc<[u8]>, NodeError>;
    async fn probe_chunk_set(&self, req: ProbeChunkSetRequest) -> Result<Vec<ChunkProbeResult>, NodeError>;
    async fn update_peer(&self, req: UpdatePeerRequest) -> Result<(), NodeError>;
}
