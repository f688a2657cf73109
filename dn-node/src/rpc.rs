use async_trait::async_trait;

use dn_datastore::ReadKind;
use dn_session::StartOptions;
use dn_types::error::NodeError;
use dn_types::rpc::{
    Block, ChunkInfo, ChunkProbeResult, FinishChunkRequest, FlushBlocksRequest, GetBlockRangeRequest,
    GetBlockSetRequest, GetChunkMetaRequest, NodeRpc, PingSessionRequest, ProbeChunkSetRequest, PutBlocksRequest,
    SendBlocksRequest, StartChunkRequest, UpdatePeerRequest,
};

use crate::node::DataNode;

/// Binds [`DataNode`]'s operations to the RPC surface of spec.md §6,
/// the way `proxmox-rest-server` binds `pbs-datastore` operations to
/// `api2/backup` handlers — except here the trait boundary itself is the
/// seam (no transport or framing lives in this crate).
#[async_trait]
impl NodeRpc for DataNode {
    async fn start_chunk(&self, req: StartChunkRequest) -> Result<(), NodeError> {
        self.sessions()
            .start(
                req.session_id,
                StartOptions {
                    session_type: req.session_type,
                    sync_on_close: req.sync_on_close,
                    medium_index: req.medium_index,
                },
            )
            .await
    }

    async fn finish_chunk(&self, req: FinishChunkRequest) -> Result<ChunkInfo, NodeError> {
        let chunk_id = self
            .sessions()
            .finish(req.session_id, req.chunk_meta, req.expected_block_count)
            .await?;
        let chunk = self
            .registry()
            .find_chunk(chunk_id)
            .ok_or(NodeError::NoSuchChunk(chunk_id))?;
        Ok(ChunkInfo {
            disk_space: chunk.data_size(),
            sealed: chunk.is_sealed(),
            meta_footprint: 0,
        })
    }

    async fn put_blocks(&self, req: PutBlocksRequest) -> Result<(), NodeError> {
        let chunk_id = req.session_id.chunk_id;
        let first_index = req.first_block_index;
        let block_count = req.blocks.len() as u32;

        if req.populate_cache {
            for (offset, data) in req.blocks.iter().enumerate() {
                let block_id = dn_types::BlockId::new(chunk_id, first_index + offset as u32);
                self.block_store().put_cached_block(block_id, data.clone());
            }
        }

        self.sessions().put_blocks(req.session_id, first_index, req.blocks).await?;

        if req.flush_after && block_count > 0 {
            self.sessions()
                .flush_blocks(req.session_id, first_index + block_count - 1)
                .await?;
        }
        Ok(())
    }

    async fn send_blocks(&self, req: SendBlocksRequest) -> Result<(), NodeError> {
        // The actual network hop to `req.target` is out of scope for this
        // core (spec.md §1): callers of this trait supply a real transport
        // at a higher layer. Here we only validate and enumerate the
        // block range that would be forwarded.
        self.sessions()
            .send_blocks(req.session_id, req.first_block_index, req.block_count, |_ids| async {
                Ok::<(), anyhow::Error>(())
            })
            .await
    }

    async fn flush_blocks(&self, req: FlushBlocksRequest) -> Result<(), NodeError> {
        self.sessions().flush_blocks(req.session_id, req.block_index).await
    }

    async fn ping_session(&self, req: PingSessionRequest) -> Result<(), NodeError> {
        self.sessions().ping(req.session_id).await
    }

    async fn get_block_set(&self, req: GetBlockSetRequest) -> Result<Vec<Option<Block>>, NodeError> {
        let blocks = self
            .block_store()
            .read_block_set(req.chunk_id, &req.block_indices, ReadKind::Data)
            .await?;
        let mut bytes_sent = 0u64;
        let out = req
            .block_indices
            .iter()
            .zip(blocks)
            .map(|(&index, data)| {
                data.map(|data| {
                    bytes_sent += data.len() as u64;
                    Block { block_id: dn_types::BlockId::new(req.chunk_id, index), data }
                })
            })
            .collect();
        self.delay_for_outbound(req.workload, bytes_sent).await;
        Ok(out)
    }

    async fn get_block_range(&self, req: GetBlockRangeRequest) -> Result<Vec<Block>, NodeError> {
        let blocks = self
            .block_store()
            .read_block_range(req.chunk_id, req.first_index, req.count, ReadKind::Data)
            .await?;
        let mut bytes_sent = 0u64;
        let out = blocks
            .into_iter()
            .enumerate()
            .map(|(offset, data)| {
                bytes_sent += data.len() as u64;
                Block { block_id: dn_types::BlockId::new(req.chunk_id, req.first_index + offset as u32), data }
            })
            .collect();
        self.delay_for_outbound(req.workload, bytes_sent).await;
        Ok(out)
    }

    async fn get_chunk_meta(&self, req: GetChunkMetaRequest) -> Result<std::sync::Arc<[u8]>, NodeError> {
        let chunk = self
            .registry()
            .find_chunk(req.chunk_id)
            .ok_or(NodeError::NoSuchChunk(req.chunk_id))?;
        let location = self
            .location(chunk.location())
            .ok_or_else(|| NodeError::Invariant(format!("chunk {} has no resolvable location", req.chunk_id)))?;
        let path = location.meta_file_path(req.chunk_id);
        let location_id = location.id();
        let data = location
            .get_meta_read_invoker()
            .run(async move {
                tokio::fs::read(&path)
                    .await
                    .map_err(|source| NodeError::IoError { location: location_id, source })
            })
            .await?;
        // The footer is stored as the opaque blob the client supplied at
        // FinishChunk; this core does not parse chunk content (spec.md
        // §1, Non-goals), so extension_tags/partition_tag filtering can't
        // happen here. Logged rather than silently dropped so a caller
        // relying on filtering notices it isn't applied.
        if !req.extension_tags.is_empty() || req.partition_tag.is_some() {
            log::debug!(
                "get_chunk_meta({}): filter by tags {:?} / partition {:?} not applied, returning whole footer",
                req.chunk_id, req.extension_tags, req.partition_tag
            );
        }
        Ok(std::sync::Arc::from(data))
    }

    async fn probe_chunk_set(&self, req: ProbeChunkSetRequest) -> Result<Vec<ChunkProbeResult>, NodeError> {
        let mut out = Vec::with_capacity(req.chunk_ids.len());
        for chunk_id in req.chunk_ids {
            let chunk = self.registry().find_chunk(chunk_id);
            let exists = chunk.is_some();
            let healthy = chunk
                .and_then(|c| self.location(c.location()))
                .map(|loc| loc.enabled() && !loc.sick())
                .unwrap_or(false);
            out.push(ChunkProbeResult { chunk_id, exists, healthy });
        }
        Ok(out)
    }

    async fn update_peer(&self, req: UpdatePeerRequest) -> Result<(), NodeError> {
        self.update_peer(req.peer, req.expiration, req.block_ids);
        Ok(())
    }
}
