use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dn_datastore::{BlockCache, ChunkRegistry, Location, MemoryTracker, ThrottlerRegistry};
use dn_node::DataNode;
use dn_session::SessionManager;
use dn_types::config::{LocationConfig, SessionConfig};
use dn_types::error::NodeError;
use dn_types::heartbeat::NullHeartbeatSink;
use dn_types::rpc::{
    FinishChunkRequest, GetBlockRangeRequest, GetBlockSetRequest, GetChunkMetaRequest, NodeRpc,
    PutBlocksRequest, StartChunkRequest,
};
use dn_types::{ChunkId, MediumDescriptor, ObjectType, SessionId, SessionType, WorkloadDescriptor};

fn test_chunk_id(unique: u128) -> ChunkId {
    ChunkId::new(ObjectType::Blob, 1, unique)
}

async fn single_location_node() -> (DataNode, Location) {
    let mut dir = std::env::temp_dir();
    dir.push(format!("dn-node-scenario-{}", rand::random::<u64>()));
    let config = LocationConfig {
        root: dir,
        medium: MediumDescriptor::new("ssd_blobs", 0),
        quota: 10_000_000,
        low_watermark: 5_000_000,
        high_watermark: 1_000_000,
        disable_writes_watermark: 100_000,
        trash_cleanup_watermark: 50_000,
        data_read_concurrency: 4,
        meta_read_concurrency: 2,
    };
    let location = Location::open(0, config, "cell-a").await.unwrap();

    let mut locations = HashMap::new();
    locations.insert(location.id(), location.clone());

    let registry = ChunkRegistry::new(Arc::new(NullHeartbeatSink));
    let session_memory = MemoryTracker::new("session", 16 * 1024 * 1024);
    let pending_read_bytes = MemoryTracker::new("pending-read", 16 * 1024 * 1024);
    let cache = BlockCache::new(1024 * 1024);
    let session_config = SessionConfig {
        window_size: 4,
        bytes_per_write: 4096,
        lease_duration: Duration::from_secs(30),
    };
    let block_size = session_config.bytes_per_write as u64;

    let sessions = SessionManager::new(registry.clone(), locations.clone(), session_memory, session_config);
    let node = DataNode::new(
        "cell-a".to_string(),
        locations,
        registry,
        sessions,
        cache,
        pending_read_bytes,
        block_size,
        ThrottlerRegistry::unthrottled(),
    );
    (node, location)
}

// S1 — happy-path blob write/read: writes arrive out of the natural write
// order of full-then-partial batches, finish succeeds, and a subsequent
// range read returns byte-identical blocks plus the stored meta blob.
#[tokio::test]
async fn s1_happy_path_blob_write_and_read() {
    let (node, location) = single_location_node().await;
    let chunk_id = test_chunk_id(0xA1);
    let session_id = SessionId::new(chunk_id, 0);

    node.start_chunk(StartChunkRequest {
        session_id,
        session_type: SessionType::User,
        sync_on_close: true,
        medium_index: 0,
    })
    .await
    .unwrap();

    let b0: Arc<[u8]> = Arc::from(vec![0xAAu8; 4096]);
    let b1: Arc<[u8]> = Arc::from(vec![0xBBu8; 4096]);
    let b2: Arc<[u8]> = Arc::from(vec![0xCCu8; 100]);

    node.put_blocks(PutBlocksRequest {
        session_id,
        first_block_index: 0,
        blocks: vec![b0.clone(), b1.clone()],
        populate_cache: false,
        flush_after: false,
    })
    .await
    .unwrap();

    node.put_blocks(PutBlocksRequest {
        session_id,
        first_block_index: 2,
        blocks: vec![b2.clone()],
        populate_cache: false,
        flush_after: true,
    })
    .await
    .unwrap();

    let meta: Arc<[u8]> = Arc::from(b"blocks: 4096,4096,100".to_vec());
    let info = node
        .finish_chunk(FinishChunkRequest {
            session_id,
            chunk_meta: meta.clone(),
            expected_block_count: Some(3),
        })
        .await
        .unwrap();
    assert_eq!(info.disk_space, 4096 + 4096 + 100);

    let blocks = node
        .get_block_range(GetBlockRangeRequest {
            chunk_id,
            first_index: 0,
            count: 3,
            workload: WorkloadDescriptor::User,
        })
        .await
        .unwrap();
    assert_eq!(blocks.len(), 3);
    assert_eq!(blocks[0].data.as_ref(), b0.as_ref());
    assert_eq!(blocks[1].data.as_ref(), b1.as_ref());
    assert_eq!(blocks[2].data.as_ref(), b2.as_ref());

    let stored_meta = node
        .get_chunk_meta(GetChunkMetaRequest {
            chunk_id,
            extension_tags: vec![],
            partition_tag: None,
        })
        .await
        .unwrap();
    assert_eq!(stored_meta.as_ref(), meta.as_ref());

    std::fs::remove_dir_all(location.root()).ok();
}

// S5 — delete under read: a reader holding a chunk's read-lock completes
// successfully even if removal is requested mid-read; the files are only
// gone, and new reads start failing with ChunkUnavailable, once the lock
// is released (I2/I3).
#[tokio::test]
async fn s5_delete_under_read_defers_until_lock_release() {
    let (node, location) = single_location_node().await;
    let chunk_id = test_chunk_id(0xA2);
    let session_id = SessionId::new(chunk_id, 0);

    node.start_chunk(StartChunkRequest {
        session_id,
        session_type: SessionType::User,
        sync_on_close: true,
        medium_index: 0,
    })
    .await
    .unwrap();
    let payload: Arc<[u8]> = Arc::from(vec![0x11u8; 300]);
    node.put_blocks(PutBlocksRequest {
        session_id,
        first_block_index: 0,
        blocks: vec![payload.clone()],
        populate_cache: false,
        flush_after: false,
    })
    .await
    .unwrap();
    node.finish_chunk(FinishChunkRequest {
        session_id,
        chunk_meta: Arc::from(b"meta".to_vec()),
        expected_block_count: Some(1),
    })
    .await
    .unwrap();

    // take and hold a read lock directly on the registry, standing in for
    // a reader already past the lookup and suspended mid-fetch.
    let (_chunk, lock) = node.registry().read_lock(chunk_id).unwrap();

    node.registry().remove_chunk(chunk_id, &location).await.unwrap();

    // reader A's in-flight fetch, continuing on the lock it already holds,
    // still completes with the original bytes: the files are untouched
    // while the lock is outstanding.
    let on_disk = tokio::fs::read(location.data_file_path(chunk_id)).await.unwrap();
    assert_eq!(on_disk, payload.as_ref());

    // a brand new reader arriving after removal was requested correctly
    // sees the chunk as unavailable, distinct from it never having existed.
    let err = node
        .get_block_set(GetBlockSetRequest {
            chunk_id,
            block_indices: vec![0],
            populate_cache: false,
            workload: WorkloadDescriptor::User,
            peer_hint: None,
        })
        .await;
    assert!(matches!(err, Err(NodeError::ChunkUnavailable(_))));

    drop(lock);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // once the deferred deletion has run, the chunk is gone outright.
    let err = node
        .get_block_set(GetBlockSetRequest {
            chunk_id,
            block_indices: vec![0],
            populate_cache: false,
            workload: WorkloadDescriptor::User,
            peer_hint: None,
        })
        .await;
    assert!(matches!(err, Err(NodeError::NoSuchChunk(_))));
    assert!(!location.data_file_path(chunk_id).exists());

    std::fs::remove_dir_all(location.root()).ok();
}

// S7 — cache single-flight: ten concurrent readers of the same cold block
// collapse into one disk fetch and all observe identical bytes.
#[tokio::test]
async fn s7_concurrent_cold_reads_collapse_into_one_fetch() {
    let (node, location) = single_location_node().await;
    let chunk_id = test_chunk_id(0xA3);
    let session_id = SessionId::new(chunk_id, 0);

    node.start_chunk(StartChunkRequest {
        session_id,
        session_type: SessionType::User,
        sync_on_close: true,
        medium_index: 0,
    })
    .await
    .unwrap();
    let payload: Arc<[u8]> = Arc::from(vec![0x42u8; 4096]);
    node.put_blocks(PutBlocksRequest {
        session_id,
        first_block_index: 0,
        blocks: vec![payload.clone()],
        populate_cache: false,
        flush_after: false,
    })
    .await
    .unwrap();
    node.finish_chunk(FinishChunkRequest {
        session_id,
        chunk_meta: Arc::from(b"meta".to_vec()),
        expected_block_count: Some(1),
    })
    .await
    .unwrap();

    assert!(node.block_store().find_cached_block(dn_types::BlockId::new(chunk_id, 0)).is_none());

    let mut handles = Vec::new();
    for _ in 0..10 {
        let node = node.clone();
        handles.push(tokio::spawn(async move {
            node.get_block_set(GetBlockSetRequest {
                chunk_id,
                block_indices: vec![0],
                populate_cache: false,
                workload: WorkloadDescriptor::User,
                peer_hint: None,
            })
            .await
            .unwrap()
        }));
    }

    for handle in handles {
        let result = handle.await.unwrap();
        let block = result[0].as_ref().unwrap();
        assert_eq!(block.data.as_ref(), payload.as_ref());
    }

    assert_eq!(node.block_store().cache().len(), 1);

    std::fs::remove_dir_all(location.root()).ok();
}
