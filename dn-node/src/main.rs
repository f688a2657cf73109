use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Error};

use dn_datastore::{BlockCache, ChunkRegistry, Location, MemoryTracker, ThrottlerRegistry};
use dn_node::{DataNode, LoggingHeartbeatSink};
use dn_session::SessionManager;
use dn_types::config::{LocationConfig, SessionConfig, ThrottleConfig};
use dn_types::worker::LoggingWorker;
use dn_types::{MediumDescriptor, WorkloadDescriptor};

/// Reads location directories from `DN_LOCATIONS` (colon-separated paths)
/// and the cell guid from `DN_CELL_GUID`, falling back to a single
/// `./dn-data` location and a generated guid for local experimentation.
/// Real configuration loading (file formats, validation, reload) is out
/// of scope for this core (spec.md §1); a production deployment replaces
/// this with its own config layer feeding the same [`LocationConfig`]s.
fn load_location_configs() -> Vec<LocationConfig> {
    let roots: Vec<String> = std::env::var("DN_LOCATIONS")
        .unwrap_or_else(|_| "./dn-data".to_string())
        .split(':')
        .map(str::to_string)
        .collect();

    roots
        .into_iter()
        .enumerate()
        .map(|(index, root)| LocationConfig {
            root: root.into(),
            medium: MediumDescriptor::new("default", index as u32),
            quota: 100 * 1024 * 1024 * 1024,
            low_watermark: 10 * 1024 * 1024 * 1024,
            high_watermark: 5 * 1024 * 1024 * 1024,
            disable_writes_watermark: 1024 * 1024 * 1024,
            trash_cleanup_watermark: 512 * 1024 * 1024,
            data_read_concurrency: 16,
            meta_read_concurrency: 4,
        })
        .collect()
}

/// Per-workload outbound-read budgets; a production deployment would load
/// these from the same config layer as [`load_location_configs`] (spec.md
/// §5, "Throttling").
fn default_read_throttlers() -> ThrottlerRegistry {
    let mut configs = HashMap::new();
    configs.insert(
        WorkloadDescriptor::User.throttler_name(),
        ThrottleConfig { rate_bytes_per_sec: 200 * 1024 * 1024, burst_bytes: 64 * 1024 * 1024 },
    );
    configs.insert(
        WorkloadDescriptor::Replication.throttler_name(),
        ThrottleConfig { rate_bytes_per_sec: 50 * 1024 * 1024, burst_bytes: 16 * 1024 * 1024 },
    );
    configs.insert(
        WorkloadDescriptor::Repair.throttler_name(),
        ThrottleConfig { rate_bytes_per_sec: 20 * 1024 * 1024, burst_bytes: 8 * 1024 * 1024 },
    );
    ThrottlerRegistry::new(configs)
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();

    let cell_guid = std::env::var("DN_CELL_GUID").unwrap_or_else(|_| "dev-cell".to_string());
    let configs = load_location_configs();
    let worker = LoggingWorker;

    let mut locations = HashMap::new();
    for (id, config) in configs.into_iter().enumerate() {
        let location = Location::open(id as u32, config, &cell_guid)
            .await
            .with_context(|| format!("opening location {id}"))?;
        for descriptor in location.scan(&worker).await? {
            log::info!(
                "recovered chunk {} ({} bytes) on location {}",
                descriptor.chunk_id,
                descriptor.data_size,
                id
            );
        }
        locations.insert(id as u32, location);
    }

    let heartbeat = Arc::new(LoggingHeartbeatSink);
    let registry = ChunkRegistry::new(heartbeat.clone());
    let session_memory = MemoryTracker::new("session", 1024 * 1024 * 1024);
    let pending_read_bytes = MemoryTracker::new("pending-read", 256 * 1024 * 1024);
    let cache = BlockCache::new(512 * 1024 * 1024);
    let session_config = SessionConfig::default();
    let block_size = session_config.bytes_per_write as u64;

    let sessions = SessionManager::new(registry.clone(), locations.clone(), session_memory, session_config);

    let node = DataNode::new(
        cell_guid,
        locations,
        registry,
        sessions,
        cache,
        pending_read_bytes,
        block_size,
        default_read_throttlers(),
    );

    log::info!("data node up with {} location(s)", node.locations().len());

    let mut tick = tokio::time::interval(std::time::Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = tick.tick() => {
                node.run_maintenance_tick(heartbeat.as_ref(), &worker).await;
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("shutdown requested");
                break;
            }
        }
    }

    Ok(())
}
