use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::medium::MediumDescriptor;

/// Configuration for one [`crate::error::LocationId`]'s watermark policy
/// (spec.md §4.1, "Watermarks"). Always `low < high < disable_writes`.
///
/// This and the other `*Config` structs in this module are plain
/// `serde`-derived structs, the same shape `pbs-api-types` uses for its API
/// structs (e.g. `GarbageCollectionStatus`) minus the `proxmox-schema`
/// `#[api]` macro, which only matters for auto-generating a REST schema —
/// out of scope here since this crate never loads or serves config itself
/// (spec.md §1, "configuration loading" is an explicit non-goal).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationConfig {
    pub root: PathBuf,
    pub medium: MediumDescriptor,
    pub quota: u64,
    pub low_watermark: u64,
    pub high_watermark: u64,
    pub disable_writes_watermark: u64,
    pub trash_cleanup_watermark: u64,
    /// Concurrency of the data-read lane.
    pub data_read_concurrency: usize,
    /// Concurrency of the meta-read lane.
    pub meta_read_concurrency: usize,
}

impl LocationConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.low_watermark < self.high_watermark
            && self.high_watermark < self.disable_writes_watermark)
        {
            return Err(format!(
                "watermarks must satisfy low < high < disable_writes, got {} < {} < {}",
                self.low_watermark, self.high_watermark, self.disable_writes_watermark
            ));
        }
        Ok(())
    }
}

/// Configuration of the block cache (spec.md §4.4, "Cache shape").
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Total weight capacity, in bytes of cached block data.
    pub capacity_bytes: u64,
}

/// Configuration for the write-session state machine (spec.md §4.3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SessionConfig {
    pub window_size: u32,
    pub bytes_per_write: usize,
    #[serde(with = "duration_secs")]
    pub lease_duration: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window_size: 16,
            bytes_per_write: 4 * 1024 * 1024,
            lease_duration: Duration::from_secs(30),
        }
    }
}

/// Token-bucket parameters for one named throttler (spec.md §5,
/// "Throttling"), grounded on `src/tools/shared_rate_limiter.rs`'s
/// `RateLimiter::new(rate, burst)` shape, simplified to single-process
/// in-memory accounting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThrottleConfig {
    pub rate_bytes_per_sec: u64,
    pub burst_bytes: u64,
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
