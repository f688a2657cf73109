pub mod block_store;
pub mod cache;
pub mod chunk;
pub mod invoker;
pub mod location;
pub mod memory_tracker;
pub mod registry;
pub mod throttle;

pub use block_store::{BlockStore, ReadKind};
pub use cache::{BlockCache, BlockFetcher};
pub use chunk::{Chunk, ChunkVariant, ReadLock};
pub use invoker::Invoker;
pub use location::{Fullness, Location};
pub use memory_tracker::{MemoryTracker, Reservation};
pub use registry::ChunkRegistry;
pub use throttle::{Throttler, ThrottlerRegistry};
