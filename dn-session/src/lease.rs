use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// A session's renewal timer (spec.md §4.3, "Lease": "A session with no
/// `ping` within the lease interval is cancelled").
///
/// `expired()` is a pull-based check rather than a background timer task:
/// the session manager's reaper sweeps all leases periodically (see
/// `SessionManager::reap_expired`), matching the "FIFO work queue" / no
/// per-request-thread scheduling model of spec.md §5 rather than spawning
/// one timer per session.
pub struct Lease {
    duration: Duration,
    last_ping: Mutex<Instant>,
    cancelled: AtomicBool,
}

impl Lease {
    pub fn new(duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            duration,
            last_ping: Mutex::new(Instant::now()),
            cancelled: AtomicBool::new(false),
        })
    }

    pub async fn ping(&self) {
        *self.last_ping.lock().await = Instant::now();
    }

    pub async fn is_expired(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        self.last_ping.lock().await.elapsed() > self.duration
    }

    /// Voluntary cancellation (explicit `cancel` call, or node shutdown)
    /// is treated identically to lease expiry (spec.md §4.3, "Lease": "The
    /// lease is also cancelled on node shutdown").
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}
