use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Partitions global node memory by category (spec.md §5, "Shared-resource
/// policy": "Global node memory is partitioned by category (block-cache,
/// session, pending-write, peer-list, ...); each category has a configured
/// soft cap").
///
/// A [`MemoryTracker`] is one category's accounting: a soft byte cap plus a
/// running total. `reserve` is the collaborator `put_blocks` consults
/// before admitting a Received slot's bytes (spec.md §4.3,
/// "Back-pressure"); denial is not an error by itself, callers turn it into
/// `NodeError::WriteThrottlingActive`.
#[derive(Clone)]
pub struct MemoryTracker {
    inner: Arc<Inner>,
}

struct Inner {
    name: &'static str,
    cap: u64,
    used: AtomicU64,
}

/// RAII handle for one reservation; releases automatically on drop so a
/// cancelled or errored session never leaks its accounted bytes.
pub struct Reservation {
    tracker: MemoryTracker,
    bytes: u64,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.tracker.release(self.bytes);
    }
}

impl MemoryTracker {
    pub fn new(name: &'static str, cap: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                cap,
                used: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn used(&self) -> u64 {
        self.inner.used.load(Ordering::SeqCst)
    }

    pub fn cap(&self) -> u64 {
        self.inner.cap
    }

    /// Attempt to reserve `bytes`; returns `None` if that would exceed the
    /// category's cap. On success, the returned [`Reservation`] must be
    /// held for as long as the bytes are actually outstanding.
    pub fn try_reserve(&self, bytes: u64) -> Option<Reservation> {
        let mut current = self.inner.used.load(Ordering::SeqCst);
        loop {
            let next = current.checked_add(bytes)?;
            if next > self.inner.cap {
                return None;
            }
            match self.inner.used.compare_exchange_weak(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Some(Reservation {
                        tracker: self.clone(),
                        bytes,
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }

    fn release(&self, bytes: u64) {
        self.inner.used.fetch_sub(bytes, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_releases_on_drop() {
        let tracker = MemoryTracker::new("session", 100);
        {
            let _r = tracker.try_reserve(60).expect("fits under cap");
            assert_eq!(tracker.used(), 60);
            assert!(tracker.try_reserve(60).is_none());
        }
        assert_eq!(tracker.used(), 0);
        assert!(tracker.try_reserve(100).is_some());
    }
}
