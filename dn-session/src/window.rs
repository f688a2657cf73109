use std::collections::BTreeMap;
use std::sync::Arc;

use dn_types::error::NodeError;

/// One block's position in the sliding window (spec.md §4.3, "Sliding-
/// window protocol").
#[derive(Debug, Clone)]
pub enum Slot {
    /// Expected, not yet received.
    Empty,
    /// Bytes held in memory, not yet written to disk.
    Received(Arc<[u8]>),
    /// Flushed to the OS (fsync, if any, happens at session close).
    Written,
}

/// The block-index window of one session: `[window_start, window_start +
/// window_size)`. Only a `BTreeMap` entry exists for indices that are not
/// `Empty`; an absent entry means `Empty`.
///
/// Enforces I5: "all blocks with index `< window_start` have been durably
/// written and their slots released; all blocks with index `>=
/// window_start + window_size` have not been accepted yet."
pub struct SlidingWindow {
    chunk_id: dn_types::ChunkId,
    window_start: u32,
    window_size: u32,
    slots: BTreeMap<u32, Slot>,
    highest_accepted: Option<u32>,
}

impl SlidingWindow {
    pub fn new(chunk_id: dn_types::ChunkId, window_size: u32) -> Self {
        Self {
            chunk_id,
            window_start: 0,
            window_size,
            slots: BTreeMap::new(),
            highest_accepted: None,
        }
    }

    pub fn window_start(&self) -> u32 {
        self.window_start
    }

    pub fn highest_accepted(&self) -> Option<u32> {
        self.highest_accepted
    }

    fn in_window(&self, index: u32) -> bool {
        index >= self.window_start && index < self.window_start + self.window_size
    }

    /// Accept (or idempotently re-accept) bytes at `index`. Fails with
    /// `WindowError` if out of range, or `BlockContentMismatch` if the
    /// slot already holds different bytes (spec.md §4.3, invariant I4 in
    /// §8: "replay idempotence").
    pub fn put(&mut self, session: &str, index: u32, data: Arc<[u8]>) -> Result<(), NodeError> {
        if !self.in_window(index) {
            return Err(NodeError::WindowError {
                session: session.to_string(),
                got: index,
                window_start: self.window_start,
                window_end: self.window_start + self.window_size,
            });
        }

        match self.slots.get(&index) {
            Some(Slot::Received(existing)) => {
                if existing.as_ref() == data.as_ref() {
                    return Ok(());
                }
                return Err(NodeError::BlockContentMismatch(dn_types::BlockId::new(
                    self.chunk_id,
                    index,
                )));
            }
            Some(Slot::Written) => return Ok(()), // already durable: silently idempotent
            _ => {}
        }

        self.slots.insert(index, Slot::Received(data));
        self.highest_accepted = Some(self.highest_accepted.map_or(index, |h| h.max(index)));
        Ok(())
    }

    /// Every contiguous run of `Received` slots starting at `window_start`,
    /// in order, ready to be written to disk.
    pub fn drain_writable_prefix(&self) -> Vec<(u32, Arc<[u8]>)> {
        let mut out = Vec::new();
        let mut index = self.window_start;
        loop {
            match self.slots.get(&index) {
                Some(Slot::Received(data)) => {
                    out.push((index, data.clone()));
                    index += 1;
                }
                _ => break,
            }
        }
        out
    }

    /// Mark `index` as durably written. Does not itself advance
    /// `window_start` — callers use [`Self::advance_past_written_prefix`]
    /// after marking a contiguous run.
    pub fn mark_written(&mut self, index: u32) {
        self.slots.insert(index, Slot::Written);
    }

    /// Advance `window_start` past every contiguous `Written` slot,
    /// releasing their memory (I5: freeing slots below the new
    /// `window_start`).
    pub fn advance_past_written_prefix(&mut self) {
        while let Some(Slot::Written) = self.slots.get(&self.window_start) {
            self.slots.remove(&self.window_start);
            self.window_start += 1;
        }
    }

    pub fn is_written(&self, index: u32) -> bool {
        matches!(self.slots.get(&index), Some(Slot::Written)) || index < self.window_start
    }

    /// True once every slot below `window_start` is accounted for and no
    /// slot up to and including `last_index` remains un-Written: used by
    /// `finish` to validate "every slot `< window_start` is Written"
    /// (spec.md §4.3, "Finalize").
    pub fn all_written_below(&self, bound: u32) -> bool {
        self.window_start >= bound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_id() -> dn_types::ChunkId {
        dn_types::ChunkId::new(dn_types::ObjectType::Blob, 1, 42)
    }

    #[test]
    fn out_of_window_put_is_rejected() {
        let mut window = SlidingWindow::new(test_id(), 4);
        let err = window.put("s", 10, Arc::from(vec![1u8]));
        assert!(matches!(err, Err(NodeError::WindowError { .. })));
    }

    #[test]
    fn replaying_identical_bytes_is_idempotent() {
        let mut window = SlidingWindow::new(test_id(), 4);
        let data: Arc<[u8]> = Arc::from(vec![1, 2, 3]);
        window.put("s", 0, data.clone()).unwrap();
        window.put("s", 0, data).unwrap();
    }

    #[test]
    fn replaying_different_bytes_is_rejected() {
        let mut window = SlidingWindow::new(test_id(), 4);
        window.put("s", 0, Arc::from(vec![1, 2, 3])).unwrap();
        let err = window.put("s", 0, Arc::from(vec![9, 9, 9]));
        assert!(matches!(err, Err(NodeError::BlockContentMismatch(_))));
    }

    #[test]
    fn window_advances_past_contiguous_written_prefix_only() {
        let mut window = SlidingWindow::new(test_id(), 4);
        window.put("s", 0, Arc::from(vec![0u8])).unwrap();
        window.put("s", 1, Arc::from(vec![1u8])).unwrap();
        window.put("s", 3, Arc::from(vec![3u8])).unwrap(); // gap at 2

        let writable = window.drain_writable_prefix();
        assert_eq!(writable.len(), 2); // only 0, 1 are contiguous

        window.mark_written(0);
        window.mark_written(1);
        window.advance_past_written_prefix();
        assert_eq!(window.window_start(), 2);

        // index 3 is still Received, not Written, and 2 is still Empty
        assert!(!window.is_written(3));
    }
}
