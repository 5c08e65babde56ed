//! # Frame Ring - Bounded Compressed Video Buffer
//!
//! Fixed number of slots, each allocated once at the largest unit size
//! the session accepts. Units are copied in on `try_push` and read back
//! in push order; nothing allocates after construction.
//!
//! ```text
//!  demux ──try_push──► [ slot | slot | slot | ... ] ──pop──► decoder
//!                        ▲ write              ▲ read
//! ```

use std::collections::TryReserveError;

use serde::Serialize;

// ============================================================================
// Slots
// ============================================================================

#[derive(Debug)]
pub struct RingSlot {
    data: Vec<u8>,
    len: usize,
    frame_index: u64,
}

impl RingSlot {
    fn with_capacity(size: usize) -> Result<Self, TryReserveError> {
        let mut data = Vec::new();
        data.try_reserve_exact(size)?;
        data.resize(size, 0);
        Ok(Self {
            data,
            len: 0,
            frame_index: 0,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Ring statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RingStats {
    pub pushed: u64,
    pub popped: u64,
    pub dropped: u64,
    pub rejected_full: u64,
    pub rejected_oversized: u64,
    pub rejected_out_of_order: u64,
}

// ============================================================================
// Frame Ring
// ============================================================================

pub struct FrameRing {
    slots: Vec<RingSlot>,
    read: usize,
    write: usize,
    count: usize,
    max_unit_size: usize,
    last_pushed: Option<u64>,
    stats: RingStats,
}

impl FrameRing {
    pub fn new(capacity: usize, max_unit_size: usize) -> Result<Self, TryReserveError> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(capacity)?;
        for _ in 0..capacity {
            slots.push(RingSlot::with_capacity(max_unit_size)?);
        }

        Ok(Self {
            slots,
            read: 0,
            write: 0,
            count: 0,
            max_unit_size,
            last_pushed: None,
            stats: RingStats::default(),
        })
    }

    /// Copy a unit into the next free slot. False when the ring is full,
    /// the unit exceeds the slot size, or `frame_index` goes backwards.
    pub fn try_push(&mut self, data: &[u8], frame_index: u64) -> bool {
        if self.is_full() {
            self.stats.rejected_full += 1;
            return false;
        }
        if data.len() > self.max_unit_size {
            self.stats.rejected_oversized += 1;
            return false;
        }
        if matches!(self.last_pushed, Some(last) if frame_index < last) {
            self.stats.rejected_out_of_order += 1;
            return false;
        }

        let slot = &mut self.slots[self.write];
        slot.data[..data.len()].copy_from_slice(data);
        slot.len = data.len();
        slot.frame_index = frame_index;

        self.write = (self.write + 1) % self.slots.len();
        self.count += 1;
        self.last_pushed = Some(frame_index);
        self.stats.pushed += 1;
        true
    }

    /// Remove the oldest unit. The slot stays readable until the next push.
    pub fn pop(&mut self) -> Option<&RingSlot> {
        if self.count == 0 {
            return None;
        }
        let idx = self.read;
        self.read = (self.read + 1) % self.slots.len();
        self.count -= 1;
        self.stats.popped += 1;
        Some(&self.slots[idx])
    }

    pub fn front(&self) -> Option<&RingSlot> {
        if self.count == 0 {
            None
        } else {
            Some(&self.slots[self.read])
        }
    }

    /// Drop buffered units older than `expected`, always keeping the newest
    /// one. Returns the index of the last unit dropped.
    pub fn drop_stale(&mut self, expected: u64) -> Option<u64> {
        let mut last_dropped = None;
        while self.count > 1 {
            let index = self.slots[self.read].frame_index;
            if index >= expected {
                break;
            }
            self.read = (self.read + 1) % self.slots.len();
            self.count -= 1;
            self.stats.dropped += 1;
            last_dropped = Some(index);
        }
        last_dropped
    }

    pub fn clear(&mut self) {
        self.read = 0;
        self.write = 0;
        self.count = 0;
        self.last_pushed = None;
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.slots.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn max_unit_size(&self) -> usize {
        self.max_unit_size
    }

    pub fn stats(&self) -> RingStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_order() {
        let mut ring = FrameRing::new(4, 16).unwrap();
        assert!(ring.try_push(&[1, 2, 3], 0));
        assert!(ring.try_push(&[4], 1));
        assert!(ring.try_push(&[], 2));

        let slot = ring.pop().unwrap();
        assert_eq!(slot.data(), &[1, 2, 3]);
        assert_eq!(slot.frame_index(), 0);
        assert_eq!(ring.pop().unwrap().data(), &[4]);
        assert!(ring.pop().unwrap().is_empty());
        assert!(ring.pop().is_none());
    }

    #[test]
    fn test_bounded() {
        let mut ring = FrameRing::new(3, 8).unwrap();
        for i in 0..3 {
            assert!(ring.try_push(&[i as u8], i));
        }
        assert!(ring.is_full());
        assert!(!ring.try_push(&[9], 3));
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.stats().rejected_full, 1);

        // Wraps around after a pop
        ring.pop();
        assert!(ring.try_push(&[9], 3));
        let indices: Vec<u64> = std::iter::from_fn(|| ring.pop().map(|s| s.frame_index())).collect();
        assert_eq!(indices, vec![1, 2, 3]);
    }

    #[test]
    fn test_rejects_oversized_and_backwards() {
        let mut ring = FrameRing::new(4, 4).unwrap();
        assert!(!ring.try_push(&[0; 5], 0));
        assert!(ring.try_push(&[0; 4], 5));
        assert!(!ring.try_push(&[0; 1], 4));
        assert!(ring.try_push(&[0; 1], 5));

        let stats = ring.stats();
        assert_eq!(stats.rejected_oversized, 1);
        assert_eq!(stats.rejected_out_of_order, 1);
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn test_drop_stale_keeps_last() {
        let mut ring = FrameRing::new(8, 4).unwrap();
        for i in 10..15 {
            ring.try_push(&[0], i);
        }

        assert_eq!(ring.drop_stale(12), Some(11));
        assert_eq!(ring.front().unwrap().frame_index(), 12);

        // Everything is stale, but one unit always survives
        assert_eq!(ring.drop_stale(100), Some(13));
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.front().unwrap().frame_index(), 14);
        assert_eq!(ring.drop_stale(100), None);
        assert_eq!(ring.stats().dropped, 3);
    }
}
