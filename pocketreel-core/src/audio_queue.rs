//! # Audio Queue - Bounded Chunk Channel
//!
//! One producer (the demux loop) and one consumer (the audio thread).
//! Chunk buffers come from a pool sized at construction and are handed
//! back with `recycle`, so steady-state playback does not allocate.
//!
//! `AudioFeeder` sits on the producer side and owns the single pending
//! slot: a chunk the queue refused is parked there and retried before
//! anything else, which keeps audio lossless and in order.
//!
//! ```text
//! ┌────────┐  offer   ┌────────────┐  try_push  ┌────────────┐  pop  ┌───────┐
//! │ demux  │─────────►│ AudioFeeder│───────────►│ AudioQueue │──────►│ audio │
//! └────────┘          │ (pending)  │            │  (Q slots) │◄──────│ thread│
//!                     └────────────┘            └────────────┘recycle└───────┘
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

// ============================================================================
// Chunks
// ============================================================================

#[derive(Debug)]
pub struct AudioChunk {
    data: Vec<u8>,
    len: usize,
}

impl AudioChunk {
    fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; size],
            len: 0,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

/// Result of a consumer-side pop
#[derive(Debug)]
pub enum QueuePop {
    Chunk(AudioChunk),
    /// Nothing arrived within the timeout
    Empty,
    /// Producer signalled end of input and the queue is drained
    Finished,
    /// Session is shutting down
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pushed: u64,
    pub popped: u64,
    pub rejected: u64,
    pub allocated: u64,
}

// ============================================================================
// Audio Queue
// ============================================================================

struct QueueInner {
    chunks: VecDeque<AudioChunk>,
    pool: Vec<AudioChunk>,
    finished: bool,
    closed: bool,
}

pub struct AudioQueue {
    inner: Mutex<QueueInner>,
    ready: Condvar,
    space: Condvar,
    capacity: usize,
    chunk_size: usize,
    pushed: AtomicU64,
    popped: AtomicU64,
    rejected: AtomicU64,
    allocated: AtomicU64,
}

impl AudioQueue {
    pub fn new(capacity: usize, chunk_size: usize) -> Self {
        // One extra buffer is in flight with the consumer at any time
        let pool_size = capacity + 1;
        let pool = (0..pool_size).map(|_| AudioChunk::new(chunk_size)).collect();

        Self {
            inner: Mutex::new(QueueInner {
                chunks: VecDeque::with_capacity(capacity),
                pool,
                finished: false,
                closed: false,
            }),
            ready: Condvar::new(),
            space: Condvar::new(),
            capacity,
            chunk_size,
            pushed: AtomicU64::new(0),
            popped: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            allocated: AtomicU64::new(pool_size as u64),
        }
    }

    /// Copy a chunk in without blocking. False when full, closed,
    /// finished, or the chunk is larger than a pool buffer.
    pub fn try_push(&self, data: &[u8]) -> bool {
        if data.len() > self.chunk_size {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let mut inner = self.inner.lock();
        if inner.closed || inner.finished || inner.chunks.len() >= self.capacity {
            drop(inner);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let mut chunk = match inner.pool.pop() {
            Some(chunk) => chunk,
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                AudioChunk::new(self.chunk_size)
            }
        };
        chunk.data[..data.len()].copy_from_slice(data);
        chunk.len = data.len();
        inner.chunks.push_back(chunk);
        drop(inner);

        self.pushed.fetch_add(1, Ordering::Relaxed);
        self.ready.notify_one();
        true
    }

    /// Wait up to `timeout` for the next chunk.
    pub fn pop_timeout(&self, timeout: Duration) -> QueuePop {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return QueuePop::Closed;
            }
            if let Some(chunk) = inner.chunks.pop_front() {
                return self.popped(chunk);
            }
            if inner.finished {
                return QueuePop::Finished;
            }
            if self.ready.wait_for(&mut inner, timeout).timed_out() {
                if let Some(chunk) = inner.chunks.pop_front() {
                    return self.popped(chunk);
                }
                return if inner.closed {
                    QueuePop::Closed
                } else if inner.finished {
                    QueuePop::Finished
                } else {
                    QueuePop::Empty
                };
            }
        }
    }

    fn popped(&self, chunk: AudioChunk) -> QueuePop {
        self.popped.fetch_add(1, Ordering::Relaxed);
        self.space.notify_all();
        QueuePop::Chunk(chunk)
    }

    /// Wait up to `timeout` for a free slot. False if the queue is still
    /// full, or will never take another chunk.
    pub fn wait_for_space(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        if inner.chunks.len() >= self.capacity && !inner.closed && !inner.finished {
            self.space.wait_for(&mut inner, timeout);
        }
        !inner.closed && !inner.finished && inner.chunks.len() < self.capacity
    }

    /// Return a consumed chunk's buffer to the pool
    pub fn recycle(&self, mut chunk: AudioChunk) {
        chunk.len = 0;
        let mut inner = self.inner.lock();
        if inner.pool.len() <= self.capacity {
            inner.pool.push(chunk);
        }
    }

    /// No more chunks will be pushed; the consumer drains what is queued.
    pub fn finish(&self) {
        self.inner.lock().finished = true;
        self.ready.notify_all();
    }

    /// Stop immediately; queued chunks are discarded.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let drained: Vec<AudioChunk> = inner.chunks.drain(..).collect();
        inner.pool.extend(drained);
        drop(inner);
        self.ready.notify_all();
        self.space.notify_all();
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    pub fn len(&self) -> usize {
        self.inner.lock().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pushed: self.pushed.load(Ordering::Relaxed),
            popped: self.popped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            allocated: self.allocated.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Audio Feeder (pending slot)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioOffer {
    /// Went straight into the queue
    Queued,
    /// Queue was full; parked in the pending slot
    Deferred,
    /// A chunk is already pending; nothing was taken
    Blocked,
    /// Larger than any queue buffer; discarded
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeederStats {
    pub offered: u64,
    pub deferred: u64,
    pub retries: u64,
    pub dropped: u64,
}

pub struct AudioFeeder {
    queue: Arc<AudioQueue>,
    pending: Vec<u8>,
    pending_len: Option<usize>,
    stats: FeederStats,
}

impl AudioFeeder {
    pub fn new(queue: Arc<AudioQueue>) -> Self {
        let size = queue.chunk_size();
        Self {
            queue,
            pending: vec![0u8; size],
            pending_len: None,
            stats: FeederStats::default(),
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending_len.is_some()
    }

    /// Retry the pending chunk. True when the slot is (now) empty.
    pub fn retry_pending(&mut self) -> bool {
        let Some(len) = self.pending_len else {
            return true;
        };
        self.stats.retries += 1;
        if self.queue.try_push(&self.pending[..len]) {
            self.pending_len = None;
            true
        } else {
            false
        }
    }

    /// Hand a chunk to the queue. Callers stop pulling new audio while
    /// `has_pending()` holds, so `Blocked` never loses data.
    pub fn offer(&mut self, data: &[u8]) -> AudioOffer {
        if !self.retry_pending() {
            return AudioOffer::Blocked;
        }
        self.stats.offered += 1;

        if data.len() > self.pending.len() {
            self.stats.dropped += 1;
            tracing::warn!(
                "Audio chunk of {} bytes exceeds {} byte buffers, dropped",
                data.len(),
                self.pending.len()
            );
            return AudioOffer::Dropped;
        }

        if self.queue.try_push(data) {
            AudioOffer::Queued
        } else {
            self.pending[..data.len()].copy_from_slice(data);
            self.pending_len = Some(data.len());
            self.stats.deferred += 1;
            AudioOffer::Deferred
        }
    }

    /// Signal end of input once nothing is pending. False while a chunk
    /// still waits for space.
    pub fn finish(&mut self) -> bool {
        if !self.retry_pending() {
            return false;
        }
        self.queue.finish();
        true
    }

    pub fn queue(&self) -> &Arc<AudioQueue> {
        &self.queue
    }

    pub fn stats(&self) -> FeederStats {
        self.stats
    }
}

// ============================================================================
// Tests
// ============================================================================
