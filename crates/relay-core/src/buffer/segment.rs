//! Segment memory pool (component A) and the [`Segment`] type itself.
//!
//! A segment is a fixed-capacity, exclusively-owned byte buffer: idle in
//! the pool's free list, filled by a [`crate::buffer::TxBuffer`], drained by
//! the transport send loop, then explicitly returned. There is no `Drop`
//! based auto-recycling on purpose — ownership is transferred by move at
//! every step (acquire/fill/drain/release), matching the explicit
//! `acquire()`/`release()` pair the component design calls for, and keeping
//! the "exclusive ownership, never aliased" invariant checkable by reading
//! call sites rather than trusting a destructor.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

/// A fixed-capacity byte buffer leased from a [`SegmentPool`].
#[derive(Debug)]
pub struct Segment {
    buf: BytesMut,
    capacity: usize,
}

impl Segment {
    fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Total usable capacity, fixed for the lifetime of the segment.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes committed so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Remaining writable space before the segment is full.
    pub fn remaining_mut(&self) -> usize {
        self.capacity.saturating_sub(self.buf.len())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Consumes the segment, handing its bytes to the transport send path.
    pub fn into_bytes_mut(self) -> BytesMut {
        self.buf
    }

    fn recycled(mut self) -> BytesMut {
        self.buf.clear();
        self.buf
    }
}

/// Snapshot of pool occupancy, useful for tests and diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub allocated: u64,
    pub idle: usize,
    pub outstanding: usize,
}

/// Fixed-capacity segment allocator with a free list. Thread-safe, no
/// shrinking, and capped by an optional high-water mark on how many idle
/// segments it will keep around (excess releases are simply dropped rather
/// than grown without bound).
#[derive(Clone)]
pub struct SegmentPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    segment_capacity: usize,
    max_idle: Option<usize>,
    free_list: Mutex<Vec<BytesMut>>,
    allocated: AtomicU64,
    outstanding: AtomicUsize,
}

impl SegmentPool {
    pub fn new(segment_capacity: usize) -> Self {
        Self::with_high_water_mark(segment_capacity, None)
    }

    pub fn with_high_water_mark(segment_capacity: usize, max_idle: Option<usize>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                segment_capacity,
                max_idle,
                free_list: Mutex::new(Vec::new()),
                allocated: AtomicU64::new(0),
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    pub fn segment_capacity(&self) -> usize {
        self.inner.segment_capacity
    }

    /// Leases a segment, reusing an idle one from the free list when
    /// available, otherwise allocating a fresh one at the pool's fixed
    /// capacity.
    pub fn acquire(&self) -> Segment {
        let reused = self.inner.free_list.lock().pop();
        let buf = match reused {
            Some(buf) => buf,
            None => {
                self.inner.allocated.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(self.inner.segment_capacity)
            }
        };
        self.inner.outstanding.fetch_add(1, Ordering::Relaxed);
        Segment {
            buf,
            capacity: self.inner.segment_capacity,
        }
    }

    /// Returns a segment to the free list. Dropped silently (not leaked,
    /// just not retained) once the high-water mark is reached.
    pub fn release(&self, segment: Segment) {
        self.inner.outstanding.fetch_sub(1, Ordering::Relaxed);
        let buf = segment.recycled();
        let mut list = self.inner.free_list.lock();
        let within_high_water_mark = match self.inner.max_idle {
            Some(max) => list.len() < max,
            None => true,
        };
        if within_high_water_mark {
            list.push(buf);
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.inner.allocated.load(Ordering::Relaxed),
            idle: self.inner.free_list.lock().len(),
            outstanding: self.inner.outstanding.load(Ordering::Relaxed),
        }
    }
}
