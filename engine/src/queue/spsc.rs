use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// Bounded single-producer/single-consumer ring with power-of-two capacity.
///
/// Indices are unbounded u64 sequence numbers; the slot index is
/// `position & mask`. The producer publishes with a release store of
/// `tail`; the consumer takes an acquire snapshot of `tail` once per read
/// cycle and drains strictly below it, so it never chases a moving
/// producer.
///
/// `head` is written only by the consumer, `tail` only by the producer.
/// Sharing the ring between more than one producer or more than one
/// consumer is not safe.
pub struct SpscRing<T> {
    /// Consumer cursor.
    head: CachePadded<AtomicU64>,
    /// Producer cursor.
    tail: CachePadded<AtomicU64>,
    mask: u64,
    buf: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

unsafe impl<T: Send> Send for SpscRing<T> {}
unsafe impl<T: Send> Sync for SpscRing<T> {}

impl<T: Copy> SpscRing<T> {
    /// Create a ring with the given capacity (must be a power of two).
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be a power of two");
        let mut buf = Vec::with_capacity(capacity);
        buf.resize_with(capacity, || UnsafeCell::new(MaybeUninit::uninit()));
        SpscRing {
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            mask: capacity as u64 - 1,
            buf: buf.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Producer: enqueue one item. Fails when the ring is full; the
    /// caller treats that as a fatal per-connection condition.
    #[inline]
    pub fn try_enqueue(&self, item: T) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= self.buf.len() as u64 {
            return false;
        }
        unsafe {
            (*self.buf[(tail & self.mask) as usize].get()).write(item);
        }
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Consumer: capture the drain boundary for this read cycle.
    #[inline]
    pub fn snapshot_tail(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    /// Consumer: dequeue the next item strictly below `snapshot`.
    #[inline]
    pub fn try_dequeue_until(&self, snapshot: u64) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        if head >= snapshot {
            return None;
        }
        let item = unsafe { (*self.buf[(head & self.mask) as usize].get()).assume_init() };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(item)
    }

    /// Consumer cursor, for snapshot comparisons.
    #[inline]
    pub fn head(&self) -> u64 {
        self.head.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed) == self.tail.load(Ordering::Acquire)
    }

    /// Discard everything currently published. Only valid once the
    /// consumer side is quiesced (teardown / rebind).
    #[inline]
    pub fn clear(&self) {
        self.head
            .store(self.tail.load(Ordering::Acquire), Ordering::Release);
    }
}
