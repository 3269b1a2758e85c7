use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// A slot in the sequenced queue.
///
/// The sequence encodes the slot's state relative to the ticket that maps
/// to it: `seq == ticket` means writable, `seq == ticket + 1` means the
/// value is published, `seq == head + capacity` recycles the slot for the
/// next lap.
struct Slot<T> {
    sequence: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Multi-producer/single-consumer queue with per-slot sequence numbers.
///
/// Producers reserve a monotonic ticket, store the value, and publish by
/// bumping the slot sequence with a release write. The consumer requires
/// `seq == head + 1` before reading, then recycles the slot. Neither side
/// blocks; a failed sequence check means full (producer) or empty
/// (consumer). Used for small scalar payloads such as buffer ids.
pub struct SeqQueue<T> {
    tail: CachePadded<AtomicU64>,
    head: CachePadded<AtomicU64>,
    mask: u64,
    slots: Box<[Slot<T>]>,
}

unsafe impl<T: Send> Send for SeqQueue<T> {}
unsafe impl<T: Send> Sync for SeqQueue<T> {}

impl<T: Copy> SeqQueue<T> {
    /// Create a queue with the given capacity (must be a power of two).
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be a power of two");
        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            slots.push(Slot {
                sequence: AtomicU64::new(i as u64),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            });
        }
        SeqQueue {
            tail: CachePadded::new(AtomicU64::new(0)),
            head: CachePadded::new(AtomicU64::new(0)),
            mask: capacity as u64 - 1,
            slots: slots.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Try to enqueue. Returns false when the queue is full.
    pub fn try_enqueue(&self, value: T) -> bool {
        let mut ticket = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[(ticket & self.mask) as usize];
            let seq = slot.sequence.load(Ordering::Acquire);
            if seq == ticket {
                match self.tail.compare_exchange_weak(
                    ticket,
                    ticket.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe {
                            (*slot.value.get()).write(value);
                        }
                        slot.sequence
                            .store(ticket.wrapping_add(1), Ordering::Release);
                        return true;
                    }
                    Err(current) => ticket = current,
                }
            } else if seq < ticket {
                // The slot has not been recycled: a full lap behind.
                return false;
            } else {
                ticket = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Enqueue with spin backoff. For contexts that must not drop the
    /// value (buffer returns), where a full queue only means the consumer
    /// has not run its drain pass yet.
    pub fn enqueue(&self, value: T) {
        let mut spins = 0u32;
        while !self.try_enqueue(value) {
            spins += 1;
            if spins < 64 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Single consumer: dequeue the next value if one is published.
    pub fn try_dequeue(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let slot = &self.slots[(head & self.mask) as usize];
        let seq = slot.sequence.load(Ordering::Acquire);
        if seq != head.wrapping_add(1) {
            return None;
        }
        let value = unsafe { (*slot.value.get()).assume_init() };
        slot.sequence
            .store(head.wrapping_add(self.slots.len() as u64), Ordering::Release);
        self.head.store(head.wrapping_add(1), Ordering::Relaxed);
        Some(value)
    }
}

/// Multi-producer/single-consumer queue with a monotonic reserved tail.
///
/// Producers claim a unique slot by advancing `tail`, then publish the
/// descriptor with a non-zero encoding. The single consumer reads up to
/// its tail snapshot but stops at the first slot that is reserved and not
/// yet filled; that slot surfaces on the next drain pass. Faster than the
/// sequenced queue under low contention.
pub struct TailQueue {
    tail: CachePadded<AtomicU64>,
    head: CachePadded<AtomicU64>,
    mask: u64,
    /// `0` = empty, otherwise `descriptor + 1`.
    slots: Box<[AtomicU64]>,
}

impl TailQueue {
    /// Create a queue with the given capacity (must be a power of two).
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be a power of two");
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || AtomicU64::new(0));
        TailQueue {
            tail: CachePadded::new(AtomicU64::new(0)),
            head: CachePadded::new(AtomicU64::new(0)),
            mask: capacity as u64 - 1,
            slots: slots.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Try to enqueue a descriptor. Returns false when the queue is full.
    pub fn try_enqueue(&self, fd: RawFd) -> bool {
        loop {
            let ticket = self.tail.load(Ordering::Relaxed);
            let head = self.head.load(Ordering::Acquire);
            if ticket.wrapping_sub(head) >= self.slots.len() as u64 {
                return false;
            }
            if self
                .tail
                .compare_exchange_weak(
                    ticket,
                    ticket.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                self.slots[(ticket & self.mask) as usize]
                    .store(fd as u32 as u64 + 1, Ordering::Release);
                return true;
            }
        }
    }

    /// Enqueue with spin backoff; flush requests must not be dropped.
    pub fn enqueue(&self, fd: RawFd) {
        let mut spins = 0u32;
        while !self.try_enqueue(fd) {
            spins += 1;
            if spins < 64 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Single consumer: dequeue the next descriptor. Returns `None` when
    /// empty or when the next reserved slot has not been filled yet.
    pub fn try_dequeue(&self) -> Option<RawFd> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }
        let raw = self.slots[(head & self.mask) as usize].swap(0, Ordering::Acquire);
        if raw == 0 {
            // Reserved but not yet filled; resolved on the next pass.
            return None;
        }
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some((raw - 1) as u32 as RawFd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn seq_queue_fifo() {
        let q = SeqQueue::with_capacity(8);
        for i in 0..8u16 {
            assert!(q.try_enqueue(i));
        }
        assert!(!q.try_enqueue(99));
        for i in 0..8u16 {
            assert_eq!(q.try_dequeue(), Some(i));
        }
        assert_eq!(q.try_dequeue(), None);
    }

    #[test]
    fn seq_queue_recycles_slots() {
        let q = SeqQueue::with_capacity(2);
        for lap in 0..100u16 {
            assert!(q.try_enqueue(lap));
            assert_eq!(q.try_dequeue(), Some(lap));
        }
    }

    #[test]
    fn seq_queue_multi_producer() {
        let q = Arc::new(SeqQueue::with_capacity(1024));
        let mut handles = Vec::new();
        for p in 0..4u64 {
            let q = q.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..10_000u64 {
                    q.enqueue(p * 10_000 + i);
                }
            }));
        }

        let mut seen = vec![false; 40_000];
        let mut count = 0;
        while count < 40_000 {
            if let Some(v) = q.try_dequeue() {
                assert!(!seen[v as usize], "duplicate value {v}");
                seen[v as usize] = true;
                count += 1;
            }
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn tail_queue_fifo() {
        let q = TailQueue::with_capacity(8);
        for fd in 10..18 {
            assert!(q.try_enqueue(fd));
        }
        assert!(!q.try_enqueue(99));
        for fd in 10..18 {
            assert_eq!(q.try_dequeue(), Some(fd));
        }
        assert_eq!(q.try_dequeue(), None);
    }

    #[test]
    fn tail_queue_handles_fd_zero() {
        let q = TailQueue::with_capacity(4);
        assert!(q.try_enqueue(0));
        assert_eq!(q.try_dequeue(), Some(0));
    }

    #[test]
    fn tail_queue_multi_producer() {
        let q = Arc::new(TailQueue::with_capacity(256));
        let mut handles = Vec::new();
        for p in 0..4 {
            let q = q.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..5_000 {
                    q.enqueue(p * 5_000 + i);
                }
            }));
        }

        let mut seen = vec![false; 20_000];
        let mut count = 0;
        while count < 20_000 {
            if let Some(fd) = q.try_dequeue() {
                assert!(!seen[fd as usize]);
                seen[fd as usize] = true;
                count += 1;
            }
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
