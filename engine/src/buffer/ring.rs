use std::alloc::{self, Layout};
use std::io;
use std::sync::atomic::{AtomicU16, Ordering};

use io_uring::types;

/// Registration flag asking the kernel to consume buffers incrementally
/// (`IOU_PBUF_RING_INC`, kernel 6.12+).
pub const PBUF_RING_INC: u16 = 2;

/// CQE flag set while the kernel still owns part of the buffer
/// (`IORING_CQE_F_BUF_MORE`). Only produced in incremental mode.
pub const CQE_F_BUF_MORE: u32 = 1 << 4;

/// Per-buffer bookkeeping for incremental consumption.
///
/// Lives entirely on the reactor thread: returns arrive through the MPSC
/// return queue and are applied sequentially, so no atomics are needed.
#[derive(Clone, Copy, Default)]
struct BufState {
    /// Where the next received byte of this buffer will land.
    offset: u32,
    /// Outstanding ring items referencing this buffer.
    refcount: u16,
    /// The terminating kernel completion has been observed.
    kernel_done: bool,
}

/// Provided buffer ring: one 64-byte-aligned allocation holding the
/// kernel-visible `BufRingEntry` descriptors followed by
/// `entries x buffer_size` bytes of chunk storage. `buffer_id` indexes a
/// chunk at `slab + buffer_id * buffer_size`.
///
/// Re-adds are deferred: each recycled id advances a local tail, and a
/// single [`commit`](BufferRing::commit) per reactor iteration publishes
/// the batch with one release store.
pub struct BufferRing {
    memory: *mut u8,
    layout: Layout,
    entries: u16,
    mask: u16,
    buffer_size: u32,
    /// Kernel-visible tail, located in the reserved field of entry 0.
    tail: *const AtomicU16,
    /// Local tail; masked by `entries - 1` on every re-add. The wrap is
    /// safe because the ring is power-of-two sized.
    local_tail: u16,
    incremental: bool,
    states: Box<[BufState]>,
}

// The raw pointers reference memory owned by this struct; ownership moves
// with it. One reactor thread is the only mutator.
unsafe impl Send for BufferRing {}

impl BufferRing {
    /// Allocate the slab and seed every buffer into the ring.
    pub fn new(entries: u16, buffer_size: u32, incremental: bool) -> io::Result<Self> {
        assert!(entries.is_power_of_two(), "entries must be a power of two");

        // Entry area rounded up so the data slab stays 64-byte aligned.
        let ring_bytes =
            (entries as usize * std::mem::size_of::<types::BufRingEntry>()).next_multiple_of(64);
        let data_bytes = entries as usize * buffer_size as usize;
        let layout = Layout::from_size_align(ring_bytes + data_bytes, 4096)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid slab layout"))?;

        let memory = unsafe { alloc::alloc_zeroed(layout) };
        if memory.is_null() {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "slab allocation failed"));
        }

        let tail = unsafe {
            types::BufRingEntry::tail(memory as *const types::BufRingEntry) as *const AtomicU16
        };

        let mut ring = BufferRing {
            memory,
            layout,
            entries,
            mask: entries - 1,
            buffer_size,
            tail,
            local_tail: 0,
            incremental,
            states: vec![BufState::default(); entries as usize].into_boxed_slice(),
        };

        for bid in 0..entries {
            ring.push_entry(bid);
        }
        ring.commit();

        Ok(ring)
    }

    /// Base address of the kernel-visible entry ring, for registration.
    #[inline]
    pub fn ring_addr(&self) -> u64 {
        self.memory as u64
    }

    #[inline]
    pub fn entries(&self) -> u16 {
        self.entries
    }

    #[inline]
    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    /// Registration flags for `register_buf_ring_with_flags`.
    #[inline]
    pub fn registration_flags(&self) -> u16 {
        if self.incremental { PBUF_RING_INC } else { 0 }
    }

    #[inline]
    fn slab_base(&self) -> *mut u8 {
        let ring_bytes =
            (self.entries as usize * std::mem::size_of::<types::BufRingEntry>()).next_multiple_of(64);
        unsafe { self.memory.add(ring_bytes) }
    }

    /// Pointer to the start of the chunk for `bid`.
    #[inline]
    pub fn chunk_ptr(&self, bid: u16) -> *mut u8 {
        debug_assert!(bid < self.entries);
        unsafe { self.slab_base().add(bid as usize * self.buffer_size as usize) }
    }

    /// Record a receive completion landing in `bid` and return the
    /// pointer where those bytes start.
    ///
    /// In incremental mode the kernel may deliver several receives into
    /// the same buffer at increasing offsets; each one takes a reference
    /// and advances the offset, and `kernel_done` latches once the
    /// terminating completion (no BUF_MORE flag) is seen.
    pub fn on_recv(&mut self, bid: u16, len: u32, kernel_done: bool) -> *mut u8 {
        if !self.incremental {
            return self.chunk_ptr(bid);
        }
        let chunk = self.chunk_ptr(bid);
        let state = &mut self.states[bid as usize];
        let ptr = unsafe { chunk.add(state.offset as usize) };
        state.offset += len;
        state.refcount += 1;
        if kernel_done {
            state.kernel_done = true;
        }
        ptr
    }

    /// Apply one user return of `bid`. Re-adds the buffer (deferred, see
    /// [`commit`](BufferRing::commit)) when it is no longer referenced:
    /// immediately in whole-buffer mode, or once
    /// `refcount == 0 && kernel_done` in incremental mode. Returns true
    /// when the buffer went back to the ring.
    pub fn on_return(&mut self, bid: u16) -> bool {
        if !self.incremental {
            self.push_entry(bid);
            return true;
        }
        let state = &mut self.states[bid as usize];
        debug_assert!(state.refcount > 0, "return of unreferenced buffer {bid}");
        state.refcount = state.refcount.saturating_sub(1);
        if state.refcount == 0 && state.kernel_done {
            state.offset = 0;
            state.kernel_done = false;
            self.push_entry(bid);
            return true;
        }
        false
    }

    /// Recycle a buffer attached to a completion that never reached a
    /// handler (teardown races, error results). Returns true when the
    /// buffer went back to the ring.
    pub fn discard(&mut self, bid: u16, kernel_done: bool) -> bool {
        if !self.incremental {
            self.push_entry(bid);
            return true;
        }
        let state = &mut self.states[bid as usize];
        if kernel_done {
            state.kernel_done = true;
        }
        if state.refcount == 0 && state.kernel_done {
            state.offset = 0;
            state.kernel_done = false;
            self.push_entry(bid);
            return true;
        }
        false
    }

    /// Write the entry for `bid` at the local tail. Not visible to the
    /// kernel until `commit`.
    fn push_entry(&mut self, bid: u16) {
        let idx = (self.local_tail & self.mask) as usize;
        let entry = unsafe { &mut *(self.memory as *mut types::BufRingEntry).add(idx) };
        entry.set_addr(self.chunk_ptr(bid) as u64);
        entry.set_len(self.buffer_size);
        entry.set_bid(bid);
        self.local_tail = self.local_tail.wrapping_add(1);
    }

    /// Publish all deferred re-adds with one release store of the tail.
    #[inline]
    pub fn commit(&self) {
        unsafe {
            (*self.tail).store(self.local_tail, Ordering::Release);
        }
    }
}

impl Drop for BufferRing {
    fn drop(&mut self) {
        unsafe {
            alloc::dealloc(self.memory, self.layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_tail(ring: &BufferRing) -> u16 {
        unsafe { (*ring.tail).load(Ordering::Acquire) }
    }

    #[test]
    fn seeds_every_buffer() {
        let ring = BufferRing::new(8, 1024, false).unwrap();
        assert_eq!(read_tail(&ring), 8);
    }

    #[test]
    fn chunks_are_disjoint_and_aligned() {
        let ring = BufferRing::new(8, 1024, false).unwrap();
        let base = ring.chunk_ptr(0) as usize;
        assert_eq!(base % 64, 0);
        for bid in 0..8u16 {
            assert_eq!(ring.chunk_ptr(bid) as usize, base + bid as usize * 1024);
        }
    }

    #[test]
    fn whole_buffer_return_republishes() {
        let mut ring = BufferRing::new(4, 512, false).unwrap();
        let before = read_tail(&ring);
        ring.on_return(2);
        // Deferred until commit.
        assert_eq!(read_tail(&ring), before);
        ring.commit();
        assert_eq!(read_tail(&ring), before.wrapping_add(1));
    }

    #[test]
    fn incremental_republish_requires_zero_refs_and_kernel_done() {
        let mut ring = BufferRing::new(4, 512, true).unwrap();
        let before = read_tail(&ring);

        // Two receives share buffer 1; the second is terminal.
        let p0 = ring.on_recv(1, 100, false);
        let p1 = ring.on_recv(1, 50, true);
        assert_eq!(p1 as usize, p0 as usize + 100);

        ring.on_return(1);
        ring.commit();
        assert_eq!(read_tail(&ring), before, "one reference still outstanding");

        ring.on_return(1);
        ring.commit();
        assert_eq!(read_tail(&ring), before.wrapping_add(1));

        // State reset: the next receive starts at offset zero.
        let p2 = ring.on_recv(1, 10, true);
        assert_eq!(p2 as usize, p0 as usize);
    }

    #[test]
    fn incremental_holds_until_kernel_done() {
        let mut ring = BufferRing::new(4, 512, true).unwrap();
        let before = read_tail(&ring);

        ring.on_recv(0, 64, false);
        ring.on_return(0);
        ring.commit();
        assert_eq!(read_tail(&ring), before, "kernel still owns the buffer");

        // Terminal completion arrives with no data consumer (teardown race).
        ring.discard(0, true);
        ring.commit();
        assert_eq!(read_tail(&ring), before.wrapping_add(1));
    }

    #[test]
    fn local_tail_wraps_safely() {
        let mut ring = BufferRing::new(4, 128, false).unwrap();
        for _ in 0..100 {
            ring.on_return(3);
        }
        ring.commit();
        // 4 seeds + 100 returns, masked into a 4-entry ring.
        assert_eq!(read_tail(&ring), 104);
    }
}
