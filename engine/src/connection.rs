use std::alloc::{self, Layout};
use std::future::Future;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::task::{Context, Poll};

use crate::cancel::CancelToken;
use crate::error::Error;
use crate::queue::SpscRing;
use crate::reactor::ReactorShared;
use crate::waiter::Waiter;

/// One received chunk: a pointer into the owning reactor's buffer slab, a
/// length, and the 16-bit buffer id. The pointer stays valid until the id
/// is handed back through [`Connection::return_ring`].
#[derive(Clone, Copy)]
pub struct RingItem {
    ptr: *mut u8,
    len: u32,
    bid: u16,
}

// The pointee is a reactor-owned slab that outlives every connection on
// that reactor; the id-return protocol bounds how long an item is read.
unsafe impl Send for RingItem {}

impl RingItem {
    pub(crate) fn new(ptr: *mut u8, len: u32, bid: u16) -> Self {
        RingItem { ptr, len, bid }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn buffer_id(&self) -> u16 {
        self.bid
    }

    /// The received bytes. Only valid until the buffer id is returned.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len as usize) }
    }
}

/// Result of a read cycle: the inbound ring tail at the instant of
/// observation, plus the closed flag and error code. Items strictly below
/// the tail are drainable; anything produced later belongs to the next
/// cycle.
#[derive(Debug, Clone, Copy)]
pub struct ReadSnapshot {
    pub(crate) tail: u64,
    pub(crate) generation: u32,
    closed: bool,
    error: i32,
}

impl ReadSnapshot {
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Raw errno for the close, 0 for clean EOF or an open connection.
    #[inline]
    pub fn error_code(&self) -> i32 {
        self.error
    }
}

/// The rendezvous between a reactor and a handler task.
///
/// The owning reactor produces inbound [`RingItem`]s and drains outbound
/// sends; the handler consumes items and fills the write slab. A
/// connection belongs to one reactor for its whole active life and is
/// recycled through that reactor's pool; the generation counter
/// invalidates everything a stale holder might still try.
pub struct Connection {
    fd: AtomicI32,
    generation: AtomicU32,
    reactor: Arc<ReactorShared>,

    // Inbound.
    inbound: SpscRing<RingItem>,
    pending: AtomicBool,
    closed: AtomicBool,
    error: AtomicI32,
    read_waiter: Waiter,
    /// Held for the duration of a single handler dequeue. Pairs with the
    /// SeqCst generation bump in `clear`: once the bump lands, a clear
    /// latch proves no handler dequeue is in flight, so the reactor may
    /// take over the consumer cursor.
    consuming: AtomicBool,

    // Outbound write slab. Single-writer (the handler); read-only for the
    // reactor between flush capture and completion.
    slab: *mut u8,
    slab_layout: Layout,
    slab_cap: u32,
    head: AtomicU32,
    tail: AtomicU32,
    in_flight: AtomicU32,
    flush_in_progress: AtomicBool,
    send_inflight: AtomicBool,
    flush_waiter: Waiter,
}

// The slab pointer follows the single-writer protocol above; everything
// else is atomics and lock-free rings.
unsafe impl Send for Connection {}
unsafe impl Sync for Connection {}

impl Connection {
    pub(crate) fn new(reactor: Arc<ReactorShared>, inbound_entries: u32, slab_size: u32) -> Self {
        let slab_layout = Layout::from_size_align(slab_size as usize, 64)
            .expect("invalid write slab layout");
        let slab = unsafe { alloc::alloc(slab_layout) };
        assert!(!slab.is_null(), "write slab allocation failed");

        Connection {
            fd: AtomicI32::new(-1),
            generation: AtomicU32::new(0),
            reactor,
            inbound: SpscRing::with_capacity(inbound_entries as usize),
            pending: AtomicBool::new(false),
            closed: AtomicBool::new(true),
            error: AtomicI32::new(0),
            read_waiter: Waiter::new(),
            consuming: AtomicBool::new(false),
            slab,
            slab_layout,
            slab_cap: slab_size,
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            flush_in_progress: AtomicBool::new(false),
            send_inflight: AtomicBool::new(false),
            flush_waiter: Waiter::new(),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reactor index this connection is bound to.
    #[inline]
    pub fn reactor_id(&self) -> usize {
        self.reactor.id
    }

    #[inline]
    pub fn write_capacity(&self) -> usize {
        self.slab_cap as usize
    }

    #[inline]
    pub(crate) fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    fn snapshot(&self, generation: u32) -> ReadSnapshot {
        ReadSnapshot {
            tail: self.inbound.snapshot_tail(),
            generation,
            closed: self.closed.load(Ordering::Acquire),
            error: self.error.load(Ordering::Relaxed),
        }
    }

    fn stale_snapshot(generation: u32) -> ReadSnapshot {
        ReadSnapshot {
            tail: 0,
            generation,
            closed: true,
            error: libc::ECANCELED,
        }
    }

    // ── Handler-side operations ─────────────────────────────────────────

    /// Wait for the next read cycle. Completes synchronously when the
    /// connection is closed, the reactor produced while no reader was
    /// armed, or items are already drainable; otherwise suspends until
    /// the reactor produces or tears the connection down.
    ///
    /// One outstanding `read_async` per connection at a time.
    pub fn read_async(&self) -> ReadFuture<'_> {
        ReadFuture {
            conn: self,
            generation: self.generation(),
            cancel: None,
            armed: false,
        }
    }

    /// Clear the read suspension primitive for the next cycle. If the
    /// reactor produced while the handler was draining, the pending flag
    /// is already set and the next [`read_async`](Self::read_async)
    /// completes immediately. Idempotent.
    pub fn reset_read(&self) {
        self.read_waiter.reset();
    }

    /// Dequeue one item published strictly below the snapshot tail.
    /// Returns `None` once the cycle is drained or the snapshot is stale.
    ///
    /// The latch/generation pair below is a store-buffer handshake with
    /// teardown, hence the SeqCst ordering on both sides: either this
    /// dequeue sees the bumped generation and refuses, or its raised
    /// latch is visible to the reactor, which then leaves the ring alone.
    pub fn try_get_ring(&self, snapshot: &ReadSnapshot) -> Option<RingItem> {
        self.consuming.store(true, Ordering::SeqCst);
        if snapshot.generation != self.generation.load(Ordering::SeqCst) {
            self.consuming.store(false, Ordering::Release);
            return None;
        }
        let item = self.inbound.try_dequeue_until(snapshot.tail);
        self.consuming.store(false, Ordering::Release);
        item
    }

    /// Drain every item below the snapshot tail into `out`. Returns the
    /// number of items appended.
    pub fn drain_ring(&self, snapshot: &ReadSnapshot, out: &mut Vec<RingItem>) -> usize {
        let mut n = 0;
        while let Some(item) = self.try_get_ring(snapshot) {
            out.push(item);
            n += 1;
        }
        n
    }

    /// Hand a buffer id back to the owning reactor. Safe from any thread,
    /// and still valid after the connection is torn down.
    pub fn return_ring(&self, buffer_id: u16) {
        self.reactor.returns.enqueue(buffer_id);
    }

    /// Copy bytes into the write slab at the current tail.
    pub fn write(&self, bytes: &[u8]) -> Result<(), Error> {
        if self.flush_in_progress.load(Ordering::Acquire) {
            return Err(Error::ContractViolation("write during flush"));
        }
        if self.is_closed() {
            return Err(Error::Closed(self.error.load(Ordering::Relaxed)));
        }
        let tail = self.tail.load(Ordering::Relaxed);
        if bytes.len() > (self.slab_cap - tail) as usize {
            return Err(Error::WriteSlabFull);
        }
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.slab.add(tail as usize), bytes.len());
        }
        self.tail.store(tail + bytes.len() as u32, Ordering::Relaxed);
        Ok(())
    }

    /// Borrow the unwritten remainder of the slab for in-place encoding.
    /// Fails if fewer than `hint` bytes remain. Commit with
    /// [`advance`](Self::advance); the handler is the slab's only writer.
    #[allow(clippy::mut_from_ref)]
    pub fn get_span(&self, hint: usize) -> Result<&mut [u8], Error> {
        if self.flush_in_progress.load(Ordering::Acquire) {
            return Err(Error::ContractViolation("get_span during flush"));
        }
        if self.is_closed() {
            return Err(Error::Closed(self.error.load(Ordering::Relaxed)));
        }
        let tail = self.tail.load(Ordering::Relaxed);
        let remaining = (self.slab_cap - tail) as usize;
        if remaining == 0 || remaining < hint {
            return Err(Error::WriteSlabFull);
        }
        Ok(unsafe { std::slice::from_raw_parts_mut(self.slab.add(tail as usize), remaining) })
    }

    /// Commit `n` bytes written through [`get_span`](Self::get_span).
    pub fn advance(&self, n: usize) {
        let tail = self.tail.load(Ordering::Relaxed);
        assert!(
            tail as usize + n <= self.slab_cap as usize,
            "advance beyond write slab capacity"
        );
        self.tail.store(tail + n as u32, Ordering::Relaxed);
    }

    /// Hand `[head, tail)` to the owning reactor for sending. Completes
    /// immediately when there is nothing to send. Fails if a flush is
    /// already in progress or a flush waiter is already armed.
    pub fn flush_async(&self) -> Result<FlushFuture<'_>, Error> {
        let generation = self.generation();
        if self.is_closed() {
            return Err(Error::Closed(self.error.load(Ordering::Relaxed)));
        }
        if self.flush_waiter.is_armed() {
            return Err(Error::ContractViolation("flush waiter already armed"));
        }
        if self.flush_in_progress.swap(true, Ordering::AcqRel) {
            return Err(Error::ContractViolation("flush already in progress"));
        }

        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Relaxed) {
            self.flush_in_progress.store(false, Ordering::Release);
        } else {
            self.flush_waiter.reset();
            self.in_flight.store(tail, Ordering::Release);
            self.reactor.flushes.enqueue(self.fd());
        }

        Ok(FlushFuture {
            conn: self,
            generation,
            cancel: None,
            armed: false,
        })
    }

    /// Request teardown of this connection. Suspended waiters resolve
    /// with closed results; the owning reactor closes the descriptor on
    /// its next pass.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.read_waiter.notify();
        self.flush_waiter.notify();
        self.reactor.flushes.enqueue(self.fd());
    }

    // ── Reactor-side operations ─────────────────────────────────────────

    /// Rebind a pooled connection to a freshly accepted descriptor.
    pub(crate) fn bind(&self, fd: RawFd) {
        self.fd.store(fd, Ordering::Relaxed);
        self.error.store(0, Ordering::Relaxed);
        self.pending.store(false, Ordering::Relaxed);
        self.consuming.store(false, Ordering::Relaxed);
        self.read_waiter.reset();
        self.flush_waiter.reset();
        self.reset_write_state();
        self.inbound.clear();
        self.closed.store(false, Ordering::Release);
    }

    /// Publish one received chunk. On ring overflow the handler has
    /// fallen behind; the connection is marked closed and the caller
    /// tears it down. Returns false on overflow.
    pub(crate) fn enqueue_ring_item(&self, item: RingItem) -> bool {
        if !self.inbound.try_enqueue(item) {
            self.mark_closed(libc::ENOBUFS);
            return false;
        }
        if !self.read_waiter.notify() {
            // Lost the armed CAS: no reader suspended, flag it for the
            // next read cycle instead.
            self.pending.store(true, Ordering::Release);
        }
        true
    }

    /// Mark closed and release any suspended waiters with closed results.
    pub(crate) fn mark_closed(&self, error: i32) {
        if error != 0 {
            self.error.store(error, Ordering::Relaxed);
        }
        self.closed.store(true, Ordering::Release);
        self.read_waiter.notify();
        self.flush_waiter.notify();
    }

    /// The send window for the current flush, or `None` when complete.
    pub(crate) fn flush_window(&self) -> Option<(*const u8, u32)> {
        let head = self.head.load(Ordering::Relaxed);
        let in_flight = self.in_flight.load(Ordering::Acquire);
        if in_flight <= head {
            return None;
        }
        let ptr = unsafe { self.slab.add(head as usize) as *const u8 };
        Some((ptr, in_flight - head))
    }

    /// Record `n` sent bytes. Returns true while bytes remain in flight.
    pub(crate) fn advance_send(&self, n: u32) -> bool {
        let head = self.head.load(Ordering::Relaxed) + n;
        self.head.store(head, Ordering::Release);
        head < self.in_flight.load(Ordering::Relaxed)
    }

    pub(crate) fn set_send_inflight(&self, value: bool) {
        self.send_inflight.store(value, Ordering::Relaxed);
    }

    pub(crate) fn send_inflight(&self) -> bool {
        self.send_inflight.load(Ordering::Relaxed)
    }

    /// Complete the current flush: all offsets return to zero and the
    /// flush waiter is released.
    pub(crate) fn complete_flush(&self) {
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
        self.in_flight.store(0, Ordering::Relaxed);
        self.send_inflight.store(false, Ordering::Relaxed);
        self.flush_in_progress.store(false, Ordering::Release);
        self.flush_waiter.notify();
    }

    /// True once no handler dequeue can be in flight. Only meaningful
    /// after the generation bump in [`clear`](Self::clear) has landed.
    pub(crate) fn consumer_quiesced(&self) -> bool {
        !self.consuming.load(Ordering::SeqCst)
    }

    /// Hand back the buffer ids of items the handler never saw. The
    /// caller must have observed [`consumer_quiesced`](Self::consumer_quiesced)
    /// after bumping the generation; only then may the reactor act as
    /// the ring's consumer.
    pub(crate) fn drain_undelivered(&self, mut f: impl FnMut(u16)) {
        let snap = self.inbound.snapshot_tail();
        while let Some(item) = self.inbound.try_dequeue_until(snap) {
            f(item.buffer_id());
        }
    }

    /// Full teardown for the pooling path: invalidate outstanding tokens,
    /// release waiters with closed results, reset I/O state. The caller
    /// recycles whatever the inbound ring still holds through
    /// [`drain_undelivered`](Self::drain_undelivered), which empties it.
    pub(crate) fn clear(&self, error: i32) {
        // SeqCst: half of the handshake with the try_get_ring latch.
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.mark_closed(error);
        self.reset_write_state();
        self.pending.store(false, Ordering::Relaxed);
        self.fd.store(-1, Ordering::Relaxed);
    }

    /// Teardown variant that skips waiter release, for paths where no
    /// waiter can exist (bulk shutdown of never-published connections).
    pub(crate) fn fast_clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::Release);
        self.reset_write_state();
        self.pending.store(false, Ordering::Relaxed);
        self.inbound.clear();
        self.fd.store(-1, Ordering::Relaxed);
    }

    fn reset_write_state(&self) {
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
        self.in_flight.store(0, Ordering::Relaxed);
        self.flush_in_progress.store(false, Ordering::Release);
        self.send_inflight.store(false, Ordering::Relaxed);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        unsafe {
            alloc::dealloc(self.slab, self.slab_layout);
        }
    }
}

/// Future returned by [`Connection::read_async`].
pub struct ReadFuture<'a> {
    conn: &'a Connection,
    generation: u32,
    cancel: Option<CancelToken>,
    armed: bool,
}

impl<'a> ReadFuture<'a> {
    /// Observe a cancellation token; a cancelled waiter resolves with a
    /// closed snapshot.
    pub fn cancel_with(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

impl Future for ReadFuture<'_> {
    type Output = ReadSnapshot;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<ReadSnapshot> {
        let conn = self.conn;
        let generation = self.generation;

        if conn.generation() != generation {
            self.armed = false;
            return Poll::Ready(Connection::stale_snapshot(generation));
        }

        if let Some(token) = self.cancel.clone() {
            if token.is_cancelled() {
                if self.armed && !conn.read_waiter.disarm() {
                    // A signal raced in; reconcile it into pending so the
                    // next read cycle sees it.
                    conn.read_waiter.consume();
                    conn.pending.store(true, Ordering::Release);
                }
                self.armed = false;
                let mut snap = conn.snapshot(generation);
                snap.closed = true;
                snap.error = libc::ECANCELED;
                return Poll::Ready(snap);
            }
        }

        if self.armed {
            if conn.read_waiter.consume() {
                self.armed = false;
                return Poll::Ready(conn.snapshot(generation));
            }
            let ready = conn.is_closed()
                || conn.pending.load(Ordering::Acquire)
                || conn.inbound.snapshot_tail() > conn.inbound.head();
            if ready && (conn.read_waiter.disarm() || conn.read_waiter.consume()) {
                self.armed = false;
                let _ = conn.pending.swap(false, Ordering::AcqRel);
                return Poll::Ready(conn.snapshot(generation));
            }
            conn.read_waiter.update(cx.waker());
            return Poll::Pending;
        }

        // Fast paths, all synchronous.
        conn.read_waiter.consume_stale();
        if conn.is_closed() {
            return Poll::Ready(conn.snapshot(generation));
        }
        if conn.pending.swap(false, Ordering::AcqRel) {
            return Poll::Ready(conn.snapshot(generation));
        }
        if conn.inbound.snapshot_tail() > conn.inbound.head() {
            return Poll::Ready(conn.snapshot(generation));
        }

        // Slow path: suspend.
        assert!(
            conn.read_waiter.arm(cx.waker()),
            "double read_async: a reader is already suspended on this connection"
        );
        self.armed = true;
        if let Some(token) = &self.cancel {
            token.register(cx.waker());
            if token.is_cancelled() {
                cx.waker().wake_by_ref();
            }
        }

        // Close the arm/publish race: anything produced between the fast
        // checks and arming must not strand the waiter.
        let raced = conn.is_closed()
            || conn.pending.load(Ordering::Acquire)
            || conn.inbound.snapshot_tail() > conn.inbound.head();
        if raced && (conn.read_waiter.disarm() || conn.read_waiter.consume()) {
            self.armed = false;
            let _ = conn.pending.swap(false, Ordering::AcqRel);
            return Poll::Ready(conn.snapshot(generation));
        }
        Poll::Pending
    }
}

impl Drop for ReadFuture<'_> {
    fn drop(&mut self) {
        if self.armed && !self.conn.read_waiter.disarm() && self.conn.read_waiter.consume() {
            // The producer signalled a waiter that no longer exists; keep
            // the signal as pending for the next read cycle.
            self.conn.pending.store(true, Ordering::Release);
        }
    }
}

/// Future returned by [`Connection::flush_async`]. Resolves once the
/// reactor has drained `[head, in_flight)` to the kernel, or with
/// [`Error::Closed`] on teardown.
pub struct FlushFuture<'a> {
    conn: &'a Connection,
    generation: u32,
    cancel: Option<CancelToken>,
    armed: bool,
}

impl<'a> FlushFuture<'a> {
    pub fn cancel_with(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

impl FlushFuture<'_> {
    fn resolve(&self) -> Result<(), Error> {
        if self.conn.is_closed() {
            Err(Error::Closed(self.conn.error.load(Ordering::Relaxed)))
        } else {
            Ok(())
        }
    }
}

impl Future for FlushFuture<'_> {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let conn = self.conn;

        if conn.generation() != self.generation {
            self.armed = false;
            return Poll::Ready(Err(Error::Closed(libc::ECANCELED)));
        }

        if let Some(token) = self.cancel.clone() {
            if token.is_cancelled() {
                if self.armed && !conn.flush_waiter.disarm() {
                    conn.flush_waiter.consume();
                }
                self.armed = false;
                return Poll::Ready(Err(Error::Closed(libc::ECANCELED)));
            }
        }

        if self.armed {
            if conn.flush_waiter.consume() {
                self.armed = false;
                return Poll::Ready(self.resolve());
            }
            let done = conn.is_closed() || !conn.flush_in_progress.load(Ordering::Acquire);
            if done && (conn.flush_waiter.disarm() || conn.flush_waiter.consume()) {
                self.armed = false;
                return Poll::Ready(self.resolve());
            }
            conn.flush_waiter.update(cx.waker());
            return Poll::Pending;
        }

        if conn.is_closed() {
            return Poll::Ready(Err(Error::Closed(conn.error.load(Ordering::Relaxed))));
        }
        if !conn.flush_in_progress.load(Ordering::Acquire) {
            return Poll::Ready(Ok(()));
        }

        assert!(
            conn.flush_waiter.arm(cx.waker()),
            "double flush waiter on this connection"
        );
        self.armed = true;
        if let Some(token) = &self.cancel {
            token.register(cx.waker());
            if token.is_cancelled() {
                cx.waker().wake_by_ref();
            }
        }

        let done = conn.is_closed() || !conn.flush_in_progress.load(Ordering::Acquire);
        if done && (conn.flush_waiter.disarm() || conn.flush_waiter.consume()) {
            self.armed = false;
            return Poll::Ready(self.resolve());
        }
        Poll::Pending
    }
}

impl Drop for FlushFuture<'_> {
    fn drop(&mut self) {
        if self.armed && !self.conn.flush_waiter.disarm() {
            self.conn.flush_waiter.consume();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{SeqQueue, TailQueue};
    use std::sync::atomic::AtomicUsize;
    use std::task::{Wake, Waker};

    struct FlagWaker(AtomicUsize);

    impl Wake for FlagWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_waker() -> (Arc<FlagWaker>, Waker) {
        let flag = Arc::new(FlagWaker(AtomicUsize::new(0)));
        (flag.clone(), Waker::from(flag))
    }

    fn test_conn(inbound: u32, slab: u32) -> Connection {
        let shared = Arc::new(ReactorShared {
            id: 0,
            returns: SeqQueue::with_capacity(256),
            flushes: TailQueue::with_capacity(256),
        });
        let conn = Connection::new(shared, inbound, slab);
        conn.bind(7);
        conn
    }

    fn item(bytes: &'static [u8], bid: u16) -> RingItem {
        RingItem::new(bytes.as_ptr() as *mut u8, bytes.len() as u32, bid)
    }

    fn poll_read(fut: &mut ReadFuture<'_>, waker: &Waker) -> Poll<ReadSnapshot> {
        let mut cx = Context::from_waker(waker);
        Pin::new(fut).poll(&mut cx)
    }

    fn poll_flush(fut: &mut FlushFuture<'_>, waker: &Waker) -> Poll<Result<(), Error>> {
        let mut cx = Context::from_waker(waker);
        Pin::new(fut).poll(&mut cx)
    }

    #[test]
    fn read_returns_immediately_when_items_present() {
        let conn = test_conn(8, 1024);
        assert!(conn.enqueue_ring_item(item(b"hello", 3)));

        let (_, waker) = test_waker();
        let mut fut = conn.read_async();
        let snap = match poll_read(&mut fut, &waker) {
            Poll::Ready(s) => s,
            Poll::Pending => panic!("expected synchronous completion"),
        };
        assert!(!snap.is_closed());

        let got = conn.try_get_ring(&snap).unwrap();
        assert_eq!(got.as_slice(), b"hello");
        assert_eq!(got.buffer_id(), 3);
        assert!(conn.try_get_ring(&snap).is_none());
    }

    #[test]
    fn pending_makes_next_read_immediate() {
        let conn = test_conn(8, 1024);

        // Produce with no reader armed: pending is set.
        assert!(conn.enqueue_ring_item(item(b"a", 0)));
        let (_, waker) = test_waker();

        let snap = match poll_read(&mut conn.read_async(), &waker) {
            Poll::Ready(s) => s,
            Poll::Pending => panic!(),
        };
        while conn.try_get_ring(&snap).is_some() {}
        conn.reset_read();

        // Produce again between cycles.
        assert!(conn.enqueue_ring_item(item(b"b", 1)));
        let snap2 = match poll_read(&mut conn.read_async(), &waker) {
            Poll::Ready(s) => s,
            Poll::Pending => panic!("pending must make read_async synchronous"),
        };
        let got = conn.try_get_ring(&snap2).unwrap();
        assert_eq!(got.as_slice(), b"b");
    }

    #[test]
    fn suspended_reader_is_woken_by_produce() {
        let conn = test_conn(8, 1024);
        let (flag, waker) = test_waker();

        let mut fut = conn.read_async();
        assert!(matches!(poll_read(&mut fut, &waker), Poll::Pending));

        assert!(conn.enqueue_ring_item(item(b"x", 2)));
        assert_eq!(flag.0.load(Ordering::SeqCst), 1, "waker must fire");

        let snap = match poll_read(&mut fut, &waker) {
            Poll::Ready(s) => s,
            Poll::Pending => panic!("signalled future must resolve"),
        };
        assert_eq!(conn.try_get_ring(&snap).unwrap().as_slice(), b"x");
    }

    #[test]
    fn close_releases_suspended_reader() {
        let conn = test_conn(8, 1024);
        let (flag, waker) = test_waker();

        let mut fut = conn.read_async();
        assert!(matches!(poll_read(&mut fut, &waker), Poll::Pending));

        conn.mark_closed(libc::ECONNRESET);
        assert_eq!(flag.0.load(Ordering::SeqCst), 1);

        let snap = match poll_read(&mut fut, &waker) {
            Poll::Ready(s) => s,
            Poll::Pending => panic!(),
        };
        assert!(snap.is_closed());
        assert_eq!(snap.error_code(), libc::ECONNRESET);
    }

    #[test]
    fn closed_snapshot_still_drains_earlier_items() {
        let conn = test_conn(8, 1024);
        assert!(conn.enqueue_ring_item(item(b"tail bytes", 4)));
        conn.mark_closed(0);

        let (_, waker) = test_waker();
        let snap = match poll_read(&mut conn.read_async(), &waker) {
            Poll::Ready(s) => s,
            Poll::Pending => panic!(),
        };
        assert!(snap.is_closed());
        assert_eq!(conn.try_get_ring(&snap).unwrap().as_slice(), b"tail bytes");
    }

    #[test]
    fn ring_overflow_closes_connection() {
        let conn = test_conn(4, 1024);
        for bid in 0..4u16 {
            assert!(conn.enqueue_ring_item(item(b"z", bid)));
        }
        assert!(!conn.enqueue_ring_item(item(b"overflow", 4)));
        assert!(conn.is_closed());
    }

    #[test]
    fn stale_generation_yields_closed_results() {
        let conn = test_conn(8, 1024);
        assert!(conn.enqueue_ring_item(item(b"old", 0)));
        let (_, waker) = test_waker();
        let snap = match poll_read(&mut conn.read_async(), &waker) {
            Poll::Ready(s) => s,
            Poll::Pending => panic!(),
        };

        let mut fut = conn.read_async();
        conn.clear(0);

        // The old snapshot no longer drains.
        assert!(conn.try_get_ring(&snap).is_none());

        // A future created under the old generation resolves closed.
        let stale = match poll_read(&mut fut, &waker) {
            Poll::Ready(s) => s,
            Poll::Pending => panic!(),
        };
        assert!(stale.is_closed());
    }

    #[test]
    fn reset_read_is_idempotent() {
        let conn = test_conn(8, 1024);
        conn.reset_read();
        conn.reset_read();
        assert!(conn.enqueue_ring_item(item(b"ok", 0)));
        let (_, waker) = test_waker();
        assert!(matches!(
            poll_read(&mut conn.read_async(), &waker),
            Poll::Ready(_)
        ));
    }

    #[test]
    fn cancelled_read_resolves_closed() {
        let conn = test_conn(8, 1024);
        let token = CancelToken::new();
        let (_, waker) = test_waker();

        let mut fut = conn.read_async().cancel_with(token.clone());
        assert!(matches!(poll_read(&mut fut, &waker), Poll::Pending));

        token.cancel();
        let snap = match poll_read(&mut fut, &waker) {
            Poll::Ready(s) => s,
            Poll::Pending => panic!(),
        };
        assert!(snap.is_closed());
        assert_eq!(snap.error_code(), libc::ECANCELED);
    }

    #[test]
    fn write_flush_round_trip() {
        let conn = test_conn(8, 64);
        conn.write(b"hello ").unwrap();
        conn.write(b"world").unwrap();

        let mut fut = conn.flush_async().unwrap();
        let (_, waker) = test_waker();
        assert!(matches!(poll_flush(&mut fut, &waker), Poll::Pending));

        // Writes are rejected mid-flush.
        assert!(matches!(
            conn.write(b"nope"),
            Err(Error::ContractViolation(_))
        ));

        // Reactor side: send the window in two parts.
        let (ptr, len) = conn.flush_window().unwrap();
        assert_eq!(len, 11);
        assert_eq!(
            unsafe { std::slice::from_raw_parts(ptr, len as usize) },
            b"hello world"
        );
        assert!(conn.advance_send(6));
        let (_, rest) = conn.flush_window().unwrap();
        assert_eq!(rest, 5);
        assert!(!conn.advance_send(5));
        conn.complete_flush();

        assert!(matches!(poll_flush(&mut fut, &waker), Poll::Ready(Ok(()))));
        // All offsets reset: the slab admits its full capacity again.
        assert!(conn.write(&[0u8; 64]).is_ok());
    }

    #[test]
    fn empty_flush_completes_immediately() {
        let conn = test_conn(8, 64);
        let mut fut = conn.flush_async().unwrap();
        let (_, waker) = test_waker();
        assert!(matches!(poll_flush(&mut fut, &waker), Poll::Ready(Ok(()))));
    }

    #[test]
    fn double_flush_is_a_contract_violation() {
        let conn = test_conn(8, 64);
        conn.write(b"data").unwrap();
        let _fut = conn.flush_async().unwrap();
        assert!(matches!(
            conn.flush_async(),
            Err(Error::ContractViolation(_))
        ));
    }

    #[test]
    fn slab_capacity_is_enforced() {
        let conn = test_conn(8, 16);
        conn.write(&[0u8; 15]).unwrap();
        conn.write(&[0u8; 1]).unwrap();
        assert!(matches!(conn.write(b"x"), Err(Error::WriteSlabFull)));
        assert!(matches!(conn.get_span(1), Err(Error::WriteSlabFull)));
    }

    #[test]
    fn get_span_advance() {
        let conn = test_conn(8, 32);
        let span = conn.get_span(4).unwrap();
        span[..4].copy_from_slice(b"abcd");
        conn.advance(4);

        conn.write(b"ef").unwrap();
        let mut fut = conn.flush_async().unwrap();
        let (ptr, len) = conn.flush_window().unwrap();
        assert_eq!(
            unsafe { std::slice::from_raw_parts(ptr, len as usize) },
            b"abcdef"
        );
        assert!(!conn.advance_send(len));
        conn.complete_flush();
        let (_, waker) = test_waker();
        assert!(matches!(poll_flush(&mut fut, &waker), Poll::Ready(Ok(()))));
    }

    #[test]
    #[should_panic(expected = "advance beyond write slab")]
    fn advance_past_capacity_panics() {
        let conn = test_conn(8, 16);
        conn.advance(17);
    }

    #[test]
    fn teardown_releases_flush_waiter() {
        let conn = test_conn(8, 64);
        conn.write(b"pending").unwrap();
        let mut fut = conn.flush_async().unwrap();
        let (_, waker) = test_waker();
        assert!(matches!(poll_flush(&mut fut, &waker), Poll::Pending));

        conn.mark_closed(libc::EPIPE);
        match poll_flush(&mut fut, &waker) {
            Poll::Ready(Err(Error::Closed(code))) => assert_eq!(code, libc::EPIPE),
            other => panic!("expected closed flush result, got {other:?}"),
        }
    }

    #[test]
    fn dropped_reader_preserves_signal_as_pending() {
        let conn = test_conn(8, 1024);
        let (_, waker) = test_waker();

        {
            let mut fut = conn.read_async();
            assert!(matches!(poll_read(&mut fut, &waker), Poll::Pending));
            // Producer signals the armed waiter...
            assert!(conn.enqueue_ring_item(item(b"kept", 0)));
            // ...and the future is dropped before observing it.
        }

        // The signal must survive as pending.
        let snap = match poll_read(&mut conn.read_async(), &waker) {
            Poll::Ready(s) => s,
            Poll::Pending => panic!("dropped signal was lost"),
        };
        assert_eq!(conn.try_get_ring(&snap).unwrap().as_slice(), b"kept");
    }

    #[test]
    fn drain_undelivered_reports_buffer_ids() {
        let conn = test_conn(8, 1024);
        for bid in 0..3u16 {
            assert!(conn.enqueue_ring_item(item(b"u", bid)));
        }
        let (_, waker) = test_waker();
        let snap = match poll_read(&mut conn.read_async(), &waker) {
            Poll::Ready(s) => s,
            Poll::Pending => panic!(),
        };

        conn.clear(0);

        // The stale snapshot refuses before touching the ring, and the
        // latch reads clear, so the reactor may take the cursor over.
        assert!(conn.try_get_ring(&snap).is_none());
        assert!(conn.consumer_quiesced());
        let mut bids = Vec::new();
        conn.drain_undelivered(|bid| bids.push(bid));
        assert_eq!(bids, vec![0, 1, 2]);
    }

    #[test]
    fn consumer_latch_clears_after_each_dequeue() {
        let conn = test_conn(8, 1024);
        assert!(conn.enqueue_ring_item(item(b"a", 0)));
        let (_, waker) = test_waker();
        let snap = match poll_read(&mut conn.read_async(), &waker) {
            Poll::Ready(s) => s,
            Poll::Pending => panic!(),
        };
        assert!(conn.try_get_ring(&snap).is_some());
        assert!(conn.consumer_quiesced());
        assert!(conn.try_get_ring(&snap).is_none());
        assert!(conn.consumer_quiesced());
    }
}
