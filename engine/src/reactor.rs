use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::AHashMap;
use crossbeam_channel::{Receiver, Sender};
use io_uring::types::{Fd, SubmitArgs, Timespec};
use io_uring::{IoUring, cqueue, opcode, squeue};
use tracing::{debug, info, warn};

use crate::buffer::BufferRing;
use crate::buffer::ring::CQE_F_BUF_MORE;
use crate::completion::{OpKind, UserData};
use crate::config::ReactorConfig;
use crate::connection::{Connection, RingItem};
use crate::engine::AcceptWakers;
use crate::error::Error;
use crate::metrics::{
    BUFFERS_RECYCLED, CONNECTIONS_ACCEPTED, CONNECTIONS_CLOSED, RECV_COMPLETIONS,
    RING_OVERFLOWS, SEND_COMPLETIONS,
};
use crate::queue::{SeqQueue, TailQueue};

/// Buffer group id for a reactor's provided buffer ring. Every reactor
/// owns a private ring, so a fixed id never clashes.
const BGID: u16 = 0;

/// The reactor-side queue endpoints a [`Connection`] holds a non-owning
/// handle to. Ownership flows reactor -> connection; this back-reference
/// is shared state only.
pub(crate) struct ReactorShared {
    pub(crate) id: usize,
    /// Buffer ids coming back from handlers, on any thread.
    pub(crate) returns: SeqQueue<u16>,
    /// Descriptors with a captured send window (or a close request).
    pub(crate) flushes: TailQueue,
}

/// A connection published to the engine's accept channel. The generation
/// lets `accept_async` skip publications that were torn down before being
/// dequeued.
pub(crate) struct Accepted {
    pub(crate) conn: Arc<Connection>,
    pub(crate) generation: u32,
}

/// Build a ring with the engine's standard setup flags.
pub(crate) fn build_ring(
    sq_entries: u32,
    sqpoll: bool,
    sqpoll_idle_ms: u32,
    sqpoll_cpu: Option<u32>,
) -> Result<IoUring, Error> {
    let mut builder = IoUring::builder();
    builder.setup_cqsize(sq_entries.checked_mul(4).unwrap_or(sq_entries));
    builder.setup_coop_taskrun();
    builder.setup_single_issuer();
    if sqpoll {
        builder.setup_sqpoll(sqpoll_idle_ms);
        if let Some(cpu) = sqpoll_cpu {
            builder.setup_sqpoll_cpu(cpu);
        }
        // DEFER_TASKRUN is incompatible with SQPOLL (kernel returns EINVAL).
    } else {
        builder.setup_defer_taskrun();
    }
    builder
        .build(sq_entries)
        .map_err(|e| Error::RingSetup(format!("io_uring build failed: {e}")))
}

/// One reactor: a kernel ring, a provided buffer slab, the descriptor map,
/// and the queues feeding it. Runs a single thread that is the sole
/// submitter to its ring.
pub(crate) struct Reactor {
    id: usize,
    config: ReactorConfig,
    ring: IoUring,
    bufs: BufferRing,
    shared: Arc<ReactorShared>,
    connections: AHashMap<RawFd, Arc<Connection>>,
    pool: Vec<Arc<Connection>>,
    /// Torn-down connections whose handler may still hold the consumer
    /// latch. Reaped into the pool once the latch is observed clear.
    retiring: Vec<Arc<Connection>>,
    accept_rx: Receiver<RawFd>,
    publish_tx: Sender<Accepted>,
    accept_wakers: Arc<AcceptWakers>,
    running: Arc<AtomicBool>,
    cqe_scratch: Vec<(u64, i32, u32)>,
    wait_ts: Timespec,
}

impl Reactor {
    /// Create the reactor on its own thread. Single-issuer rings bind to
    /// the creating task, so this must not run on the engine thread.
    pub(crate) fn new(
        id: usize,
        config: ReactorConfig,
        accept_rx: Receiver<RawFd>,
        publish_tx: Sender<Accepted>,
        accept_wakers: Arc<AcceptWakers>,
        running: Arc<AtomicBool>,
    ) -> Result<Self, Error> {
        let ring = build_ring(
            config.sq_entries,
            config.sqpoll,
            config.sqpoll_idle_ms,
            config.sqpoll_cpu,
        )?;

        let bufs = BufferRing::new(
            config.buffer_ring_entries,
            config.recv_buffer_size,
            config.incremental_buffers,
        )?;
        // Safety: the slab outlives the registration; it is unregistered
        // in shutdown before the ring is destroyed.
        unsafe {
            ring.submitter()
                .register_buf_ring_with_flags(
                    bufs.ring_addr(),
                    bufs.entries(),
                    BGID,
                    bufs.registration_flags(),
                )
                .map_err(|e| Error::RingSetup(format!("buffer ring registration: {e}")))?;
        }

        let shared = Arc::new(ReactorShared {
            id,
            returns: SeqQueue::with_capacity(config.buffer_ring_entries as usize * 4),
            flushes: TailQueue::with_capacity(
                (config.max_connections as usize * 2).next_power_of_two(),
            ),
        });

        let wait_ts = Timespec::new()
            .sec(config.wait_timeout_ns / 1_000_000_000)
            .nsec((config.wait_timeout_ns % 1_000_000_000) as u32);

        Ok(Reactor {
            id,
            cqe_scratch: Vec::with_capacity(config.completion_batch),
            config,
            ring,
            bufs,
            shared,
            connections: AHashMap::new(),
            pool: Vec::new(),
            retiring: Vec::new(),
            accept_rx,
            publish_tx,
            accept_wakers,
            running,
            wait_ts,
        })
    }

    /// Run the event loop. Blocks the current thread until the engine's
    /// running flag drops.
    pub(crate) fn run(&mut self) -> Result<(), Error> {
        info!(reactor = self.id, "reactor running");
        loop {
            if !self.running.load(Ordering::Acquire) {
                self.shutdown();
                return Ok(());
            }
            self.reap_retiring();
            self.drain_accepted();
            self.drain_returns();
            self.drain_flushes();
            self.process_completions();
            // Publish every buffer recycled this iteration with one
            // ring-advance.
            self.bufs.commit();
            self.submit_and_wait()?;
        }
    }

    /// Bind newly accepted descriptors to pooled connections, arm their
    /// multishot receives, and publish them for `accept_async`.
    fn drain_accepted(&mut self) {
        let mut published = false;
        while let Ok(fd) = self.accept_rx.try_recv() {
            if self.connections.len() >= self.config.max_connections as usize {
                warn!(reactor = self.id, fd, "connection limit reached, dropping accept");
                unsafe {
                    libc::close(fd);
                }
                continue;
            }

            let conn = self.pool.pop().unwrap_or_else(|| {
                Arc::new(Connection::new(
                    self.shared.clone(),
                    self.config.inbound_ring_entries,
                    self.config.write_slab_size,
                ))
            });
            conn.bind(fd);

            if let Err(e) = self.arm_recv(fd) {
                warn!(reactor = self.id, fd, error = %e, "failed to arm receive");
                conn.fast_clear();
                unsafe {
                    libc::close(fd);
                }
                self.pool.push(conn);
                continue;
            }

            let generation = conn.generation();
            self.connections.insert(fd, conn.clone());
            let _ = self.publish_tx.send(Accepted { conn, generation });
            CONNECTIONS_ACCEPTED.increment();
            published = true;
        }
        if published {
            self.accept_wakers.wake_all();
        }
    }

    /// Recycle buffer ids handed back by handlers. Re-adds are deferred
    /// and published in bulk by the commit at the end of the iteration.
    fn drain_returns(&mut self) {
        while let Some(bid) = self.shared.returns.try_dequeue() {
            if self.bufs.on_return(bid) {
                BUFFERS_RECYCLED.increment();
            }
        }
    }

    /// Arm sends for flush requests, and honor close requests routed
    /// through the same queue.
    fn drain_flushes(&mut self) {
        while let Some(fd) = self.shared.flushes.try_dequeue() {
            let Some(conn) = self.connections.get(&fd).cloned() else {
                continue;
            };
            if conn.is_closed() {
                self.teardown(fd, 0);
                continue;
            }
            if conn.send_inflight() {
                continue;
            }
            match conn.flush_window() {
                Some((ptr, len)) => {
                    if self.push_send(fd, ptr, len).is_ok() {
                        conn.set_send_inflight(true);
                    } else {
                        self.teardown(fd, libc::EIO);
                    }
                }
                None => conn.complete_flush(),
            }
        }
    }

    /// Dispatch a bounded batch of completions by the kind packed into
    /// the user data.
    fn process_completions(&mut self) {
        self.cqe_scratch.clear();
        {
            let cq = self.ring.completion();
            for cqe in cq.take(self.config.completion_batch) {
                self.cqe_scratch
                    .push((cqe.user_data(), cqe.result(), cqe.flags()));
            }
        }

        for i in 0..self.cqe_scratch.len() {
            let (ud_raw, result, flags) = self.cqe_scratch[i];
            let ud = UserData(ud_raw);
            match ud.kind() {
                Some(OpKind::Recv) => self.handle_recv(ud.fd(), result, flags),
                Some(OpKind::Send) => self.handle_send(ud.fd(), result),
                // Cancel completions are diagnostics only; Accept never
                // lands on a reactor ring.
                Some(OpKind::Cancel) | Some(OpKind::Accept) | None => {}
            }
        }
    }

    fn handle_recv(&mut self, fd: RawFd, result: i32, flags: u32) {
        let more = cqueue::more(flags);
        // Meaningful only with incremental consumption: absent means the
        // kernel is finished with this buffer.
        let kernel_done = flags & CQE_F_BUF_MORE == 0;

        let Some(conn) = self.connections.get(&fd).cloned() else {
            // Raced with teardown: recycle the provided buffer so the
            // ring entry is not leaked.
            if let Some(bid) = cqueue::buffer_select(flags) {
                self.bufs.discard(bid, kernel_done);
            }
            return;
        };

        if conn.is_closed() {
            // Torn down but still mapped while a send completion is
            // pending; the descriptor is live, so receives can still
            // land. Recycle their buffers and do not re-arm.
            if let Some(bid) = cqueue::buffer_select(flags) {
                self.bufs.discard(bid, kernel_done);
            }
            return;
        }

        if result <= 0 {
            if let Some(bid) = cqueue::buffer_select(flags) {
                self.bufs.discard(bid, kernel_done);
            }
            if result == 0 {
                // EOF
                self.teardown(fd, 0);
                return;
            }
            let errno = -result;
            if errno == libc::ENOBUFS {
                // All buffers are held; connections that are not stalled
                // keep making progress, this one resumes once returns
                // replenish the ring.
                if !more {
                    let _ = self.arm_recv(fd);
                }
            } else if errno != libc::ECANCELED {
                self.teardown(fd, errno);
            }
            return;
        }

        let Some(bid) = cqueue::buffer_select(flags) else {
            // No buffer attached; the multishot arm must still be kept
            // alive or the connection stalls silently.
            if !more && self.arm_recv(fd).is_err() {
                self.teardown(fd, libc::EIO);
            }
            return;
        };
        let len = result as u32;
        let ptr = self.bufs.on_recv(bid, len, kernel_done);
        RECV_COMPLETIONS.increment();

        if !conn.enqueue_ring_item(RingItem::new(ptr, len, bid)) {
            // The handler fell behind its inbound ring; fatal for the
            // connection, invisible to the rest of the reactor.
            RING_OVERFLOWS.increment();
            self.bufs.on_return(bid);
            self.teardown(fd, libc::ENOBUFS);
            return;
        }

        if !more && self.arm_recv(fd).is_err() {
            self.teardown(fd, libc::EIO);
        }
    }

    fn handle_send(&mut self, fd: RawFd, result: i32) {
        SEND_COMPLETIONS.increment();
        let Some(conn) = self.connections.get(&fd).cloned() else {
            return;
        };
        // This completion is the one armed send; nothing references the
        // slab until another send is pushed below.
        conn.set_send_inflight(false);

        if conn.is_closed() {
            // Teardown was deferred behind this completion (or the user
            // closed mid-send); no send references the slab now.
            self.teardown(fd, 0);
            return;
        }

        if result <= 0 {
            let errno = if result == 0 { libc::EPIPE } else { -result };
            self.teardown(fd, errno);
            return;
        }

        if conn.advance_send(result as u32) {
            // Short send: arm the remainder of the window.
            if let Some((ptr, len)) = conn.flush_window() {
                if self.push_send(fd, ptr, len).is_ok() {
                    conn.set_send_inflight(true);
                } else {
                    self.teardown(fd, libc::EIO);
                }
                return;
            }
        }
        conn.complete_flush();
    }

    /// Uniform per-connection teardown: invalidate tokens and release
    /// waiters with closed snapshots. While a send SQE still references
    /// the write slab the descriptor stays open and mapped; the send is
    /// cancelled and its completion finishes the job.
    fn teardown(&mut self, fd: RawFd, errno: i32) {
        let Some(conn) = self.connections.get(&fd).cloned() else {
            return;
        };
        // `clear` resets the bound descriptor, so this distinguishes the
        // first teardown pass from re-entries (a user `close()` sets the
        // closed flag but must still be cleared here).
        if conn.fd() == fd {
            debug!(reactor = self.id, fd, errno, "connection teardown");
            // Generation moves first so stale snapshots stop draining.
            conn.clear(errno);
            if conn.send_inflight() {
                self.cancel_send(fd);
            }
        }
        if conn.send_inflight() {
            return;
        }
        self.finish_teardown(fd);
    }

    /// Second half of teardown, once no send references the slab: close
    /// the descriptor and park the connection until its handler drops the
    /// consumer latch.
    fn finish_teardown(&mut self, fd: RawFd) {
        let Some(conn) = self.connections.remove(&fd) else {
            return;
        };
        unsafe {
            libc::close(fd);
        }
        self.retiring.push(conn);
        CONNECTIONS_CLOSED.increment();
    }

    /// Recycle retired connections whose handler is provably out of the
    /// inbound ring. Only then may the reactor drain undelivered items;
    /// the generation bump in teardown keeps new dequeues out.
    fn reap_retiring(&mut self) {
        let mut i = 0;
        while i < self.retiring.len() {
            let ready =
                self.retiring[i].consumer_quiesced() && !self.retiring[i].send_inflight();
            if ready {
                let conn = self.retiring.swap_remove(i);
                conn.drain_undelivered(|bid| {
                    self.bufs.on_return(bid);
                });
                self.pool.push(conn);
            } else {
                i += 1;
            }
        }
    }

    /// Ask the kernel to fail the outstanding send promptly, so teardown
    /// is not held hostage by a stalled peer.
    fn cancel_send(&mut self, fd: RawFd) {
        let target = UserData::encode(OpKind::Send, fd);
        let ud = UserData::encode(OpKind::Cancel, fd);
        let entry = opcode::AsyncCancel::new(target.raw())
            .build()
            .user_data(ud.raw());
        if let Err(e) = unsafe { self.push_sqe(entry) } {
            warn!(reactor = self.id, fd, error = %e, "failed to cancel in-flight send");
        }
    }

    fn arm_recv(&mut self, fd: RawFd) -> io::Result<()> {
        let ud = UserData::encode(OpKind::Recv, fd);
        let entry = opcode::RecvMulti::new(Fd(fd), BGID)
            .build()
            .user_data(ud.raw());
        unsafe { self.push_sqe(entry) }
    }

    fn push_send(&mut self, fd: RawFd, ptr: *const u8, len: u32) -> io::Result<()> {
        let ud = UserData::encode(OpKind::Send, fd);
        let entry = opcode::Send::new(Fd(fd), ptr, len)
            .build()
            .user_data(ud.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Push an SQE, submitting once to make room if the queue is full.
    ///
    /// # Safety
    /// The SQE must reference memory that stays valid for the lifetime of
    /// the operation.
    unsafe fn push_sqe(&mut self, entry: squeue::Entry) -> io::Result<()> {
        unsafe {
            if self.ring.submission().push(&entry).is_err() {
                self.ring.submit()?;
                self.ring
                    .submission()
                    .push(&entry)
                    .map_err(|_| io::Error::other("SQ still full after submit"))?;
            }
        }
        Ok(())
    }

    /// Submit pending SQEs and wait for at least one completion, bounded
    /// by the configured timeout. Going through the submitter also wakes
    /// the kernel SQPOLL thread when it has gone idle.
    fn submit_and_wait(&mut self) -> Result<(), Error> {
        let args = SubmitArgs::new().timespec(&self.wait_ts);
        match self.ring.submitter().submit_with_args(1, &args) {
            Ok(_) => Ok(()),
            Err(e) => match e.raw_os_error() {
                // Timeout is a no-op continue; EINTR and a transiently
                // full CQ are equally harmless here.
                Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY) => Ok(()),
                _ => Err(Error::Io(e)),
            },
        }
    }

    /// Close every remaining connection, free the buffer ring before the
    /// kernel ring is destroyed, and release pending waiters.
    fn shutdown(&mut self) {
        info!(
            reactor = self.id,
            active = self.connections.len(),
            "reactor shutting down"
        );
        let fds: Vec<RawFd> = self.connections.keys().copied().collect();
        for fd in fds {
            self.teardown(fd, libc::ECANCELED);
        }

        // Bounded drain: connections with a cancelled send in flight
        // finish as its completion arrives.
        for _ in 0..100 {
            if self.connections.is_empty() {
                break;
            }
            if self.submit_and_wait().is_err() {
                break;
            }
            self.process_completions();
        }
        let fds: Vec<RawFd> = self.connections.keys().copied().collect();
        for fd in fds {
            self.finish_teardown(fd);
        }

        // Give lagging handlers a moment to drop the consumer latch so
        // their undelivered buffers are accounted for.
        for _ in 0..100 {
            self.reap_retiring();
            if self.retiring.is_empty() {
                break;
            }
            std::thread::yield_now();
        }

        self.bufs.commit();
        let _ = self.ring.submitter().unregister_buf_ring(BGID);
    }
}
