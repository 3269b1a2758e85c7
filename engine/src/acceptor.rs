use std::io;
use std::net::SocketAddr;
use std::os::fd::{IntoRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::Sender;
use io_uring::types::{Fd, SubmitArgs, Timespec};
use io_uring::{IoUring, cqueue, opcode, squeue};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{info, warn};

use crate::completion::{OpKind, UserData};
use crate::config::{AcceptorConfig, IpFamily};
use crate::error::Error;
use crate::metrics::ACCEPT_ERRORS;
use crate::reactor::build_ring;

/// Create the listening socket: SO_REUSEADDR, and for dual-stack
/// listeners IPV6_V6ONLY off so one socket serves both families.
pub(crate) fn create_listener(
    addr: SocketAddr,
    backlog: i32,
    family: IpFamily,
) -> Result<(RawFd, SocketAddr), Error> {
    let domain = match family {
        IpFamily::V4 => Domain::IPV4,
        IpFamily::DualStack => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(Error::Io)?;
    socket.set_reuse_address(true).map_err(Error::Io)?;
    if family == IpFamily::DualStack {
        socket.set_only_v6(false).map_err(Error::Io)?;
    }
    socket.bind(&addr.into()).map_err(Error::Io)?;
    socket.listen(backlog).map_err(Error::Io)?;
    let local_addr = socket
        .local_addr()
        .map_err(Error::Io)?
        .as_socket()
        .ok_or_else(|| Error::Config("listener has no socket address".into()))?;
    Ok((socket.into_raw_fd(), local_addr))
}

/// The accept loop: one thread, one ring, one multishot-accept entry.
/// Accepted descriptors get TCP_NODELAY and are dealt round-robin to the
/// reactor queues.
pub(crate) struct Acceptor {
    config: AcceptorConfig,
    ring: IoUring,
    listen_fd: RawFd,
    reactor_txs: Vec<Sender<RawFd>>,
    next_reactor: usize,
    running: Arc<AtomicBool>,
    wait_ts: Timespec,
    cqe_scratch: Vec<(u64, i32, u32)>,
}

impl Acceptor {
    /// Create the acceptor on its own thread (single-issuer rings bind to
    /// the creating task).
    pub(crate) fn new(
        config: AcceptorConfig,
        listen_fd: RawFd,
        reactor_txs: Vec<Sender<RawFd>>,
        running: Arc<AtomicBool>,
    ) -> Result<Self, Error> {
        let ring = build_ring(
            config.sq_entries,
            config.sqpoll,
            config.sqpoll_idle_ms,
            config.sqpoll_cpu,
        )?;
        let wait_ts = Timespec::new()
            .sec(config.wait_timeout_ns / 1_000_000_000)
            .nsec((config.wait_timeout_ns % 1_000_000_000) as u32);
        Ok(Acceptor {
            cqe_scratch: Vec::with_capacity(config.accept_batch),
            config,
            ring,
            listen_fd,
            reactor_txs,
            next_reactor: 0,
            running,
            wait_ts,
        })
    }

    pub(crate) fn run(&mut self) -> Result<(), Error> {
        info!("acceptor running");
        self.arm_accept()?;
        loop {
            if !self.running.load(Ordering::Acquire) {
                info!("acceptor shutting down");
                return Ok(());
            }
            self.process_completions();
            self.submit_and_wait()?;
        }
    }

    fn process_completions(&mut self) {
        self.cqe_scratch.clear();
        {
            let cq = self.ring.completion();
            for cqe in cq.take(self.config.accept_batch) {
                self.cqe_scratch
                    .push((cqe.user_data(), cqe.result(), cqe.flags()));
            }
        }

        let mut rearm = false;
        for i in 0..self.cqe_scratch.len() {
            let (ud_raw, result, flags) = self.cqe_scratch[i];
            if UserData(ud_raw).kind() != Some(OpKind::Accept) {
                continue;
            }
            if !cqueue::more(flags) {
                rearm = true;
            }
            if result < 0 {
                // Multishot accept is self-sustaining; a failed accept is
                // logged and tolerated.
                ACCEPT_ERRORS.increment();
                warn!(errno = -result, "accept completion failed");
                continue;
            }
            self.dispatch(result as RawFd);
        }

        if rearm && self.running.load(Ordering::Acquire) {
            if let Err(e) = self.arm_accept() {
                warn!(error = %e, "failed to re-arm multishot accept");
            }
        }
    }

    /// Hand a new descriptor to the next reactor in the rotation.
    fn dispatch(&mut self, fd: RawFd) {
        if self.config.tcp_nodelay {
            set_tcp_nodelay(fd);
        }
        let tx = &self.reactor_txs[self.next_reactor % self.reactor_txs.len()];
        self.next_reactor = self.next_reactor.wrapping_add(1);
        if tx.send(fd).is_err() {
            // Reactor already gone (shutdown race).
            unsafe {
                libc::close(fd);
            }
        }
    }

    fn arm_accept(&mut self) -> Result<(), Error> {
        let ud = UserData::encode(OpKind::Accept, self.listen_fd);
        let entry = opcode::AcceptMulti::new(Fd(self.listen_fd))
            .build()
            .user_data(ud.raw());
        unsafe { self.push_sqe(entry).map_err(Error::Io) }
    }

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

    fn submit_and_wait(&mut self) -> Result<(), Error> {
        let args = SubmitArgs::new().timespec(&self.wait_ts);
        match self.ring.submitter().submit_with_args(1, &args) {
            Ok(_) => Ok(()),
            Err(e) => match e.raw_os_error() {
                Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY) => Ok(()),
                _ => Err(Error::Io(e)),
            },
        }
    }
}

fn set_tcp_nodelay(fd: RawFd) {
    let optval: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}
