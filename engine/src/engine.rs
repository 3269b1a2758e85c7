use std::future::Future;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use io_uring::{Probe, opcode};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::acceptor::{Acceptor, create_listener};
use crate::buffer::BufferRing;
use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::connection::Connection;
use crate::error::Error;
use crate::reactor::{Accepted, Reactor, build_ring};

/// Check whether the running kernel offers everything the engine needs:
/// multishot accept, multishot receive with provided buffer rings, and
/// the single-issuer/deferred-taskrun setup flags.
pub fn supported() -> bool {
    let Ok(ring) = build_ring(8, false, 1000, None) else {
        return false;
    };
    let mut probe = Probe::new();
    if ring.submitter().register_probe(&mut probe).is_err() {
        return false;
    }
    if !probe.is_supported(opcode::AcceptMulti::CODE)
        || !probe.is_supported(opcode::RecvMulti::CODE)
        || !probe.is_supported(opcode::Send::CODE)
    {
        return false;
    }
    let Ok(bufs) = BufferRing::new(8, 4096, false) else {
        return false;
    };
    unsafe {
        ring.submitter()
            .register_buf_ring_with_flags(bufs.ring_addr(), bufs.entries(), 0, 0)
            .is_ok()
    }
}

/// Wakers parked on [`Engine::accept_async`]. Reactors fire these after
/// publishing a connection.
pub(crate) struct AcceptWakers {
    wakers: Mutex<Vec<Waker>>,
}

impl AcceptWakers {
    fn new() -> Self {
        AcceptWakers {
            wakers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn register(&self, waker: &Waker) {
        let mut wakers = self.wakers.lock();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    pub(crate) fn wake_all(&self) {
        let wakers = std::mem::take(&mut *self.wakers.lock());
        for waker in wakers {
            waker.wake();
        }
    }
}

/// The engine façade: binds the listener, owns the acceptor and reactor
/// threads, and hands accepted [`Connection`]s to the caller.
pub struct Engine {
    config: EngineConfig,
    running: Arc<AtomicBool>,
    accept_rx: Receiver<Accepted>,
    accept_tx: Option<Sender<Accepted>>,
    accept_wakers: Arc<AcceptWakers>,
    listen_fd: Option<RawFd>,
    local_addr: SocketAddr,
    threads: Vec<thread::JoinHandle<Result<(), Error>>>,
    started: bool,
}

impl Engine {
    /// Validate the configuration and bind the listener. Construction
    /// failures surface here; no threads are started.
    pub fn new(config: EngineConfig) -> Result<Self, Error> {
        config.validate()?;
        ensure_nofile_limit(&config)?;

        let bind_addr = SocketAddr::new(config.addr, config.port);
        let (listen_fd, local_addr) =
            create_listener(bind_addr, config.backlog, config.acceptor.family)?;
        info!(%local_addr, reactors = config.reactors, "engine bound");

        let (accept_tx, accept_rx) = crossbeam_channel::unbounded();

        Ok(Engine {
            config,
            running: Arc::new(AtomicBool::new(false)),
            accept_rx,
            accept_tx: Some(accept_tx),
            accept_wakers: Arc::new(AcceptWakers::new()),
            listen_fd: Some(listen_fd),
            local_addr,
            threads: Vec::new(),
            started: false,
        })
    }

    /// The bound listener address (with the resolved port when 0 was
    /// requested).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawn the acceptor and reactor threads. Non-blocking; returns once
    /// every thread has reported its ring setup result.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.started {
            return Err(Error::Config("engine already started".into()));
        }
        let accept_tx = self
            .accept_tx
            .take()
            .ok_or_else(|| Error::Config("engine already started".into()))?;
        self.running.store(true, Ordering::Release);

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(self.config.reactors + 1);

        let mut reactor_txs = Vec::with_capacity(self.config.reactors);
        for i in 0..self.config.reactors {
            let (fd_tx, fd_rx) = crossbeam_channel::unbounded::<RawFd>();
            reactor_txs.push(fd_tx);

            let reactor_config = self.config.reactor_config(i);
            let publish_tx = accept_tx.clone();
            let wakers = self.accept_wakers.clone();
            let running = self.running.clone();
            let ready = ready_tx.clone();
            let pin = self
                .config
                .pin_to_core
                .then_some(self.config.core_offset + i);

            let handle = thread::Builder::new()
                .name(format!("riptide-reactor-{i}"))
                .spawn(move || -> Result<(), Error> {
                    let setup = (|| -> Result<Reactor, Error> {
                        if let Some(core) = pin {
                            pin_to_core(core)?;
                        }
                        Reactor::new(i, reactor_config, fd_rx, publish_tx, wakers, running)
                    })();
                    match setup {
                        Ok(mut reactor) => {
                            let _ = ready.send(Ok(()));
                            reactor.run()
                        }
                        Err(e) => {
                            let _ = ready.send(Err(e));
                            Ok(())
                        }
                    }
                })
                .map_err(Error::Io)?;
            self.threads.push(handle);
        }
        drop(accept_tx);

        let acceptor_config = self.config.acceptor.clone();
        let listen_fd = self.listen_fd.expect("listener is bound in new()");
        let running = self.running.clone();
        let ready = ready_tx.clone();
        let handle = thread::Builder::new()
            .name("riptide-acceptor".to_string())
            .spawn(move || -> Result<(), Error> {
                match Acceptor::new(acceptor_config, listen_fd, reactor_txs, running) {
                    Ok(mut acceptor) => {
                        let _ = ready.send(Ok(()));
                        acceptor.run()
                    }
                    Err(e) => {
                        let _ = ready.send(Err(e));
                        Ok(())
                    }
                }
            })
            .map_err(Error::Io)?;
        self.threads.push(handle);
        drop(ready_tx);

        self.started = true;

        // Every thread reports its ring construction result before start
        // returns; any failure tears the engine back down.
        for _ in 0..self.config.reactors + 1 {
            match ready_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.stop();
                    return Err(e);
                }
                Err(_) => {
                    self.stop();
                    return Err(Error::RingSetup("engine thread died during setup".into()));
                }
            }
        }

        info!("engine started");
        Ok(())
    }

    /// Wait for the next accepted connection. Resolves `None` once the
    /// engine stops or the token is cancelled. Connections torn down
    /// between publication and dequeue are skipped.
    pub fn accept_async(&self, cancel: &CancelToken) -> AcceptFuture<'_> {
        AcceptFuture {
            engine: self,
            cancel: cancel.clone(),
        }
    }

    /// Stop the engine: drop the running flag, release accept waiters,
    /// join every thread, close the listener.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.accept_wakers.wake_all();
        for handle in self.threads.drain(..) {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "engine thread exited with error"),
                Err(_) => warn!("engine thread panicked"),
            }
        }
        if let Some(fd) = self.listen_fd.take() {
            unsafe {
                libc::close(fd);
            }
        }
        if self.started {
            info!("engine stopped");
        }
        self.started = false;
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Future returned by [`Engine::accept_async`].
pub struct AcceptFuture<'a> {
    engine: &'a Engine,
    cancel: CancelToken,
}

impl Future for AcceptFuture<'_> {
    type Output = Option<Arc<Connection>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let engine = self.engine;
        loop {
            if self.cancel.is_cancelled() {
                return Poll::Ready(None);
            }
            match engine.accept_rx.try_recv() {
                Ok(accepted) => {
                    if accepted.conn.generation() != accepted.generation
                        || accepted.conn.is_closed()
                    {
                        // Torn down between publication and dequeue.
                        continue;
                    }
                    return Poll::Ready(Some(accepted.conn));
                }
                Err(TryRecvError::Disconnected) => return Poll::Ready(None),
                Err(TryRecvError::Empty) => {
                    engine.accept_wakers.register(cx.waker());
                    self.cancel.register(cx.waker());
                    if self.cancel.is_cancelled() || !engine.running.load(Ordering::Acquire) {
                        return Poll::Ready(None);
                    }
                    // One more look to close the race with a publish that
                    // fired before the waker was registered.
                    match engine.accept_rx.try_recv() {
                        Ok(accepted) => {
                            if accepted.conn.generation() != accepted.generation
                                || accepted.conn.is_closed()
                            {
                                continue;
                            }
                            return Poll::Ready(Some(accepted.conn));
                        }
                        Err(TryRecvError::Disconnected) => return Poll::Ready(None),
                        Err(TryRecvError::Empty) => return Poll::Pending,
                    }
                }
            }
        }
    }
}

/// Raise the soft RLIMIT_NOFILE when the configured connection counts
/// need it. Errors only when the hard limit is genuinely too low.
fn ensure_nofile_limit(config: &EngineConfig) -> Result<(), Error> {
    let mut required: u64 = 0;
    for i in 0..config.reactors {
        required += config.reactor_config(i).max_connections as u64;
    }
    // Ring fds, the listener, stdio, and some slack.
    required += 8 * config.reactors as u64 + 64;

    let mut rlim: libc::rlimit = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) };
    if ret != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }

    if rlim.rlim_cur >= required {
        return Ok(());
    }

    if rlim.rlim_max >= required || rlim.rlim_max == libc::RLIM_INFINITY {
        rlim.rlim_cur = if rlim.rlim_max == libc::RLIM_INFINITY {
            required
        } else {
            std::cmp::min(required, rlim.rlim_max)
        };
        let ret = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) };
        if ret != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    } else {
        Err(Error::ResourceLimit(format!(
            "RLIMIT_NOFILE too low: need {} but hard limit is {}. Raise it with: ulimit -n {}",
            required, rlim.rlim_max, required
        )))
    }
}

/// Pin the current thread to a CPU core.
fn pin_to_core(core: usize) -> Result<(), Error> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if ret != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}
