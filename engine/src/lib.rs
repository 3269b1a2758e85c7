//! riptide: an io_uring-native TCP server engine for Linux.
//!
//! One acceptor thread owns the listening socket and a multishot-accept
//! ring; accepted descriptors are dealt round-robin to N reactor threads,
//! each owning its own ring, a kernel-registered buffer slab, and a map of
//! connections. Handlers run wherever the caller likes (any work-stealing
//! async runtime works); each [`Connection`] is the rendezvous between its
//! reactor and one handler task.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use riptide::{CancelToken, Connection, Engine, EngineConfig};
//!
//! async fn echo(conn: Arc<Connection>) {
//!     loop {
//!         let snapshot = conn.read_async().await;
//!         let mut wrote = false;
//!         while let Some(item) = conn.try_get_ring(&snapshot) {
//!             conn.write(item.as_slice()).unwrap();
//!             conn.return_ring(item.buffer_id());
//!             wrote = true;
//!         }
//!         if wrote {
//!             let _ = conn.flush_async().unwrap().await;
//!         }
//!         if snapshot.is_closed() {
//!             return;
//!         }
//!         conn.reset_read();
//!     }
//! }
//!
//! # async fn run() -> Result<(), riptide::Error> {
//! let mut engine = Engine::new(EngineConfig::default())?;
//! engine.start()?;
//! let cancel = CancelToken::new();
//! while let Some(conn) = engine.accept_async(&cancel).await {
//!     tokio::spawn(echo(conn));
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Platform
//!
//! Linux 6.0+ only. Requires io_uring with multishot accept, multishot
//! recv, and ring-provided buffers; incremental buffer consumption
//! additionally needs 6.12+. Check [`supported()`] before starting.

pub(crate) mod acceptor;
pub mod buffer;
pub mod cancel;
pub mod completion;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod queue;
pub(crate) mod reactor;
pub(crate) mod waiter;

// Public API re-exports
pub use cancel::CancelToken;
pub use completion::{OpKind, UserData};
pub use config::{AcceptorConfig, EngineConfig, IpFamily, ReactorConfig};
pub use connection::{Connection, FlushFuture, ReadFuture, ReadSnapshot, RingItem};
pub use engine::{AcceptFuture, Engine, supported};
pub use error::Error;
