use std::io;

use thiserror::Error;

/// Errors surfaced by the engine.
///
/// Network conditions are reported per connection through
/// [`ReadSnapshot`](crate::connection::ReadSnapshot) closed flags and error
/// codes; the variants here cover construction failures and caller
/// contract violations, which are kept strictly apart.
#[derive(Debug, Error)]
pub enum Error {
    /// io_uring setup or syscall failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Ring setup failed (unsupported kernel features, bad flags).
    #[error("ring setup: {0}")]
    RingSetup(String),

    /// Invalid configuration (bad address, capacity not a power of two).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// RLIMIT_NOFILE too low for the configured connection count.
    #[error("resource limit: {0}")]
    ResourceLimit(String),

    /// The connection was closed; carries the raw errno (0 for clean EOF).
    #[error("connection closed (errno {0})")]
    Closed(i32),

    /// The write slab has insufficient remaining capacity.
    #[error("write slab full")]
    WriteSlabFull,

    /// A programming fault: write during flush, double waiter, span
    /// overflow. Never produced by network conditions.
    #[error("connection contract violated: {0}")]
    ContractViolation(&'static str),
}
