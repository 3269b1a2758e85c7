//! Kernel-provided receive buffers: the per-reactor slab registered as an
//! io_uring buffer ring, with optional incremental consumption.

pub mod ring;

pub use ring::BufferRing;
