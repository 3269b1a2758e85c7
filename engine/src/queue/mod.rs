//! Lock-free ring primitives: the per-connection SPSC inbound ring and
//! the MPSC queues that carry buffer returns and flush requests into a
//! reactor.

pub mod mpsc;
pub mod spsc;

pub use mpsc::{SeqQueue, TailQueue};
pub use spsc::SpscRing;
