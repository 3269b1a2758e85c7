//! Engine counters, registered for metriken exposition.

use metriken::{Counter, metric};

#[metric(
    name = "riptide_connections_accepted",
    description = "Connections accepted and dispatched to a reactor"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "riptide_connections_closed",
    description = "Connections torn down (EOF, error, overflow, or stop)"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "riptide_recv_completions",
    description = "Receive completions carrying data"
)]
pub static RECV_COMPLETIONS: Counter = Counter::new();

#[metric(
    name = "riptide_send_completions",
    description = "Send completions observed by reactors"
)]
pub static SEND_COMPLETIONS: Counter = Counter::new();

#[metric(
    name = "riptide_ring_overflows",
    description = "Connections closed because a handler fell behind its inbound ring"
)]
pub static RING_OVERFLOWS: Counter = Counter::new();

#[metric(
    name = "riptide_buffers_recycled",
    description = "Receive buffers republished to a reactor's buffer ring"
)]
pub static BUFFERS_RECYCLED: Counter = Counter::new();

#[metric(
    name = "riptide_accept_errors",
    description = "Accept completions with a negative result (logged and tolerated)"
)]
pub static ACCEPT_ERRORS: Counter = Counter::new();
