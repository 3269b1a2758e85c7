use std::sync::atomic::{AtomicU8, Ordering};
use std::task::Waker;

use parking_lot::Mutex;

const IDLE: u8 = 0;
const ARMED: u8 = 1;
const NOTIFIED: u8 = 2;

/// One-shot single-waiter completion primitive.
///
/// At most one suspended waiter at a time. The waker slot is written
/// before the armed state is published, so a notifier that wins the
/// `ARMED -> NOTIFIED` transition always finds a waker to fire. The CAS
/// transfers signalling responsibility: the producer that loses it falls
/// back to a side channel (the connection's `pending` flag).
///
/// Generation keying lives in the futures that use this primitive; the
/// waiter itself is state-free across reuses after [`reset`](Waiter::reset).
pub(crate) struct Waiter {
    state: AtomicU8,
    waker: Mutex<Option<Waker>>,
}

impl Waiter {
    pub(crate) const fn new() -> Self {
        Waiter {
            state: AtomicU8::new(IDLE),
            waker: Mutex::new(None),
        }
    }

    /// Consume a stale notification left by a resolved or dropped waiter.
    pub(crate) fn consume_stale(&self) {
        let _ = self
            .state
            .compare_exchange(NOTIFIED, IDLE, Ordering::AcqRel, Ordering::Relaxed);
    }

    /// Arm the waiter. Returns false if a waiter is already armed, which
    /// is a caller contract violation.
    pub(crate) fn arm(&self, waker: &Waker) -> bool {
        *self.waker.lock() = Some(waker.clone());
        self.state
            .compare_exchange(IDLE, ARMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Refresh the stored waker on a spurious re-poll while armed.
    pub(crate) fn update(&self, waker: &Waker) {
        let mut slot = self.waker.lock();
        match &*slot {
            Some(existing) if existing.will_wake(waker) => {}
            _ => *slot = Some(waker.clone()),
        }
    }

    /// Disarm without consuming a signal. Returns true on success; false
    /// means a notification raced in first (consume it with
    /// [`consume`](Waiter::consume)).
    pub(crate) fn disarm(&self) -> bool {
        self.state
            .compare_exchange(ARMED, IDLE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Producer side: signal the armed waiter, if any. Returns true when
    /// the waiter was claimed and woken; false transfers responsibility
    /// back to the caller.
    pub(crate) fn notify(&self) -> bool {
        if self
            .state
            .compare_exchange(ARMED, NOTIFIED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
        true
    }

    /// Consume a delivered notification. Returns true if one was pending.
    pub(crate) fn consume(&self) -> bool {
        self.state
            .compare_exchange(NOTIFIED, IDLE, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.state.load(Ordering::Acquire) == ARMED
    }

    /// Force the primitive back to idle and drop any stored waker.
    pub(crate) fn reset(&self) {
        self.state.store(IDLE, Ordering::Release);
        self.waker.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_waker() -> (Arc<CountingWaker>, Waker) {
        let inner = Arc::new(CountingWaker(AtomicUsize::new(0)));
        (inner.clone(), Waker::from(inner))
    }

    #[test]
    fn notify_wakes_armed_waiter() {
        let waiter = Waiter::new();
        let (count, waker) = counting_waker();
        assert!(waiter.arm(&waker));
        assert!(waiter.notify());
        assert_eq!(count.0.load(Ordering::SeqCst), 1);
        assert!(waiter.consume());
    }

    #[test]
    fn notify_without_waiter_returns_false() {
        let waiter = Waiter::new();
        assert!(!waiter.notify());
    }

    #[test]
    fn double_arm_fails() {
        let waiter = Waiter::new();
        let (_, waker) = counting_waker();
        assert!(waiter.arm(&waker));
        assert!(!waiter.arm(&waker));
    }

    #[test]
    fn disarm_loses_to_notify() {
        let waiter = Waiter::new();
        let (_, waker) = counting_waker();
        assert!(waiter.arm(&waker));
        assert!(waiter.notify());
        assert!(!waiter.disarm());
        assert!(waiter.consume());
    }

    #[test]
    fn reset_allows_rearm() {
        let waiter = Waiter::new();
        let (_, waker) = counting_waker();
        assert!(waiter.arm(&waker));
        waiter.reset();
        assert!(waiter.arm(&waker));
    }
}
