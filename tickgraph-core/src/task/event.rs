//! Wake events.
//!
//! An auto-reset flag plus condition variable. A trigger that arrives before
//! the waiter starts waiting is remembered, so a push-then-trigger racing a
//! pop-then-wait never loses the wakeup. Callers always re-check their queue
//! after waking.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
pub(crate) struct WakeEvent {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl WakeEvent {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn trigger(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        drop(signaled);
        self.cond.notify_all();
    }

    /// Block until triggered or the timeout elapses. Returns whether the
    /// event was triggered; the flag is consumed either way.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut signaled = self.signaled.lock();
        if !*signaled {
            self.cond.wait_for(&mut signaled, timeout);
        }
        std::mem::replace(&mut *signaled, false)
    }
}
