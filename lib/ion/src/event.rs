use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A single-shot completion event. Waiters block until `signal` is called
/// once; the event then stays signalled.
pub struct Event {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    #[inline]
    pub fn new() -> Event {
        Event {
            state: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Signals the event, releasing all current and future waiters.
    #[inline]
    pub fn signal(&self) {
        let mut signalled = self.state.lock().expect("Event lock poisoned");
        *signalled = true;
        self.cond.notify_all();
    }

    /// Blocks until the event is signalled.
    #[inline]
    pub fn wait(&self) {
        let mut signalled = self.state.lock().expect("Event lock poisoned");
        while !*signalled {
            signalled = self.cond.wait(signalled).expect("Event lock poisoned");
        }
    }

    /// Blocks until the event is signalled or the timeout elapses. Returns
    /// true if the event fired.
    #[inline]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut signalled = self.state.lock().expect("Event lock poisoned");
        while !*signalled {
            let (guard, result) = self
                .cond
                .wait_timeout(signalled, timeout)
                .expect("Event lock poisoned");
            signalled = guard;
            if result.timed_out() {
                return *signalled;
            }
        }
        true
    }

    /// Returns true if the event has been signalled.
    #[inline]
    pub fn is_signalled(&self) -> bool {
        *self.state.lock().expect("Event lock poisoned")
    }
}
