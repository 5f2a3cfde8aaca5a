//! One-shot readiness barrier
//!
//! Configuration registers every service with the barrier and then
//! seals it; each service arrives the first time its registry turns
//! non-empty. The callback fires on the arrival that satisfies the last
//! registered service, exactly once. Sealing an empty barrier fires the
//! callback synchronously.

use std::sync::Mutex;

/// Callback invoked once all configured services have an endpoint.
pub type ReadyCallback = Box<dyn FnOnce() + Send>;

struct Inner {
    pending: usize,
    sealed: bool,
    callback: Option<ReadyCallback>,
}

pub struct ReadyBarrier {
    inner: Mutex<Inner>,
}

impl ReadyBarrier {
    pub fn new(callback: Option<ReadyCallback>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: 0,
                sealed: false,
                callback,
            }),
        }
    }

    /// Count one configured service.
    pub fn register(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending += 1;
    }

    /// Finish registration; with nothing registered the callback fires
    /// here.
    pub fn seal(&self) {
        let callback = {
            let mut inner = self.inner.lock().unwrap();
            inner.sealed = true;
            inner.take_if_ready()
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Record one service's first endpoint.
    pub fn arrive(&self) {
        let callback = {
            let mut inner = self.inner.lock().unwrap();
            inner.pending = inner.pending.saturating_sub(1);
            inner.take_if_ready()
        };
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl Inner {
    fn take_if_ready(&mut self) -> Option<ReadyCallback> {
        if self.sealed && self.pending == 0 {
            self.callback.take()
        } else {
            None
        }
    }
}
