// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cancellation for blocking waits.

use parking_lot::Condvar;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

/// Granularity of waits that must also observe a [`CancelToken`] they cannot
/// be woken by.
pub(crate) const WAIT_SLICE: Duration = Duration::from_millis(5);

/// A shared flag that interrupts blocking driver calls.
///
/// Clones observe the same flag. Once cancelled, a token stays cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        *self.inner.cancelled.lock() = true;
        self.inner.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }

    /// Sleeps for `duration` or until the token is cancelled.
    ///
    /// Returns `false` if the sleep was cut short by cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut cancelled = self.inner.cancelled.lock();
        while !*cancelled {
            if self
                .inner
                .cond
                .wait_until(&mut cancelled, deadline)
                .timed_out()
            {
                return !*cancelled;
            }
        }
        false
    }
}
