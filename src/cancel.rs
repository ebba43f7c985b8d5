//! Cooperative cancellation for blocking waits.
//!
//! A [`CancellationToken`] is shared by every worker of a run. Waits go
//! through [`Sleeper::sleep`] so a cancel request wakes them immediately
//! instead of letting a cooldown or `Retry-After` pause run to completion.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::XrefError;

pub trait Sleeper: Send + Sync {
    /// Blocks for `duration` unless the run is cancelled first.
    fn sleep(&self, duration: Duration) -> Result<(), XrefError>;
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation and wakes every pending sleeper.
    pub fn cancel(&self) {
        let mut cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !*cancelled {
            *cancelled = true;
            self.inner.wake.notify_all();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn check(&self) -> Result<(), XrefError> {
        if self.is_cancelled() {
            return Err(XrefError::Cancelled);
        }
        Ok(())
    }
}

impl Sleeper for CancellationToken {
    fn sleep(&self, duration: Duration) -> Result<(), XrefError> {
        let deadline = Instant::now() + duration;
        let mut cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            if *cancelled {
                return Err(XrefError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let (guard, _) = self
                .inner
                .wake
                .wait_timeout(cancelled, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            cancelled = guard;
        }
    }
}
