//! Guarded value with a wait queue: the blocking primitive under every
//! higher-level wait in the runtime (runloop queues, lock-mode gating,
//! engine-ready and shutdown-drain conditions).

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::core::errors::{PlexusError, Result};

/// How long a [`Waitable::wait_until`] call may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Single non-blocking predicate check.
    NoWait,
    /// Block up to the given duration.
    After(Duration),
    /// Block until the predicate holds.
    Never,
}

impl Timeout {
    /// Interprets a signed millisecond count the way the wire config does:
    /// zero is a non-blocking check, negative waits forever.
    pub fn from_millis(ms: i64) -> Self {
        if ms < 0 {
            Timeout::Never
        } else if ms == 0 {
            Timeout::NoWait
        } else {
            Timeout::After(Duration::from_millis(ms as u64))
        }
    }
}

/// Outcome of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The predicate held while the lock was owned.
    Satisfied,
    /// The timeout elapsed with the predicate still false.
    TimedOut,
}

/// A guarded value plus wait queue. Cloning shares the underlying state.
///
/// Every mutation broadcasts to all waiters; the predicate is re-checked
/// under the lock after every wake, so there are no lost wakeups and no
/// spurious successes.
#[derive(Debug)]
pub struct Waitable<T> {
    inner: Arc<(Mutex<T>, Condvar)>,
}

impl<T> Clone for Waitable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Waitable<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new((Mutex::new(initial), Condvar::new())),
        }
    }

    fn guard(&self) -> Result<MutexGuard<'_, T>> {
        self.inner
            .0
            .lock()
            .map_err(|_| PlexusError::internal("waitable mutex poisoned"))
    }

    /// Replaces the value and wakes all waiters.
    pub fn set(&self, value: T) -> Result<()> {
        *self.guard()? = value;
        self.inner.1.notify_all();
        Ok(())
    }

    /// Mutates the value in place and wakes all waiters.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let r = f(&mut *self.guard()?);
        self.inner.1.notify_all();
        Ok(r)
    }

    /// Reads through the lock without waking anyone.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        Ok(f(&*self.guard()?))
    }

    pub fn get(&self) -> Result<T>
    where
        T: Clone,
    {
        Ok(self.guard()?.clone())
    }

    /// Blocks until `pred` holds or `timeout` elapses.
    pub fn wait_until(
        &self,
        mut pred: impl FnMut(&T) -> bool,
        timeout: Timeout,
    ) -> Result<WaitOutcome> {
        let mut guard = self.guard()?;
        if pred(&guard) {
            return Ok(WaitOutcome::Satisfied);
        }
        match timeout {
            Timeout::NoWait => Ok(WaitOutcome::TimedOut),
            Timeout::Never => {
                while !pred(&guard) {
                    guard = self
                        .inner
                        .1
                        .wait(guard)
                        .map_err(|_| PlexusError::internal("waitable mutex poisoned"))?;
                }
                Ok(WaitOutcome::Satisfied)
            }
            Timeout::After(dur) => {
                let deadline = Instant::now() + dur;
                loop {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(WaitOutcome::TimedOut);
                    }
                    let (g, _wtr) = self
                        .inner
                        .1
                        .wait_timeout(guard, deadline - now)
                        .map_err(|_| PlexusError::internal("waitable mutex poisoned"))?;
                    guard = g;
                    if pred(&guard) {
                        return Ok(WaitOutcome::Satisfied);
                    }
                }
            }
        }
    }

    /// Waits for `pred`, then runs `f` with the lock still held. The
    /// predicate cannot flip between the wait and the action.
    pub fn wait_then<R>(
        &self,
        mut pred: impl FnMut(&T) -> bool,
        timeout: Timeout,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<Option<R>> {
        let mut guard = self.guard()?;
        if !pred(&guard) {
            match timeout {
                Timeout::NoWait => return Ok(None),
                Timeout::Never => {
                    while !pred(&guard) {
                        guard = self
                            .inner
                            .1
                            .wait(guard)
                            .map_err(|_| PlexusError::internal("waitable mutex poisoned"))?;
                    }
                }
                Timeout::After(dur) => {
                    let deadline = Instant::now() + dur;
                    loop {
                        let now = Instant::now();
                        if now >= deadline {
                            return Ok(None);
                        }
                        let (g, _wtr) = self
                            .inner
                            .1
                            .wait_timeout(guard, deadline - now)
                            .map_err(|_| PlexusError::internal("waitable mutex poisoned"))?;
                        guard = g;
                        if pred(&guard) {
                            break;
                        }
                    }
                }
            }
        }
        let r = f(&mut guard);
        drop(guard);
        self.inner.1.notify_all();
        Ok(Some(r))
    }
}
