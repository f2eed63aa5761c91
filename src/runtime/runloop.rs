//! The per-thread work loop shared by engine and extension-group threads.
//!
//! A [`Runloop`] is a queue of tasks drained by exactly one owning thread,
//! plus the foreign-thread hand-off protocol: any thread may post tasks
//! (per-submitting-thread FIFO), and a foreign thread may acquire *lock
//! mode*, which parks the owning loop at a task boundary and holds it there
//! until release. Both are built on [`Waitable`] rather than raw atomics so
//! the owning loop cannot starve while the gate is contended.

use std::collections::VecDeque;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::core::errors::{PlexusError, Result};
use crate::core::waitable::{Timeout, Waitable};

#[derive(Debug)]
struct LoopState<T> {
    queue: VecDeque<T>,
    lock_depth: u32,
    lock_owner: Option<ThreadId>,
    /// True while the owning thread sits at a task boundary (waiting), false
    /// while it is executing a task.
    at_boundary: bool,
    stopping: bool,
}

/// What a bounded pop produced.
pub enum Polled<T> {
    Task(T),
    TimedOut,
    /// Stop was requested and the queue is drained.
    Stopped,
}

pub struct Runloop<T> {
    state: Waitable<LoopState<T>>,
}

impl<T> Clone for Runloop<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Send> Runloop<T> {
    pub fn new() -> Self {
        Self {
            state: Waitable::new(LoopState {
                queue: VecDeque::new(),
                lock_depth: 0,
                lock_owner: None,
                at_boundary: true,
                stopping: false,
            }),
        }
    }

    /// Enqueues a task. Posting stays legal while the loop drains toward a
    /// stop; it fails only once the loop has fully stopped.
    pub fn post(&self, task: T) -> Result<()> {
        self.state.update(|s| {
            s.queue.push_back(task);
        })
    }

    /// Blocking pop honoring the lock-mode gate. Returns `None` once stop
    /// was requested and the queue is empty. Owning-thread only.
    pub fn next(&self) -> Result<Option<T>> {
        let polled = self.poll(None)?;
        match polled {
            Polled::Task(t) => Ok(Some(t)),
            Polled::Stopped => Ok(None),
            Polled::TimedOut => unreachable!("unbounded poll cannot time out"),
        }
    }

    /// Bounded pop for loops that also service deadlines. Owning-thread only.
    pub fn next_before(&self, deadline: Option<Instant>) -> Result<Polled<T>> {
        self.poll(deadline)
    }

    fn poll(&self, deadline: Option<Instant>) -> Result<Polled<T>> {
        loop {
            let timeout = match deadline {
                None => Timeout::Never,
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        Timeout::NoWait
                    } else {
                        Timeout::After(d - now)
                    }
                }
            };
            let popped = self.state.wait_then(
                |s| s.lock_depth == 0 && (!s.queue.is_empty() || s.stopping),
                timeout,
                |s| {
                    if let Some(task) = s.queue.pop_front() {
                        s.at_boundary = false;
                        Some(task)
                    } else {
                        None // stopping with an empty queue
                    }
                },
            )?;
            match popped {
                Some(Some(task)) => return Ok(Polled::Task(task)),
                Some(None) => return Ok(Polled::Stopped),
                None => {
                    // Timed out; a lock-mode holder may have kept us parked
                    // past the deadline, which is exactly the contract.
                    if deadline.is_some() {
                        return Ok(Polled::TimedOut);
                    }
                }
            }
        }
    }

    /// Marks the owning thread as parked between tasks. Called by the loop
    /// after finishing each task.
    pub fn task_done(&self) -> Result<()> {
        self.state.update(|s| s.at_boundary = true)
    }

    /// Requests the loop to exit once the queue is drained.
    pub fn request_stop(&self) -> Result<()> {
        self.state.update(|s| s.stopping = true)
    }

    pub fn is_stopping(&self) -> Result<bool> {
        self.state.read(|s| s.stopping)
    }

    /// Acquires lock mode for the calling thread, blocking until any other
    /// holder releases and the owning loop is parked at a task boundary.
    /// Re-acquisition by the current holder nests.
    pub fn lock_acquire(&self) -> Result<()> {
        let me = thread::current().id();
        self.state.wait_then(
            move |s| s.lock_depth == 0 || s.lock_owner == Some(me),
            Timeout::Never,
            move |s| {
                s.lock_owner = Some(me);
                s.lock_depth += 1;
            },
        )?;
        // Wait out any task the owning thread was already executing.
        self.state
            .wait_until(|s| s.at_boundary, Timeout::Never)
            .map(|_| ())
    }

    /// Releases one level of lock mode. Releasing without holding it is a
    /// lifecycle violation.
    pub fn lock_release(&self) -> Result<()> {
        let me = thread::current().id();
        self.state.update(move |s| {
            if s.lock_owner != Some(me) || s.lock_depth == 0 {
                return Err(PlexusError::lifecycle(
                    "runloop",
                    "lock mode released by a thread that does not hold it",
                ));
            }
            s.lock_depth -= 1;
            if s.lock_depth == 0 {
                s.lock_owner = None;
            }
            Ok(())
        })?
    }

    /// Outstanding lock-mode depth; nonzero at group stop is a fatal,
    /// reported error for that group.
    pub fn lock_depth(&self) -> Result<u32> {
        self.state.read(|s| s.lock_depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_fifo_per_submitter() {
        let rl: Runloop<u32> = Runloop::new();
        for i in 0..5 {
            rl.post(i).unwrap();
        }
        rl.request_stop().unwrap();
        let mut seen = Vec::new();
        while let Some(t) = rl.next().unwrap() {
            seen.push(t);
            rl.task_done().unwrap();
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_lock_mode_parks_the_loop() {
        let rl: Runloop<u32> = Runloop::new();
        let counter = Arc::new(AtomicU32::new(0));

        let loop_rl = rl.clone();
        let loop_counter = counter.clone();
        let owner = thread::spawn(move || {
            while let Some(v) = loop_rl.next().unwrap() {
                loop_counter.fetch_add(v, Ordering::SeqCst);
                loop_rl.task_done().unwrap();
            }
        });

        rl.lock_acquire().unwrap();
        rl.post(10).unwrap();
        thread::sleep(Duration::from_millis(50));
        // Parked: the task must not have run while we hold the gate.
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        rl.lock_release().unwrap();
        rl.request_stop().unwrap();
        owner.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_lock_mode_nests() {
        let rl: Runloop<u32> = Runloop::new();
        rl.lock_acquire().unwrap();
        rl.lock_acquire().unwrap();
        assert_eq!(rl.lock_depth().unwrap(), 2);
        rl.lock_release().unwrap();
        assert_eq!(rl.lock_depth().unwrap(), 1);
        rl.lock_release().unwrap();
        assert_eq!(rl.lock_depth().unwrap(), 0);
    }

    #[test]
    fn test_release_without_hold_is_lifecycle_error() {
        let rl: Runloop<u32> = Runloop::new();
        let err = rl.lock_release().unwrap_err();
        assert_eq!(err.category(), "lifecycle");
    }

    #[test]
    fn test_bounded_poll_times_out() {
        let rl: Runloop<u32> = Runloop::new();
        let deadline = Instant::now() + Duration::from_millis(30);
        match rl.next_before(Some(deadline)).unwrap() {
            Polled::TimedOut => {}
            _ => panic!("expected timeout"),
        }
    }
}
