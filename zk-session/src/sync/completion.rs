//! Ordered hand-off from the I/O side to the delivery context.
//!
//! The engine pushes items as replies and events arrive; one consumer pops
//! them in order and runs user callbacks outside any engine lock. Once
//! finished, the queue refuses new items and consumers drain what is left,
//! then see `None`.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use minstant::Instant;

/// Timeout specification for blocking operations.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    finished: bool,
}

/// Multi-producer FIFO with a blocking pop and a one-way finish.
#[derive(Debug)]
pub struct CompletionQueue<T> {
    state: Mutex<QueueState<T>>,
    ready: Condvar,
}

impl<T> Default for CompletionQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CompletionQueue<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                finished: false,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        // A panicking callback never runs under this lock.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `item`.
    ///
    /// # Errors
    ///
    /// Hands `item` back if the queue is finished.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut state = self.lock();
        if state.finished {
            return Err(item);
        }
        state.items.push_back(item);
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Pops the oldest item without waiting.
    pub fn pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Pops the oldest item, waiting up to `timeout` for one.
    ///
    /// Returns `None` on timeout, or once the queue is finished and empty.
    pub fn pop_blocking(&self, timeout: Timeout) -> Option<T> {
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Duration(d) => Some(Instant::now() + d),
        };
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.finished {
                return None;
            }
            state = match deadline {
                None => self
                    .ready
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(dl) => {
                    let left = dl.checked_duration_since(Instant::now())?;
                    self.ready
                        .wait_timeout(state, left)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Stops accepting items and wakes every waiter. Returns `true` on the
    /// first call.
    pub fn finish(&self) -> bool {
        let mut state = self.lock();
        let first = !state.finished;
        state.finished = true;
        drop(state);
        self.ready.notify_all();
        first
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }
}
