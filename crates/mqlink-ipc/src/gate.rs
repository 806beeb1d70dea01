//! Counting wait/signal gate
//!
//! A semaphore whose permits carry a value. The dispatcher thread signals
//! (or fails) the gate and a caller thread waits on it. Permits are counted,
//! so a signal that lands before the wait starts is never lost.
//!
//! The producer side can also wait for the number of pending permits to drop
//! below a limit, which is how a bounded inbox pushes back on the dispatcher.
//!
//! ```rust,ignore
//! let gate = Gate::new();
//! gate.signal(42);
//! assert_eq!(gate.wait(Some(Duration::from_millis(10)))?, 42);
//! ```

use crate::channel::IpcError;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

struct GateState<T> {
    permits: VecDeque<Result<T, IpcError>>,
    closed: bool,
}

/// Counting gate carrying a result per permit
pub struct Gate<T> {
    state: Mutex<GateState<T>>,
    cond: Condvar,
    /// Signalled whenever a permit is taken or dropped
    room: Condvar,
}

impl<T> Gate<T> {
    /// Create a gate with no permits
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                permits: VecDeque::new(),
                closed: false,
            }),
            cond: Condvar::new(),
            room: Condvar::new(),
        }
    }

    /// Add a successful permit and wake one waiter. Never blocks.
    pub fn signal(&self, value: T) {
        self.push(Ok(value));
    }

    /// Add a failed permit; the next waiter receives `err`
    pub fn fail(&self, err: IpcError) {
        self.push(Err(err));
    }

    fn push(&self, permit: Result<T, IpcError>) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.permits.push_back(permit);
        drop(state);
        self.cond.notify_one();
    }

    /// Put a permit taken by `wait` back at the front
    pub(crate) fn restore(&self, value: T) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.permits.push_front(Ok(value));
        drop(state);
        self.cond.notify_one();
    }

    /// Take one permit, blocking up to `timeout` (`None` waits forever).
    ///
    /// Fails with `Timeout` when the deadline passes and with `Closed` once
    /// the gate has been closed.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<T, IpcError> {
        // A timeout too large to represent waits forever.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(IpcError::Closed);
            }
            if let Some(permit) = self.take(&mut state) {
                return permit;
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        // A permit may have arrived together with the timeout.
                        if state.closed {
                            return Err(IpcError::Closed);
                        }
                        return self.take(&mut state).unwrap_or(Err(IpcError::Timeout));
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
    }

    /// Take a permit if one is available
    pub fn try_wait(&self) -> Option<Result<T, IpcError>> {
        let mut state = self.state.lock();
        if state.closed {
            return Some(Err(IpcError::Closed));
        }
        self.take(&mut state)
    }

    fn take(&self, state: &mut GateState<T>) -> Option<Result<T, IpcError>> {
        let permit = state.permits.pop_front()?;
        self.room.notify_all();
        Some(permit)
    }

    /// Block until fewer than `limit` permits are pending or `bypass`
    /// returns true.
    ///
    /// `bypass` is evaluated with the gate locked; whoever changes its
    /// outcome must call [`notify_room`](Self::notify_room) afterwards.
    /// Returns `false` once the gate is closed.
    pub(crate) fn wait_for_room(&self, limit: usize, bypass: impl Fn() -> bool) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return false;
            }
            if state.permits.len() < limit || bypass() {
                return true;
            }
            self.room.wait(&mut state);
        }
    }

    /// Wake a producer blocked in [`wait_for_room`](Self::wait_for_room)
    pub(crate) fn notify_room(&self) {
        let _state = self.state.lock();
        self.room.notify_all();
    }

    /// Drop all pending permits without closing the gate
    pub(crate) fn clear(&self) {
        let mut state = self.state.lock();
        state.permits.clear();
        drop(state);
        self.room.notify_all();
    }

    /// Number of permits not yet taken
    pub fn pending(&self) -> usize {
        self.state.lock().permits.len()
    }

    /// Drop all permits and fail every current and future waiter with `Closed`
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.permits.clear();
        drop(state);
        self.cond.notify_all();
        self.room.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl<T> Default for Gate<T> {
    fn default() -> Self {
        Self::new()
    }
}
