//! Call serialization for a protocol handle
//!
//! libssh2 handles are not reentrant: at most one library call may run on a
//! session (and its channels and SFTP handles) at a time. `CallSerializer`
//! owns the handle state behind a mutex and counts callers that have entered
//! but not yet left, so teardown can drain in-flight work before freeing.

use parking_lot::{Condvar, Mutex};

pub struct CallSerializer<T> {
    state: Mutex<T>,
    in_flight: Mutex<usize>,
    idle: Condvar,
}

/// Decrements the in-flight count when the caller leaves, however it leaves.
struct InFlight<'a, T> {
    owner: &'a CallSerializer<T>,
}

impl<T> Drop for InFlight<'_, T> {
    fn drop(&mut self) {
        let mut count = self.owner.in_flight.lock();
        *count -= 1;
        if *count == 0 {
            self.owner.idle.notify_all();
        }
    }
}

impl<T> CallSerializer<T> {
    pub fn new(state: T) -> Self {
        Self {
            state: Mutex::new(state),
            in_flight: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    fn enter(&self) -> InFlight<'_, T> {
        *self.in_flight.lock() += 1;
        InFlight { owner: self }
    }

    /// Run `body` with exclusive access to the guarded state.
    pub fn with_exclusive_access<R>(&self, body: impl FnOnce(&mut T) -> R) -> R {
        let _in_flight = self.enter();
        let mut state = self.state.lock();
        body(&mut state)
    }

    /// Block until no caller is inside or waiting for `with_exclusive_access`.
    pub fn wait_for_idle(&self) {
        let mut count = self.in_flight.lock();
        while *count > 0 {
            self.idle.wait(&mut count);
        }
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.lock()
    }

    /// Direct access when the serializer itself is exclusively borrowed.
    pub fn get_mut(&mut self) -> &mut T {
        self.state.get_mut()
    }
}
