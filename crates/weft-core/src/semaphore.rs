//! Counting semaphore built on a mutex and condition variable.
//!
//! Used only for the thread construction handshake, where blocking the
//! constructor is acceptable.

use std::sync::{Condvar, Mutex};

/// Counting semaphore. `wait` decrements when the count is positive and
/// sleeps otherwise; `signal` increments and wakes one waiter.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    /// Create a semaphore with the given initial count
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Block until the count is positive, then decrement it
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Increment the count and wake one waiter
    pub fn signal(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cond.notify_one();
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new(0)
    }
}
