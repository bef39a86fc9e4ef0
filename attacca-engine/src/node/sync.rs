//! Counting semaphore for worker-thread parking
//!
//! The decoding and event threads block here when idle; enqueue operations,
//! the render callback, and shutdown all signal. `signal` takes an
//! uncontended mutex for a bounded instant, which is the audited exception
//! to the render callback's no-locking rule (see the render module).

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// A counting semaphore built on a mutex and condvar.
pub(crate) struct Semaphore {
    permits: Mutex<u64>,
    condvar: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            permits: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    /// Add one permit and wake one waiter.
    pub fn signal(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        drop(permits);
        self.condvar.notify_one();
    }

    /// Take one permit, blocking until one is available.
    pub fn wait(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.condvar.wait(&mut permits);
        }
        *permits -= 1;
    }

    /// Take one permit, giving up after `timeout`.
    ///
    /// Returns true when a permit was taken.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut permits = self.permits.lock();
        while *permits == 0 {
            if self.condvar.wait_until(&mut permits, deadline).timed_out() {
                return false;
            }
        }
        *permits -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn signal_then_wait_does_not_block() {
        let sem = Semaphore::new();
        sem.signal();
        sem.wait();
    }

    #[test]
    fn permits_accumulate() {
        let sem = Semaphore::new();
        sem.signal();
        sem.signal();
        assert!(sem.wait_timeout(Duration::from_millis(10)));
        assert!(sem.wait_timeout(Duration::from_millis(10)));
        assert!(!sem.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn wait_timeout_expires_without_permit() {
        let sem = Semaphore::new();
        assert!(!sem.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn cross_thread_signal_wakes_waiter() {
        let sem = Arc::new(Semaphore::new());
        let signaler = Arc::clone(&sem);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signaler.signal();
        });
        assert!(sem.wait_timeout(Duration::from_secs(5)));
        handle.join().unwrap();
    }
}
