//! Counting semaphore
//!
//! The completion signal attached to posted tasks. A worker raises the
//! semaphore after running a task; the poster waits for one raise per
//! worker involved. Waits may carry a deadline: expiry reports timeout but
//! never consumes raises, so the poster can keep the task alive and retry.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Raise the semaphore once.
    pub fn post(&self) {
        self.post_n(1);
    }

    /// Raise the semaphore `n` times.
    pub fn post_n(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut count = self.count.lock().unwrap();
        *count += n;
        if n == 1 {
            self.cond.notify_one();
        } else {
            self.cond.notify_all();
        }
    }

    /// Wait for one raise.
    pub fn wait(&self) {
        self.wait_n(1);
    }

    /// Wait until `n` raises have accumulated, consuming them.
    pub fn wait_n(&self, n: usize) {
        let mut count = self.count.lock().unwrap();
        while *count < n {
            count = self.cond.wait(count).unwrap();
        }
        *count -= n;
    }

    /// Wait for `n` raises with a deadline.
    ///
    /// Returns true if the raises were consumed, false on expiry. On expiry
    /// nothing is consumed; raises arriving later stay claimable.
    pub fn wait_timeout(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock().unwrap();
        while *count < n {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self.cond.wait_timeout(count, deadline - now).unwrap();
            count = guard;
            if result.timed_out() && *count < n {
                return false;
            }
        }
        *count -= n;
        true
    }

    /// Current raise count (diagnostics only; stale immediately).
    pub fn value(&self) -> usize {
        *self.count.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_post_then_wait() {
        let sem = Semaphore::new();
        sem.post();
        sem.wait();
        assert_eq!(sem.value(), 0);
    }

    #[test]
    fn test_wait_n_accumulates() {
        let sem = Arc::new(Semaphore::new());
        let mut handles = vec![];
        for _ in 0..4 {
            let sem = Arc::clone(&sem);
            handles.push(thread::spawn(move || sem.post()));
        }
        sem.wait_n(4);
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(sem.value(), 0);
    }

    #[test]
    fn test_timeout_expires() {
        let sem = Semaphore::new();
        assert!(!sem.wait_timeout(1, Duration::from_millis(20)));
    }

    #[test]
    fn test_timeout_does_not_consume() {
        let sem = Semaphore::new();
        sem.post();
        // Needs two raises, only one available: times out...
        assert!(!sem.wait_timeout(2, Duration::from_millis(20)));
        // ...and the one raise is still there.
        assert!(sem.wait_timeout(1, Duration::from_millis(20)));
    }

    #[test]
    fn test_cross_thread_wakeup() {
        let sem = Arc::new(Semaphore::new());
        let poster = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                sem.post_n(3);
            })
        };
        assert!(sem.wait_timeout(3, Duration::from_secs(5)));
        poster.join().unwrap();
    }
}
