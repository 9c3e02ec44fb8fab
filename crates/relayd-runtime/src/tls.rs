//! Thread-local worker identity
//!
//! Each worker thread pins its id and a pointer to its private half here
//! at the top of `run`, so code executing on the thread — tasks, handlers,
//! inline posts — can find "its" worker without going through the pool.

use std::cell::Cell;
use std::ptr;

use crate::worker::Worker;

thread_local! {
    /// Current worker id; −1 off worker threads.
    static CURRENT_WORKER_ID: Cell<i32> = const { Cell::new(-1) };

    /// Private half of the current worker; null off worker threads.
    static CURRENT_WORKER: Cell<*const Worker> = const { Cell::new(ptr::null()) };
}

/// Pin the calling thread to a worker. Runtime-internal.
pub(crate) fn set_current(worker: &Worker) {
    CURRENT_WORKER_ID.with(|cell| cell.set(worker.id()));
    CURRENT_WORKER.with(|cell| cell.set(worker as *const Worker));
}

/// Unpin the calling thread; done when a worker's loop exits.
pub(crate) fn clear_current() {
    CURRENT_WORKER_ID.with(|cell| cell.set(-1));
    CURRENT_WORKER.with(|cell| cell.set(ptr::null()));
}

/// Worker id of the calling thread, or −1 if this is not a worker thread.
#[inline]
pub fn current_worker_id() -> i32 {
    CURRENT_WORKER_ID.with(|cell| cell.get())
}

/// Run `f` with the calling thread's worker, if any.
///
/// The pointer is set and cleared by the worker thread itself, so inside
/// `f` the reference is valid: the worker cannot exit while its own thread
/// is in here.
pub(crate) fn with_current<R>(f: impl FnOnce(Option<&Worker>) -> R) -> R {
    let ptr = CURRENT_WORKER.with(|cell| cell.get());
    if ptr.is_null() {
        f(None)
    } else {
        f(Some(unsafe { &*ptr }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_off_worker_defaults() {
        assert_eq!(current_worker_id(), -1);
        with_current(|w| assert!(w.is_none()));
    }
}
