//! Per-worker message queue
//!
//! Bounded multi-producer single-consumer queue of fixed-size messages,
//! surfaced to the worker's epoll through an eventfd. Producers push from
//! any thread — including async-signal context: the ring is lock-free and
//! allocation-free on push, and the eventfd write is an async-signal-safe
//! syscall. Multiple posts before the consumer runs coalesce into a single
//! wakeup (eventfd counter semantics).
//!
//! Ordering: pushes from one producer are consumed in submission order; no
//! cross-producer order is promised.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use relayd_core::{Result, RuntimeError, Semaphore};

use crate::task::Task;

/// A task shared between the poster and the runtime.
pub type TaskRef = Arc<dyn Task>;

/// The records the queue transports. Task posts carry shared-ownership
/// handles; everything else is plain words.
pub enum Message {
    /// Run a task the poster retains; raise the signal once `execute`
    /// has returned.
    RunTask {
        task: TaskRef,
        signal: Option<Arc<Semaphore>>,
    },
    /// Run a task owned by the runtime; dropped after execution, freed when
    /// the last pending holder lets go.
    RunDisposable { task: TaskRef },
    /// Observe the shutdown flag on the next loop iteration.
    Shutdown,
    /// No-op; exists to rouse a blocked wait.
    Wake,
    /// Application-defined message.
    User { id: u32, arg1: i64, arg2: i64 },
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::RunTask { signal, .. } => f
                .debug_struct("RunTask")
                .field("signalled", &signal.is_some())
                .finish(),
            Message::RunDisposable { .. } => f.debug_struct("RunDisposable").finish(),
            Message::Shutdown => write!(f, "Shutdown"),
            Message::Wake => write!(f, "Wake"),
            Message::User { id, arg1, arg2 } => f
                .debug_struct("User")
                .field("id", id)
                .field("arg1", arg1)
                .field("arg2", arg2)
                .finish(),
        }
    }
}

/// Bounded MPSC queue with an eventfd readiness signal.
#[derive(Debug)]
pub struct MessageQueue {
    ring: ArrayQueue<Message>,
    efd: RawFd,
}

impl MessageQueue {
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let efd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if efd < 0 {
            return Err(RuntimeError::last_os());
        }
        Ok(Self {
            ring: ArrayQueue::new(capacity),
            efd,
        })
    }

    /// The descriptor the owning worker registers with its poller.
    pub fn event_fd(&self) -> RawFd {
        self.efd
    }

    /// Enqueue a message. Callable from any thread and from signal context.
    ///
    /// Success means the record is enqueued and the consumer will be woken.
    /// `QueueFull` means the message was not delivered; the caller may
    /// retry.
    pub fn post(&self, msg: Message) -> Result<()> {
        self.ring.push(msg).map_err(|_| RuntimeError::QueueFull)?;

        let one: u64 = 1;
        let rc = unsafe {
            libc::write(
                self.efd,
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if rc < 0 {
            let errno = unsafe { *libc::__errno_location() };
            // EAGAIN means the counter is saturated: a wakeup is already
            // pending, which is all we need.
            if errno != libc::EAGAIN {
                return Err(RuntimeError::Os(errno));
            }
        }
        Ok(())
    }

    /// Clear the eventfd counter. Consumer side only.
    pub(crate) fn clear_signal(&self) {
        let mut value: u64 = 0;
        unsafe {
            libc::read(
                self.efd,
                &mut value as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }

    /// Pop one message. Consumer side only.
    pub(crate) fn pop(&self) -> Option<Message> {
        self.ring.pop()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        if self.efd >= 0 {
            unsafe {
                libc::close(self.efd);
            }
            self.efd = -1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn readable(fd: RawFd) -> bool {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        unsafe { libc::poll(&mut pfd, 1, 0) == 1 }
    }

    #[test]
    fn test_post_signals_eventfd() {
        let q = MessageQueue::with_capacity(8).unwrap();
        assert!(!readable(q.event_fd()));

        q.post(Message::Wake).unwrap();
        q.post(Message::Wake).unwrap();
        // Coalesced into one readable signal.
        assert!(readable(q.event_fd()));

        q.clear_signal();
        assert!(!readable(q.event_fd()));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_backpressure() {
        let q = MessageQueue::with_capacity(2).unwrap();
        q.post(Message::Wake).unwrap();
        q.post(Message::Wake).unwrap();
        assert_eq!(q.post(Message::Wake), Err(RuntimeError::QueueFull));
        // The refused message was not delivered.
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_single_producer_fifo() {
        let q = MessageQueue::with_capacity(64).unwrap();
        for i in 0..10 {
            q.post(Message::User {
                id: i,
                arg1: 0,
                arg2: 0,
            })
            .unwrap();
        }
        for i in 0..10 {
            match q.pop().unwrap() {
                Message::User { id, .. } => assert_eq!(id, i),
                other => panic!("unexpected message {:?}", other),
            }
        }
        assert!(q.is_empty());
    }

    #[test]
    fn test_concurrent_producers_deliver_everything() {
        let q = std::sync::Arc::new(MessageQueue::with_capacity(1024).unwrap());
        let mut handles = vec![];
        for t in 0..4u32 {
            let q = std::sync::Arc::clone(&q);
            handles.push(thread::spawn(move || {
                for i in 0..100u32 {
                    q.post(Message::User {
                        id: t * 1000 + i,
                        arg1: 0,
                        arg2: 0,
                    })
                    .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut per_producer_last: [i64; 4] = [-1; 4];
        let mut total = 0;
        while let Some(msg) = q.pop() {
            if let Message::User { id, .. } = msg {
                let producer = (id / 1000) as usize;
                let seq = (id % 1000) as i64;
                // FIFO per producer.
                assert!(seq > per_producer_last[producer]);
                per_producer_last[producer] = seq;
                total += 1;
            }
        }
        assert_eq!(total, 400);
    }
}
