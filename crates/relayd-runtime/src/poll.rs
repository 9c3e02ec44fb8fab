//! epoll wrapper
//!
//! One `Poller` per worker plus one process-wide shared instance for
//! listening sockets. The shared instance's own descriptor is registered in
//! every worker epoll with `EPOLLEXCLUSIVE`, so a readiness edge wakes one
//! worker where the kernel supports it.

use std::os::unix::io::RawFd;

use relayd_core::{Result, RuntimeError};

use crate::events::{epoll_interest, PollData, PollEvents};

/// How many events one wait call can surface.
pub const MAX_EVENTS: usize = 256;

/// An epoll instance.
#[derive(Debug)]
pub struct Poller {
    epfd: RawFd,
}

impl Poller {
    pub fn new() -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(RuntimeError::last_os());
        }
        Ok(Self { epfd })
    }

    /// The instance's own descriptor (pollable like any other fd).
    pub fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }

    /// Register `fd` with the given interest, binding `data` as its event
    /// payload. The descriptor must be non-blocking; handlers run on an
    /// event loop that must never sleep in them.
    ///
    /// # Safety
    ///
    /// `data` must point to a `PollData` (or a record embedding one as its
    /// first field) that stays valid and pinned until after the descriptor
    /// has been removed from this instance.
    pub unsafe fn add(
        &self,
        fd: RawFd,
        events: PollEvents,
        data: *mut PollData,
        exclusive: bool,
    ) -> Result<()> {
        require_nonblocking(fd)?;
        ctl_add(self.epfd, fd, events, data, exclusive)
    }

    /// Deregister `fd`.
    pub fn remove(&self, fd: RawFd) -> Result<()> {
        ctl_del(self.epfd, fd)
    }

    /// Wait for events. `timeout_ms` of 0 polls; −1 blocks indefinitely.
    /// An interrupted wait reports zero events.
    pub fn wait(&self, buf: &mut [libc::epoll_event], timeout_ms: i32) -> Result<usize> {
        wait_fd(self.epfd, buf, timeout_ms)
    }
}

/// Reject descriptors that are not in non-blocking mode.
///
/// Applied to every externally-supplied registration. The runtime's own
/// nested registrations (queue eventfd, the shared epoll fd inside each
/// worker epoll) bypass this: an epoll descriptor does not carry
/// O_NONBLOCK at all, and readiness on it never blocks a worker.
pub(crate) fn require_nonblocking(fd: RawFd) -> Result<()> {
    if fd < 0 {
        return Err(RuntimeError::BadDescriptor(fd));
    }
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 || flags & libc::O_NONBLOCK == 0 {
        return Err(RuntimeError::BadDescriptor(fd));
    }
    Ok(())
}

/// Raw-fd form of [`Poller::add`], minus the non-blocking gate; internal
/// registrations come through here directly.
///
/// # Safety
///
/// See [`Poller::add`].
pub(crate) unsafe fn ctl_add(
    epfd: RawFd,
    fd: RawFd,
    events: PollEvents,
    data: *mut PollData,
    exclusive: bool,
) -> Result<()> {
    if fd < 0 {
        return Err(RuntimeError::BadDescriptor(fd));
    }

    let mut bits = epoll_interest(events);
    if exclusive {
        bits |= libc::EPOLLEXCLUSIVE as u32;
    }
    let mut ev = libc::epoll_event {
        events: bits,
        u64: data as u64,
    };
    if libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) < 0 {
        return Err(ctl_error(fd));
    }
    (*data).set_interest(events);
    Ok(())
}

/// Raw-fd form of [`Poller::remove`].
pub(crate) fn ctl_del(epfd: RawFd, fd: RawFd) -> Result<()> {
    let rc = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
    if rc < 0 {
        return Err(ctl_error(fd));
    }
    Ok(())
}

/// Raw-fd form of [`Poller::wait`].
pub(crate) fn wait_fd(
    epfd: RawFd,
    buf: &mut [libc::epoll_event],
    timeout_ms: i32,
) -> Result<usize> {
    let n = unsafe { libc::epoll_wait(epfd, buf.as_mut_ptr(), buf.len() as i32, timeout_ms) };
    if n < 0 {
        let errno = unsafe { *libc::__errno_location() };
        if errno == libc::EINTR {
            return Ok(0);
        }
        return Err(RuntimeError::Os(errno));
    }
    Ok(n as usize)
}

impl Drop for Poller {
    fn drop(&mut self) {
        if self.epfd >= 0 {
            unsafe {
                libc::close(self.epfd);
            }
            self.epfd = -1;
        }
    }
}

fn ctl_error(fd: RawFd) -> RuntimeError {
    let errno = unsafe { *libc::__errno_location() };
    match errno {
        libc::EEXIST => RuntimeError::AlreadyRegistered(fd),
        libc::ENOENT => RuntimeError::NotRegistered(fd),
        libc::EBADF | libc::EINVAL | libc::EPERM => RuntimeError::BadDescriptor(fd),
        _ => RuntimeError::Os(errno),
    }
}

/// Make a descriptor non-blocking.
pub fn set_nonblocking(fd: RawFd) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(RuntimeError::BadDescriptor(fd));
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(RuntimeError::last_os());
        }
    }
    Ok(())
}
