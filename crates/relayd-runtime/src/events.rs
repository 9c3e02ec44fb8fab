//! Event masks and the poll capability record
//!
//! `PollData` is the contract between the runtime and anything that
//! registers a descriptor: a record whose leading fields sit at stable
//! offsets so the runtime can reach the handler and owner without knowing
//! the concrete type. Collaborators embed it as the first field of their
//! own `#[repr(C)]` struct and recover themselves by pointer cast inside
//! the handler.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

bitflags::bitflags! {
    /// Event classes delivered to and returned by poll handlers.
    ///
    /// `ACCEPT` doubles as registration interest: a descriptor registered
    /// with `ACCEPT` has its input readiness delivered as `ACCEPT` instead
    /// of `READ`, which is how accept counters stay separate from read
    /// counters without the runtime inspecting socket types.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollEvents: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const ERROR = 1 << 2;
        const HANGUP = 1 << 3;
        const ACCEPT = 1 << 4;
    }
}

/// Handler bound to a registered descriptor.
///
/// Invoked on the worker that pulled the event; `worker_id` identifies it
/// for routing decisions. The return value is the residual mask: event
/// classes the handler serviced but did not fully drain, to be re-delivered
/// on the next loop iteration. Returning `empty()` means everything was
/// consumed.
///
/// # Safety
///
/// `data` is the pointer that was passed to registration; the handler may
/// cast it to the containing record. It is only valid while the
/// registration contract holds (see [`PollData`]).
pub type PollHandler = unsafe fn(data: *mut PollData, worker_id: i32, events: PollEvents) -> PollEvents;

/// Owner id recorded for descriptors in the shared set: the handler may run
/// on any worker.
pub const SHARED_OWNER_ID: i32 = 0;

/// Owner id of a `PollData` that is not currently registered anywhere.
pub const NO_OWNER_ID: i32 = -1;

/// Poll registration record.
///
/// The runtime stores the raw pointer in the kernel event payload, so the
/// record must stay valid (and pinned at its address) from registration
/// until after removal. Worker ids are 1-based; `owner` is
/// [`SHARED_OWNER_ID`] for shared-set registrations and [`NO_OWNER_ID`]
/// while unregistered.
#[repr(C)]
#[derive(Debug)]
pub struct PollData {
    /// Handler that knows how to service events for the embedding record.
    pub handler: PollHandler,
    /// Id of the owning worker; maintained by the runtime.
    owner: AtomicI32,
    /// Interest mask recorded at registration; drives READ/ACCEPT
    /// translation on delivery.
    interest: AtomicU32,
}

impl PollData {
    pub fn new(handler: PollHandler) -> Self {
        Self {
            handler,
            owner: AtomicI32::new(NO_OWNER_ID),
            interest: AtomicU32::new(0),
        }
    }

    /// The worker id this descriptor is registered with, `SHARED_OWNER_ID`
    /// in the shared set, or `NO_OWNER_ID` when unregistered.
    pub fn owner_id(&self) -> i32 {
        self.owner.load(Ordering::Acquire)
    }

    pub(crate) fn set_owner(&self, id: i32) {
        self.owner.store(id, Ordering::Release);
    }

    pub(crate) fn set_interest(&self, events: PollEvents) {
        self.interest.store(events.bits(), Ordering::Release);
    }

    pub(crate) fn interest(&self) -> PollEvents {
        PollEvents::from_bits_truncate(self.interest.load(Ordering::Acquire))
    }
}

/// Map an interest mask onto epoll interest bits.
pub(crate) fn epoll_interest(events: PollEvents) -> u32 {
    let mut bits = 0;
    if events.intersects(PollEvents::READ | PollEvents::ACCEPT) {
        bits |= libc::EPOLLIN as u32;
    }
    if events.contains(PollEvents::WRITE) {
        bits |= libc::EPOLLOUT as u32;
    }
    // ERROR and HANGUP are always reported by the kernel.
    bits
}

/// Translate raw epoll readiness into delivered event classes, using the
/// registration interest to tell accepts from reads.
pub(crate) fn translate(raw: u32, interest: PollEvents) -> PollEvents {
    let mut events = PollEvents::empty();
    if raw & libc::EPOLLIN as u32 != 0 {
        if interest.contains(PollEvents::ACCEPT) {
            events |= PollEvents::ACCEPT;
        } else {
            events |= PollEvents::READ;
        }
    }
    if raw & libc::EPOLLOUT as u32 != 0 {
        events |= PollEvents::WRITE;
    }
    if raw & libc::EPOLLERR as u32 != 0 {
        events |= PollEvents::ERROR;
    }
    if raw & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
        events |= PollEvents::HANGUP;
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn nop_handler(_: *mut PollData, _: i32, _: PollEvents) -> PollEvents {
        PollEvents::empty()
    }

    #[test]
    fn test_new_is_unowned() {
        let data = PollData::new(nop_handler);
        assert_eq!(data.owner_id(), NO_OWNER_ID);
        assert!(data.interest().is_empty());
    }

    #[test]
    fn test_epoll_interest_mapping() {
        assert_eq!(
            epoll_interest(PollEvents::READ),
            libc::EPOLLIN as u32
        );
        assert_eq!(
            epoll_interest(PollEvents::ACCEPT),
            libc::EPOLLIN as u32
        );
        assert_eq!(
            epoll_interest(PollEvents::READ | PollEvents::WRITE),
            libc::EPOLLIN as u32 | libc::EPOLLOUT as u32
        );
    }

    #[test]
    fn test_translate_accept_interest() {
        let raw = libc::EPOLLIN as u32;
        assert_eq!(translate(raw, PollEvents::READ), PollEvents::READ);
        assert_eq!(translate(raw, PollEvents::ACCEPT), PollEvents::ACCEPT);
    }

    #[test]
    fn test_translate_error_and_hangup() {
        let raw = (libc::EPOLLERR | libc::EPOLLHUP) as u32;
        assert_eq!(
            translate(raw, PollEvents::READ),
            PollEvents::ERROR | PollEvents::HANGUP
        );
    }
}
