//! The worker: one thread, one epoll, one event loop
//!
//! A worker is split in two:
//!
//! - [`WorkerHandle`] — the shared half. Held by the pool and by anyone who
//!   wants to post work; all fields are atomics, the lock-free queue, or
//!   the epoll instance (whose syscalls are thread-safe).
//! - [`Worker`] — the private half. Owned by the worker thread; sessions,
//!   zombies, pending events and callbacks live here and are only ever
//!   touched on that thread.
//!
//! The loop: wait (with the load tracker told on both sides of the wait),
//! dispatch ready events plus residuals from the previous iteration, reap
//! zombies, then check for shutdown. After shutdown is initiated the queue
//! descriptor leaves the epoll set and the loop drains the ring directly
//! with zero-timeout polls until it is empty.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use relayd_core::registry::Registry;
use relayd_core::{clock, rwarn, Result, RuntimeError, Semaphore};

use crate::events::{translate, PollData, PollEvents, PollHandler};
use crate::load::{Granularity, LoadTracker};
use crate::poll::{self, Poller, MAX_EVENTS};
use crate::queue::{Message, MessageQueue, TaskRef};
use crate::stats::Statistics;
use crate::task::{ExecuteMode, Session, Zombie};
use crate::tls;

/// Worker lifecycle states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped = 0,
    Idle = 1,
    Polling = 2,
    Processing = 3,
    ZombieProcessing = 4,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => WorkerState::Idle,
            2 => WorkerState::Polling,
            3 => WorkerState::Processing,
            4 => WorkerState::ZombieProcessing,
            _ => WorkerState::Stopped,
        }
    }
}

/// Published load values, written by the owning worker once per period.
#[derive(Debug, Default)]
struct LoadValues {
    second: AtomicU32,
    minute: AtomicU32,
    hour: AtomicU32,
}

/// The shared half of a worker. Everything here may be touched from any
/// thread; writes to the statistics, state and load fields come only from
/// the owning worker, so readers see stale-but-valid values.
#[derive(Debug)]
pub struct WorkerHandle {
    id: i32,
    state: AtomicU8,
    should_shutdown: AtomicBool,
    shutdown_initiated: AtomicBool,
    /// Set once `run` has returned; posts are refused from then on.
    finished: AtomicBool,
    poller: Poller,
    queue: MessageQueue,
    stats: Statistics,
    load: LoadValues,
    descriptors_current: AtomicU32,
    descriptors_total: AtomicU64,
    /// fd → `PollData` pointer for descriptors currently in this worker's
    /// epoll; lets removal clear the record's owner id.
    registered: Mutex<HashMap<RawFd, usize>>,
}

impl WorkerHandle {
    /// The worker's id (1-based).
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Current state. May be stale the moment it is returned.
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Relaxed))
    }

    /// Whether shutdown has been requested.
    pub fn should_shutdown(&self) -> bool {
        self.should_shutdown.load(Ordering::Relaxed)
    }

    /// This worker's event loop counters.
    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    /// Load percentage at the given granularity.
    pub fn load(&self, granularity: Granularity) -> u8 {
        let values = &self.load;
        let v = match granularity {
            Granularity::OneSecond => values.second.load(Ordering::Relaxed),
            Granularity::OneMinute => values.minute.load(Ordering::Relaxed),
            Granularity::OneHour => values.hour.load(Ordering::Relaxed),
        };
        v as u8
    }

    /// Current and total descriptor counts.
    pub fn descriptor_counts(&self) -> (u32, u64) {
        (
            self.descriptors_current.load(Ordering::Relaxed),
            self.descriptors_total.load(Ordering::Relaxed),
        )
    }

    /// Add a descriptor to this worker's epoll instance and record this
    /// worker as its owner.
    ///
    /// # Safety
    ///
    /// `data` must stay valid and pinned until after `remove_fd`; see
    /// [`Poller::add`]. The descriptor must be non-blocking.
    pub unsafe fn add_fd(&self, fd: RawFd, events: PollEvents, data: *mut PollData) -> Result<()> {
        poll::require_nonblocking(fd)?;
        self.add_fd_inner(fd, events, data, false)
    }

    /// Registration without the non-blocking gate, for the worker's own
    /// conduits (the queue eventfd and the nested shared epoll fd).
    pub(crate) unsafe fn add_fd_inner(
        &self,
        fd: RawFd,
        events: PollEvents,
        data: *mut PollData,
        exclusive: bool,
    ) -> Result<()> {
        if self.finished.load(Ordering::Acquire) {
            return Err(RuntimeError::WorkerGone);
        }
        poll::ctl_add(self.poller.as_raw_fd(), fd, events, data, exclusive)?;
        (*data).set_owner(self.id);
        self.registered.lock().unwrap().insert(fd, data as usize);
        self.descriptors_current.fetch_add(1, Ordering::Relaxed);
        self.descriptors_total.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Remove a descriptor from this worker's epoll instance. The bound
    /// record's owner id is cleared.
    pub fn remove_fd(&self, fd: RawFd) -> Result<()> {
        self.remove_fd_inner(fd).map(|_| ())
    }

    pub(crate) fn remove_fd_inner(&self, fd: RawFd) -> Result<*mut PollData> {
        poll::ctl_del(self.poller.as_raw_fd(), fd)?;
        self.descriptors_current.fetch_sub(1, Ordering::Relaxed);
        let ptr = self
            .registered
            .lock()
            .unwrap()
            .remove(&fd)
            .unwrap_or(0) as *mut PollData;
        if !ptr.is_null() {
            // Registration requires the record to outlive removal.
            unsafe {
                (*ptr).set_owner(crate::events::NO_OWNER_ID);
            }
        }
        Ok(ptr)
    }

    /// Post a task for execution on this worker.
    ///
    /// The poster keeps its reference; once `execute` has returned the
    /// signal (if any) is raised. With [`ExecuteMode::Immediate`] the task
    /// runs inline when the caller is already on this worker's thread.
    pub fn post(
        &self,
        task: TaskRef,
        signal: Option<Arc<Semaphore>>,
        mode: ExecuteMode,
    ) -> Result<()> {
        if self.finished.load(Ordering::Acquire) {
            return Err(RuntimeError::WorkerGone);
        }
        if mode == ExecuteMode::Immediate && tls::current_worker_id() == self.id {
            let executed = tls::with_current(|w| match w {
                Some(worker) => {
                    task.execute(worker);
                    true
                }
                None => false,
            });
            if executed {
                if let Some(signal) = &signal {
                    signal.post();
                }
                return Ok(());
            }
        }
        self.queue.post(Message::RunTask { task, signal })
    }

    /// Post a task whose ownership passes to the runtime; it is dropped
    /// after execution.
    pub fn post_disposable(&self, task: TaskRef, mode: ExecuteMode) -> Result<()> {
        if self.finished.load(Ordering::Acquire) {
            return Err(RuntimeError::WorkerGone);
        }
        if mode == ExecuteMode::Immediate && tls::current_worker_id() == self.id {
            let executed = tls::with_current(|w| match w {
                Some(worker) => {
                    task.execute(worker);
                    true
                }
                None => false,
            });
            if executed {
                return Ok(());
            }
        }
        self.queue.post(Message::RunDisposable { task })
    }

    /// Post a plain message. Signal-safe: no allocation, no locks.
    ///
    /// Success means only that the message was enqueued, not that it has
    /// been seen by the worker.
    pub fn post_message(&self, id: u32, arg1: i64, arg2: i64) -> Result<()> {
        if self.finished.load(Ordering::Acquire) {
            return Err(RuntimeError::WorkerGone);
        }
        self.queue.post(Message::User { id, arg1, arg2 })
    }

    /// Initiate shutdown. Signal-safe. The worker drains its queue and
    /// stops on a following loop iteration; this only sets the flag and
    /// rouses a blocked wait.
    pub fn shutdown(&self) {
        self.should_shutdown.store(true, Ordering::Release);
        let _ = self.queue.post(Message::Wake);
    }

    pub(crate) fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }
}

/// A poll registration owned by the worker itself, with a back-pointer to
/// the private half. Bound at the top of `run`, once the worker has its
/// final address.
#[repr(C)]
struct Conduit {
    data: PollData,
    worker: Cell<*const Worker>,
}

impl Conduit {
    fn new(handler: PollHandler) -> Self {
        Self {
            data: PollData::new(handler),
            worker: Cell::new(std::ptr::null()),
        }
    }

    fn bind(&self, worker: &Worker) {
        self.worker.set(worker as *const Worker);
    }

    fn data_ptr(&self) -> *mut PollData {
        &self.data as *const PollData as *mut PollData
    }
}

/// A residual event awaiting re-delivery.
struct PendingEvent {
    data: *mut PollData,
    events: PollEvents,
    since_ms: u64,
}

/// The private half of a worker: the event loop and all single-threaded
/// state. Pinned to its thread for its entire lifetime.
pub struct Worker {
    handle: Arc<WorkerHandle>,
    /// The pool's shared epoll instance, polled through this worker's own
    /// epoll.
    shared_epfd: RawFd,
    load: RefCell<LoadTracker>,
    sessions: RefCell<Registry<Box<dyn Session>>>,
    zombies: RefCell<Vec<Box<dyn Zombie>>>,
    pending: RefCell<Vec<PendingEvent>>,
    shutdown_listeners: RefCell<Vec<Box<dyn FnOnce(&Worker)>>>,
    message_handler: RefCell<Option<Box<dyn Fn(&Worker, u32, i64, i64)>>>,
    queue_conduit: Conduit,
    shared_conduit: Conduit,
    nonblocking_polls: u32,
    maxwait_ms: u32,
}

// Safety: a Worker is moved to its thread before `run` and never leaves
// it. The non-Send contents (RefCell state, conduit back-pointers, boxed
// callbacks) are created and used only on that thread; the cross-thread
// surface is the Arc<WorkerHandle>.
unsafe impl Send for Worker {}

impl Worker {
    /// Create a worker with a pre-allocated epoll instance. `id` is
    /// 1-based; `shared_epfd` is the process-wide shared epoll instance.
    pub(crate) fn create(
        id: i32,
        queue_capacity: usize,
        nonblocking_polls: u32,
        maxwait_ms: u32,
        shared_epfd: RawFd,
    ) -> Result<Worker> {
        debug_assert!(id > 0);
        let handle = Arc::new(WorkerHandle {
            id,
            state: AtomicU8::new(WorkerState::Stopped as u8),
            should_shutdown: AtomicBool::new(false),
            shutdown_initiated: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            poller: Poller::new()?,
            queue: MessageQueue::with_capacity(queue_capacity)?,
            stats: Statistics::new(),
            load: LoadValues::default(),
            descriptors_current: AtomicU32::new(0),
            descriptors_total: AtomicU64::new(0),
            registered: Mutex::new(HashMap::new()),
        });

        Ok(Worker {
            handle,
            shared_epfd,
            load: RefCell::new(LoadTracker::new(clock::now_ms())),
            sessions: RefCell::new(Registry::new()),
            zombies: RefCell::new(Vec::new()),
            pending: RefCell::new(Vec::new()),
            shutdown_listeners: RefCell::new(Vec::new()),
            message_handler: RefCell::new(None),
            queue_conduit: Conduit::new(queue_conduit_handler),
            shared_conduit: Conduit::new(shared_conduit_handler),
            nonblocking_polls,
            maxwait_ms,
        })
    }

    pub fn id(&self) -> i32 {
        self.handle.id
    }

    /// The shared half.
    pub fn handle(&self) -> &Arc<WorkerHandle> {
        &self.handle
    }

    /// This worker's session registry. Owning thread only.
    pub fn session_registry(&self) -> &RefCell<Registry<Box<dyn Session>>> {
        &self.sessions
    }

    /// Register a connection-handle for destruction at the end of the
    /// current loop iteration. Owning thread only.
    pub fn register_zombie(&self, zombie: Box<dyn Zombie>) {
        debug_assert_eq!(tls::current_worker_id(), self.id());
        self.zombies.borrow_mut().push(zombie);
    }

    /// Run `listener` once, on this thread, when the worker initiates
    /// shutdown. Owning thread only.
    pub fn on_shutdown(&self, listener: Box<dyn FnOnce(&Worker)>) {
        self.shutdown_listeners.borrow_mut().push(listener);
    }

    /// Install the handler for `Message::User` records. Owning thread
    /// only; must not be replaced from inside the handler itself.
    pub fn set_message_handler(&self, handler: Box<dyn Fn(&Worker, u32, i64, i64)>) {
        *self.message_handler.borrow_mut() = Some(handler);
    }

    /// Register a descriptor with this worker. See [`WorkerHandle::add_fd`].
    ///
    /// # Safety
    ///
    /// Same contract as [`WorkerHandle::add_fd`].
    pub unsafe fn add_fd(&self, fd: RawFd, events: PollEvents, data: *mut PollData) -> Result<()> {
        self.handle.add_fd(fd, events, data)
    }

    /// Remove a descriptor from this worker, dropping any residual events
    /// still queued for it.
    pub fn remove_fd(&self, fd: RawFd) -> Result<()> {
        let ptr = self.handle.remove_fd_inner(fd)?;
        if !ptr.is_null() {
            self.pending.borrow_mut().retain(|p| p.data != ptr);
        }
        Ok(())
    }

    /// The worker's event loop. Runs on the calling thread until shutdown
    /// has been observed and the message queue drained.
    pub fn run(&self) {
        tls::set_current(self);
        self.queue_conduit.bind(self);
        self.shared_conduit.bind(self);

        let queue_fd = self.handle.queue.event_fd();
        // The queue and the shared instance are ordinary registrations in
        // this worker's own epoll; the shared epfd is exclusive so one
        // readiness edge wakes one worker.
        let result = unsafe {
            match self.handle.add_fd_inner(
                queue_fd,
                PollEvents::READ,
                self.queue_conduit.data_ptr(),
                false,
            ) {
                Ok(()) => self.handle.add_fd_inner(
                    self.shared_epfd,
                    PollEvents::READ,
                    self.shared_conduit.data_ptr(),
                    true,
                ),
                Err(e) => Err(e),
            }
        };
        if let Err(e) = result {
            relayd_core::rerror!("worker {}: cannot enter loop: {}", self.id(), e);
            self.handle.state.store(WorkerState::Stopped as u8, Ordering::Relaxed);
            self.handle.mark_finished();
            tls::clear_current();
            return;
        }

        self.load.borrow_mut().reset(clock::now_ms());
        self.handle.state.store(WorkerState::Idle as u8, Ordering::Relaxed);
        relayd_core::rinfo!("worker {}: started", self.id());

        self.poll_waitevents();

        // Leave the shared instance; the queue fd went at shutdown
        // initiation.
        let _ = self.remove_fd(self.shared_epfd);
        self.handle.state.store(WorkerState::Stopped as u8, Ordering::Relaxed);
        self.handle.mark_finished();
        relayd_core::rinfo!("worker {}: stopped", self.id());
        tls::clear_current();
    }

    /// The loop proper: poll, dispatch, reap, shutdown check.
    fn poll_waitevents(&self) {
        let stats = &self.handle.stats;
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let mut consecutive_empty: u32 = 0;
        let mut shutdown_initiated = false;

        loop {
            self.handle.state.store(WorkerState::Polling as u8, Ordering::Relaxed);

            let pending_work = !self.pending.borrow().is_empty();
            let blocking = !pending_work
                && !shutdown_initiated
                && (self.nonblocking_polls == 0 || consecutive_empty >= self.nonblocking_polls);
            let timeout = if blocking { self.maxwait_ms as i32 } else { 0 };
            if blocking {
                Statistics::bump(&stats.blockingpolls);
            }

            self.load.borrow_mut().about_to_wait(clock::now_ms());
            let nfds = match self.handle.poller.wait(&mut events, timeout) {
                Ok(n) => n,
                Err(e) => {
                    relayd_core::rerror!("worker {}: poll failed: {}", self.id(), e);
                    0
                }
            };
            let now = clock::now_ms();
            {
                let mut load = self.load.borrow_mut();
                load.about_to_work(now);
                let (second, minute, hour) = load.values();
                self.handle.load.second.store(second as u32, Ordering::Relaxed);
                self.handle.load.minute.store(minute as u32, Ordering::Relaxed);
                self.handle.load.hour.store(hour as u32, Ordering::Relaxed);
            }

            Statistics::bump(&stats.n_polls);
            if nfds > 0 {
                Statistics::bump(&stats.n_pollev);
                if !blocking {
                    Statistics::bump(&stats.n_nbpollev);
                }
                stats.record_nfds(nfds);
                consecutive_empty = 0;
            } else if blocking {
                // A fruitless blocking wait restarts the non-blocking burst.
                consecutive_empty = 0;
            } else {
                consecutive_empty = consecutive_empty.saturating_add(1);
            }

            let carried = self.pending.take();
            stats.record_batch(carried.len() + nfds);

            self.handle.state.store(WorkerState::Processing as u8, Ordering::Relaxed);
            for pending in carried {
                self.dispatch(pending.data, pending.events, pending.since_ms);
            }
            for event in events.iter().take(nfds) {
                let data = event.u64 as *mut PollData;
                let interest = unsafe { (*data).interest() };
                let delivered = translate(event.events, interest);
                if !delivered.is_empty() {
                    self.dispatch(data, delivered, now);
                }
            }

            self.handle
                .state
                .store(WorkerState::ZombieProcessing as u8, Ordering::Relaxed);
            self.reap_zombies();

            if self.handle.should_shutdown() && !shutdown_initiated {
                shutdown_initiated = true;
                self.handle.shutdown_initiated.store(true, Ordering::Release);
                if let Err(e) = self.remove_fd(self.handle.queue.event_fd()) {
                    rwarn!("worker {}: queue fd removal failed: {}", self.id(), e);
                }
                for listener in self.shutdown_listeners.take() {
                    listener(self);
                }
                relayd_core::rdebug!("worker {}: shutdown initiated", self.id());
            }

            if shutdown_initiated {
                // The queue descriptor is gone from the epoll set: drain
                // the ring directly until nothing is left anywhere.
                self.drain_queue();
                if self.handle.queue.is_empty()
                    && self.pending.borrow().is_empty()
                    && self.zombies.borrow().is_empty()
                {
                    break;
                }
            }
        }
    }

    /// Deliver one event to its handler; validate and re-queue the
    /// residual; account times and event classes.
    fn dispatch(&self, data: *mut PollData, delivered: PollEvents, since_ms: u64) {
        // A cleared owner means the registration was removed after this
        // event was queued; the delivery is dropped, never re-queued.
        if unsafe { (*data).owner_id() } == crate::events::NO_OWNER_ID {
            return;
        }

        let stats = &self.handle.stats;
        let start = clock::now_ms();
        stats.record_qtime(start.saturating_sub(since_ms));

        let residual = unsafe { ((*data).handler)(data, self.handle.id, delivered) };
        debug_assert!(
            delivered.contains(residual),
            "handler returned {:?} outside the delivered set {:?}",
            residual,
            delivered
        );
        let residual = residual & delivered;

        if residual.contains(PollEvents::READ) {
            Statistics::bump(&stats.n_read);
        }
        if residual.contains(PollEvents::WRITE) {
            Statistics::bump(&stats.n_write);
        }
        if residual.contains(PollEvents::ERROR) {
            Statistics::bump(&stats.n_error);
        }
        if residual.contains(PollEvents::HANGUP) {
            Statistics::bump(&stats.n_hup);
        }
        if residual.contains(PollEvents::ACCEPT) {
            Statistics::bump(&stats.n_accept);
        }

        let end = clock::now_ms();
        stats.record_exectime(end.saturating_sub(start));

        if !residual.is_empty() {
            self.pending.borrow_mut().push(PendingEvent {
                data,
                events: residual,
                since_ms: end,
            });
        }
    }

    /// Drop any residual deliveries still queued for `data`. Runs on the
    /// worker thread, via the flush broadcast of a shared-set removal.
    pub(crate) fn forget_pending(&self, data: usize) {
        self.pending.borrow_mut().retain(|p| p.data as usize != data);
    }

    /// Pop and dispatch the currently queued messages. Bounded by the
    /// queue length at entry so a task posting back to its own worker
    /// cannot keep the drain spinning.
    fn drain_queue(&self) -> usize {
        self.handle.queue.clear_signal();
        let batch = self.handle.queue.len();
        let mut drained = 0;
        while drained < batch {
            match self.handle.queue.pop() {
                Some(msg) => {
                    self.handle_message(msg);
                    drained += 1;
                }
                None => break,
            }
        }
        drained
    }

    fn handle_message(&self, msg: Message) {
        match msg {
            Message::RunTask { task, signal } => {
                task.execute(self);
                if let Some(signal) = signal {
                    signal.post();
                }
            }
            Message::RunDisposable { task } => {
                task.execute(self);
                // Last pending holder frees the task.
                drop(task);
            }
            Message::Shutdown => {
                self.handle.should_shutdown.store(true, Ordering::Release);
            }
            Message::Wake => {}
            Message::User { id, arg1, arg2 } => {
                let handler = self.message_handler.borrow();
                match handler.as_ref() {
                    Some(handler) => handler(self, id, arg1, arg2),
                    None => {
                        rwarn!("worker {}: unhandled message {} dropped", self.id(), id)
                    }
                }
            }
        }
    }

    /// Destroy registered zombies in insertion order, including any that
    /// are registered while reaping.
    fn reap_zombies(&self) {
        loop {
            let zombies = self.zombies.take();
            if zombies.is_empty() {
                break;
            }
            for mut zombie in zombies {
                zombie.on_reap(self);
            }
        }
    }

    /// Drain one batch from the shared epoll instance. Invoked through the
    /// shared conduit; never loops to empty, because shared handlers yield
    /// with residuals and the level-triggered nesting re-arms by itself.
    fn drain_shared(&self) {
        let mut buf = [libc::epoll_event { events: 0, u64: 0 }; 32];
        let n = match poll::wait_fd(self.shared_epfd, &mut buf, 0) {
            Ok(n) => n,
            Err(e) => {
                rwarn!("worker {}: shared poll failed: {}", self.id(), e);
                return;
            }
        };
        let now = clock::now_ms();
        for event in buf.iter().take(n) {
            let data = event.u64 as *mut PollData;
            let interest = unsafe { (*data).interest() };
            let delivered = translate(event.events, interest);
            if !delivered.is_empty() {
                self.dispatch(data, delivered, now);
            }
        }
    }
}

/// Handler bound to the queue's eventfd. Reports a residual read after a
/// non-empty drain so queue activity lands in `n_read` (the confirming
/// re-delivery finds the ring empty and is silent).
unsafe fn queue_conduit_handler(
    data: *mut PollData,
    _worker_id: i32,
    events: PollEvents,
) -> PollEvents {
    let conduit = data as *const Conduit;
    let worker = &*(*conduit).worker.get();
    if worker.drain_queue() > 0 {
        events & PollEvents::READ
    } else {
        PollEvents::empty()
    }
}

/// Handler bound to the shared epoll instance's descriptor.
unsafe fn shared_conduit_handler(
    data: *mut PollData,
    _worker_id: i32,
    _events: PollEvents,
) -> PollEvents {
    let conduit = data as *const Conduit;
    let worker = &*(*conduit).worker.get();
    worker.drain_shared();
    PollEvents::empty()
}
