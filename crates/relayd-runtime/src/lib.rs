//! # relayd-runtime — the per-thread worker runtime
//!
//! A fixed pool of worker threads, each running a single-threaded
//! cooperative event loop over its own epoll instance. Workers service two
//! classes of work:
//!
//! 1. I/O readiness on descriptors registered with them (or with the
//!    process-wide shared set used for listening sockets), and
//! 2. tasks and messages posted from any thread through a lock-free
//!    per-worker queue surfaced as an eventfd.
//!
//! ```text
//!  producers (any thread)                      worker thread N
//!  ──────────────────────                      ─────────────────────────
//!  post / post_message ──► ArrayQueue ──┐      epoll_wait ──► dispatch
//!                          eventfd ─────┴────►   queue fd      handlers
//!  add_fd ──► epoll_ctl ───────────────────►   I/O fds   ──► residual
//!                                               zombies   ──► reap
//! ```
//!
//! Handlers and tasks on one worker never preempt each other; they run
//! serially in delivery order. A handler that wants to yield returns the
//! residual events it did not drain and is re-invoked next iteration.
//!
//! The load of each worker — the share of wall time spent outside
//! `epoll_wait` — is reported at 1 s / 1 min / 1 h granularity.

pub mod config;
pub mod events;
pub mod load;
pub mod poll;
pub mod pool;
pub mod queue;
pub mod stats;
pub mod task;
pub mod tls;
pub mod worker;

pub use config::RuntimeConfig;
pub use events::{PollData, PollEvents, PollHandler, NO_OWNER_ID, SHARED_OWNER_ID};
pub use load::Granularity;
pub use queue::Message;
pub use stats::StatsSnapshot;
pub use task::{ExecuteMode, Session, Task, Zombie};
pub use worker::{Worker, WorkerHandle, WorkerState};
