//! # relayd-core — primitives for the relayd worker runtime
//!
//! Everything in this crate is independent of workers, epoll and threads:
//! error types, the monotonic clock, environment parsing, logging macros,
//! the running-average tree, the counting semaphore and the id registry.
//!
//! The runtime proper lives in `relayd-runtime`; this crate is its only
//! in-workspace dependency.

pub mod average;
pub mod clock;
pub mod env;
pub mod error;
pub mod registry;
pub mod rlog;
pub mod semaphore;

pub use error::{Result, RuntimeError};
pub use semaphore::Semaphore;
