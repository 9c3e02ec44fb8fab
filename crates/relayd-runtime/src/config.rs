//! Runtime configuration
//!
//! Compile-time defaults with environment overrides; everything must be
//! settled before `pool::init`.
//!
//! Environment variables (all optional):
//! - `RELAYD_THREADS` - number of worker threads
//! - `RELAYD_STACK_SIZE` - worker stack size in bytes (0 = platform default)
//! - `RELAYD_NONBLOCKING_POLLS` - non-blocking polls before a blocking wait
//!   (0 = always block)
//! - `RELAYD_MAXWAIT_MS` - maximum blocking wait in milliseconds
//! - `RELAYD_QUEUE_CAPACITY` - per-worker message queue capacity

use relayd_core::env::env_get;

/// Upper bound on the worker directory size.
pub const MAX_WORKERS: usize = 128;

const DEFAULT_NONBLOCKING_POLLS: u32 = 3;
const DEFAULT_MAXWAIT_MS: u32 = 1000;
const DEFAULT_QUEUE_CAPACITY: usize = 16384;

/// Worker runtime configuration with builder-style setters.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of worker threads
    pub thread_count: usize,
    /// Worker thread stack size in bytes; 0 means the platform default
    pub stack_size: usize,
    /// Consecutive non-blocking polls before the wait becomes blocking;
    /// 0 means every wait blocks
    pub nonblocking_polls: u32,
    /// Maximum time a blocking wait may sleep, in milliseconds
    pub maxwait: u32,
    /// Capacity of each worker's message queue
    pub queue_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Defaults with any `RELAYD_*` environment overrides applied.
    pub fn from_env() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            thread_count: env_get("RELAYD_THREADS", cpus),
            stack_size: env_get("RELAYD_STACK_SIZE", 0),
            nonblocking_polls: env_get("RELAYD_NONBLOCKING_POLLS", DEFAULT_NONBLOCKING_POLLS),
            maxwait: env_get("RELAYD_MAXWAIT_MS", DEFAULT_MAXWAIT_MS),
            queue_capacity: env_get("RELAYD_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY),
        }
    }

    pub fn thread_count(mut self, n: usize) -> Self {
        self.thread_count = n;
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn nonblocking_polls(mut self, n: u32) -> Self {
        self.nonblocking_polls = n;
        self
    }

    pub fn maxwait(mut self, ms: u32) -> Self {
        self.maxwait = ms;
        self
    }

    pub fn queue_capacity(mut self, cap: usize) -> Self {
        self.queue_capacity = cap;
        self
    }

    /// Reject configurations the pool cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.thread_count == 0 {
            return Err("thread_count must be positive".into());
        }
        if self.thread_count > MAX_WORKERS {
            return Err(format!(
                "thread_count {} exceeds maximum {}",
                self.thread_count, MAX_WORKERS
            ));
        }
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be positive".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = RuntimeConfig::from_env();
        assert!(config.validate().is_ok());
        assert!(config.thread_count >= 1);
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::from_env()
            .thread_count(4)
            .stack_size(1 << 20)
            .nonblocking_polls(0)
            .maxwait(50)
            .queue_capacity(64);
        assert_eq!(config.thread_count, 4);
        assert_eq!(config.stack_size, 1 << 20);
        assert_eq!(config.nonblocking_polls, 0);
        assert_eq!(config.maxwait, 50);
        assert_eq!(config.queue_capacity, 64);
    }

    #[test]
    fn test_validate_rejects() {
        assert!(RuntimeConfig::from_env().thread_count(0).validate().is_err());
        assert!(RuntimeConfig::from_env()
            .thread_count(MAX_WORKERS + 1)
            .validate()
            .is_err());
        assert!(RuntimeConfig::from_env().queue_capacity(0).validate().is_err());
    }
}
