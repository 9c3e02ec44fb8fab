//! Error types for the relayd runtime

use core::fmt;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors that can occur in runtime operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// Message queue is full; the message was not delivered
    QueueFull,

    /// The target worker's loop has exited
    WorkerGone,

    /// Descriptor refused by the poll registry (bad or blocking fd)
    BadDescriptor(i32),

    /// Descriptor is already registered with this poll instance
    AlreadyRegistered(i32),

    /// Descriptor is not registered with this poll instance
    NotRegistered(i32),

    /// Pool operations called before `pool::init`
    NotInitialized,

    /// `pool::init` called twice
    AlreadyInitialized,

    /// Configuration rejected by validation
    Config(String),

    /// Worker thread could not be spawned
    SpawnFailed,

    /// Wait on a completion signal expired
    Timeout,

    /// OS error with errno
    Os(i32),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::QueueFull => write!(f, "message queue full"),
            RuntimeError::WorkerGone => write!(f, "worker has exited"),
            RuntimeError::BadDescriptor(fd) => write!(f, "descriptor {} refused", fd),
            RuntimeError::AlreadyRegistered(fd) => {
                write!(f, "descriptor {} already registered", fd)
            }
            RuntimeError::NotRegistered(fd) => write!(f, "descriptor {} not registered", fd),
            RuntimeError::NotInitialized => write!(f, "worker pool not initialized"),
            RuntimeError::AlreadyInitialized => write!(f, "worker pool already initialized"),
            RuntimeError::Config(reason) => write!(f, "invalid configuration: {}", reason),
            RuntimeError::SpawnFailed => write!(f, "failed to spawn worker thread"),
            RuntimeError::Timeout => write!(f, "wait timed out"),
            RuntimeError::Os(errno) => write!(f, "OS error: errno {}", errno),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl RuntimeError {
    /// Build an `Os` error from the calling thread's errno.
    pub fn last_os() -> Self {
        RuntimeError::Os(unsafe { *libc::__errno_location() })
    }
}
