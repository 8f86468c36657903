//! Error types for the weft runtime

use thiserror::Error;

/// Result type for scheduler operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur in scheduler operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedError {
    /// A scheduler needs at least one thread to make progress
    #[error("scheduler requires at least one thread")]
    NoThreads,

    /// start() was called after stop()
    #[error("scheduler is stopping")]
    Stopping,

    /// Worker thread error
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),
}

/// Worker thread related errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    /// Failed to spawn a worker thread
    #[error("failed to spawn worker thread")]
    SpawnFailed,

    /// Worker thread panicked before joining
    #[error("worker thread panicked")]
    Panicked,
}

/// Errors from readiness-event registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EventError {
    /// The (fd, direction) pair already has a pending registration
    #[error("event already registered for this direction")]
    AlreadyRegistered,

    /// epoll_ctl rejected the registration; payload is the errno
    #[error("epoll_ctl failed: errno {0}")]
    EpollCtl(i32),
}
