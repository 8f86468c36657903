//! # weft-core
//!
//! Building blocks shared by the weft runtime crates:
//! - Error types
//! - Counting semaphore (thread construction handshake)
//! - Named OS thread wrapper with an initialization handshake

pub mod error;
pub mod semaphore;
pub mod thread;

pub use error::{EventError, SchedError, SchedResult, WorkerError};
pub use semaphore::Semaphore;
pub use thread::{gettid, Thread};
