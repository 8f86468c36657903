//! # weft-runtime
//!
//! A cooperative concurrency runtime that multiplexes many stackful fibers
//! across a small pool of OS threads.
//!
//! The pieces, bottom up:
//! - Context switching (architecture-specific naked functions)
//! - `Fiber`: the stackful switch primitive
//! - `TimerManager`: deadline-ordered timers with rollover handling
//! - `Scheduler`: work-queue dispatcher over a worker pool
//! - `Reactor`: edge-triggered epoll readiness reactor on top of the
//!   scheduler and timers
//! - `syscall`: blocking-call wrappers that park the calling fiber on the
//!   reactor instead of blocking the OS thread

#[cfg(not(target_os = "linux"))]
compile_error!("weft-runtime requires Linux (epoll, pipes, gettid)");

pub mod arch;
pub mod config;
pub mod fd_table;
pub mod fiber;
pub mod net;
pub mod reactor;
pub mod scheduler;
pub mod syscall;
pub mod timer;
mod tls;

// Re-exports
pub use fd_table::{fd_table, FdInfo, FdTable, TimeoutKind};
pub use fiber::{Fiber, FiberState};
pub use reactor::{Event, Reactor};
pub use scheduler::{ScheduleTask, Scheduler};
pub use timer::{Timer, TimerManager};
