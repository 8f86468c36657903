//! # weft
//!
//! A user-space cooperative concurrency runtime: many stackful fibers
//! multiplexed over a small pool of OS threads, with an epoll readiness
//! reactor, a timer service, and syscall wrappers that turn naïve blocking
//! code into asynchronous code for free.
//!
//! ## Quick start
//!
//! ```ignore
//! use weft::{Reactor, ScheduleTask};
//! use weft::net::{TcpListener, TcpStream};
//!
//! fn main() {
//!     let reactor = Reactor::new(4, false, "echo");
//!
//!     reactor.schedule(ScheduleTask::call(|| {
//!         let listener = TcpListener::bind(8080).unwrap();
//!         loop {
//!             let stream = listener.accept().unwrap();
//!             let reactor = Reactor::current().unwrap();
//!             reactor.schedule(ScheduleTask::call(move || {
//!                 let mut buf = [0u8; 4096];
//!                 while let Ok(n) = stream.read(&mut buf) {
//!                     if n == 0 || stream.write_all(&buf[..n]).is_err() {
//!                         break;
//!                     }
//!                 }
//!             }));
//!         }
//!     }));
//!
//!     // ... shut down with reactor.stop() when done
//! }
//! ```
//!
//! On reactor worker threads the wrappers in [`syscall`] (and everything
//! built on them, like [`net`]) park the calling fiber instead of the OS
//! thread; the fiber is resumed when the fd turns ready or its deadline
//! fires.

// Re-export core types
pub use weft_core::{gettid, EventError, SchedError, SchedResult, Semaphore, Thread, WorkerError};

// Re-export runtime types
pub use weft_runtime::{
    fiber::{on_fiber, yield_now},
    Event, FdInfo, FdTable, Fiber, FiberState, Reactor, ScheduleTask, Scheduler, TimeoutKind,
    Timer, TimerManager,
};

pub use weft_runtime::config;
pub use weft_runtime::net;
pub use weft_runtime::syscall;
pub use weft_runtime::syscall::{hook_enabled, set_hook_enabled};
