//! Thread-local fiber slots
//!
//! Each OS thread tracks three fibers: the one currently executing, the one
//! wrapping the thread's native context (the main fiber), and the dispatch
//! loop's fiber (the yield target for scheduled fibers; defaults to main).
//! Mutation is single-threaded per OS thread, so plain cells suffice.
//!
//! The raw slots never dangle while readable: whoever stores a pointer here
//! also keeps the fiber alive through an `Arc` (the main-fiber slot below,
//! a scheduler's dispatch-fiber field, or the task being run).

use crate::fiber::Fiber;
use std::cell::{Cell, RefCell};
use std::ptr;
use std::sync::Arc;

thread_local! {
    /// Fiber currently executing on this thread
    static CURRENT_FIBER: Cell<*const Fiber> = const { Cell::new(ptr::null()) };

    /// The fiber wrapping this thread's native context; owning slot
    static MAIN_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Yield target for fibers that run under a dispatch loop
    static SCHED_FIBER: Cell<*const Fiber> = const { Cell::new(ptr::null()) };
}

#[inline]
pub(crate) fn current_ptr() -> *const Fiber {
    CURRENT_FIBER.with(|c| c.get())
}

#[inline]
pub(crate) fn set_current(f: *const Fiber) {
    CURRENT_FIBER.with(|c| c.set(f));
}

#[inline]
pub(crate) fn main_ptr() -> *const Fiber {
    MAIN_FIBER.with(|m| {
        m.borrow()
            .as_ref()
            .map(|f| Arc::as_ptr(f))
            .unwrap_or(ptr::null())
    })
}

pub(crate) fn set_main_fiber(f: Arc<Fiber>) {
    MAIN_FIBER.with(|m| *m.borrow_mut() = Some(f));
}

#[inline]
pub(crate) fn sched_ptr() -> *const Fiber {
    SCHED_FIBER.with(|s| s.get())
}

#[inline]
pub(crate) fn set_sched_fiber(f: *const Fiber) {
    SCHED_FIBER.with(|s| s.set(f));
}
