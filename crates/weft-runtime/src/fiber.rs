//! Stackful fibers
//!
//! A `Fiber` owns a stack and a saved register block. `resume` switches
//! execution into the fiber; `yield_fiber` switches back to the thread's
//! main fiber or, for fibers run by a dispatch loop, to the scheduler
//! fiber. Within one OS thread exactly one fiber is Running at a time.

use crate::arch::{self, SavedContext};
use crate::config::DEFAULT_STACK_SIZE;
use crate::tls;

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// Entry callable of a fiber; consumed on first run
pub type FiberFn = Box<dyn FnOnce() + Send>;

static FIBER_ID: AtomicU64 = AtomicU64::new(0);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

/// Fiber lifecycle states
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Eligible to be resumed
    Ready = 0,
    /// Currently executing on some thread
    Running = 1,
    /// Entry callable finished; resumable again only after `reset`
    Term = 2,
}

impl FiberState {
    fn from_u8(v: u8) -> FiberState {
        match v {
            0 => FiberState::Ready,
            1 => FiberState::Running,
            _ => FiberState::Term,
        }
    }
}

/// A cooperatively-scheduled execution context with its own stack.
///
/// The thread's first fiber operation adopts the native context as the
/// *main fiber* (no stack allocation). All other fibers are created with
/// [`Fiber::new`] and handed to a scheduler or resumed manually.
pub struct Fiber {
    id: u64,
    stack_size: usize,
    /// Selects the yield target: the dispatch loop's fiber when true,
    /// the thread's main fiber when false.
    run_in_scheduler: bool,
    state: AtomicU8,
    cb: Mutex<Option<FiberFn>>,
    /// Held by the worker for as long as it executes this fiber. A fiber
    /// can re-enter the queue the moment it registers a wake-up, before
    /// its yield has finished saving context; the next worker blocks here
    /// until the handover is complete.
    exec: Mutex<()>,
    ctx: UnsafeCell<SavedContext>,
    /// None for the main fiber, which runs on the thread's native stack
    stack: Option<Box<[u8]>>,
}

// A fiber's context and stack are only touched by the thread currently
// running or resuming it; the scheduler's single-consumer queue guarantees
// there is at most one such thread.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber with its own stack, entered through `cb` on first
    /// resume. A `stack_size` of 0 selects the default.
    pub fn new(cb: FiberFn, stack_size: usize, run_in_scheduler: bool) -> Arc<Fiber> {
        let stack_size = if stack_size == 0 { DEFAULT_STACK_SIZE } else { stack_size };
        let stack = vec![0u8; stack_size].into_boxed_slice();

        let fiber = Fiber {
            id: FIBER_ID.fetch_add(1, Ordering::Relaxed),
            stack_size,
            run_in_scheduler,
            state: AtomicU8::new(FiberState::Ready as u8),
            cb: Mutex::new(Some(cb)),
            exec: Mutex::new(()),
            ctx: UnsafeCell::new(SavedContext::default()),
            stack: Some(stack),
        };
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);

        unsafe { fiber.init_entry() };
        Arc::new(fiber)
    }

    /// Wrap the calling thread's native context. No stack is allocated and
    /// the state starts out Running.
    fn new_main() -> Fiber {
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        Fiber {
            id: FIBER_ID.fetch_add(1, Ordering::Relaxed),
            stack_size: 0,
            run_in_scheduler: false,
            state: AtomicU8::new(FiberState::Running as u8),
            cb: Mutex::new(None),
            exec: Mutex::new(()),
            ctx: UnsafeCell::new(SavedContext::default()),
            stack: None,
        }
    }

    /// Handle to the fiber currently running on this thread.
    ///
    /// The first call on a thread adopts the native context as the main
    /// fiber; it becomes the current fiber and the default yield target.
    pub fn current() -> Arc<Fiber> {
        let ptr = tls::current_ptr();
        if !ptr.is_null() {
            // The slot tracks a live fiber: its Arc is held by the task
            // being run or by the thread-local main slot.
            unsafe {
                Arc::increment_strong_count(ptr);
                return Arc::from_raw(ptr);
            }
        }

        let main = Arc::new(Fiber::new_main());
        tls::set_main_fiber(main.clone());
        tls::set_current(Arc::as_ptr(&main));
        tls::set_sched_fiber(Arc::as_ptr(&main));
        main
    }

    /// Id of the fiber currently running on this thread, or `u64::MAX`
    /// when no fiber operation has happened yet.
    pub fn current_id() -> u64 {
        let ptr = tls::current_ptr();
        if ptr.is_null() {
            return u64::MAX;
        }
        unsafe { (*ptr).id }
    }

    /// Number of live fibers in the process
    pub fn fiber_count() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::SeqCst))
    }

    #[inline]
    fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Rearm a terminated fiber with a fresh entry callable, reusing its
    /// stack.
    pub fn reset(&self, cb: FiberFn) {
        assert!(
            self.stack.is_some() && self.state() == FiberState::Term,
            "reset() requires a terminated fiber with a stack"
        );
        *self.cb.lock().unwrap() = Some(cb);
        unsafe { self.init_entry() };
        self.set_state(FiberState::Ready);
    }

    /// Switch execution into this fiber. Control returns when the fiber
    /// yields or terminates.
    pub fn resume(self: &Arc<Self>) {
        assert_eq!(self.state(), FiberState::Ready, "resume() requires a Ready fiber");
        self.set_state(FiberState::Running);

        // Symmetric with yield_fiber: the suspended side of the switch is
        // the scheduler fiber or the thread's main fiber.
        let from = if self.run_in_scheduler {
            tls::sched_ptr()
        } else {
            tls::main_ptr()
        };
        assert!(!from.is_null(), "resume() before the thread's main fiber exists");

        tls::set_current(Arc::as_ptr(self));
        unsafe {
            arch::context_switch((*from).ctx.get(), self.ctx.get());
        }
    }

    /// Give up the thread, switching back to the scheduler or main fiber.
    /// A Running fiber becomes Ready; a terminated one stays Term.
    pub fn yield_fiber(&self) {
        let state = self.state();
        assert!(
            state == FiberState::Running || state == FiberState::Term,
            "yield_fiber() on a fiber that is not running"
        );
        if state != FiberState::Term {
            self.set_state(FiberState::Ready);
        }

        let to = if self.run_in_scheduler {
            tls::sched_ptr()
        } else {
            tls::main_ptr()
        };
        assert!(!to.is_null(), "yield_fiber() without a switch target");

        tls::set_current(to);
        unsafe {
            arch::context_switch(self.ctx.get(), (*to).ctx.get());
        }
    }

    /// Serialize execution handover between workers. The guard must be
    /// taken before `resume` and dropped only after it returns.
    pub(crate) fn exec_guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.exec.lock().unwrap()
    }

    unsafe fn init_entry(&self) {
        let stack = self.stack.as_ref().expect("init_entry() on the main fiber");
        let top = stack.as_ptr().add(stack.len()) as *mut u8;
        arch::init_context(self.ctx.get(), top, fiber_entry, 0);
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
    }
}

/// True when the calling code runs on a schedulable fiber rather than the
/// thread's native context.
pub fn on_fiber() -> bool {
    let ptr = tls::current_ptr();
    !ptr.is_null() && ptr != tls::main_ptr()
}

/// Yield the current fiber, or the OS thread when called outside one.
pub fn yield_now() {
    let ptr = tls::current_ptr();
    if ptr.is_null() || ptr == tls::main_ptr() {
        std::thread::yield_now();
        return;
    }
    Fiber::current().yield_fiber();
}

/// Entry point for every non-main fiber.
///
/// Runs the callable, clears it so captured references drop promptly, and
/// marks the fiber terminated. The strong handle obtained here is released
/// *before* the final switch: control never comes back to run its
/// destructor, and the fiber stays alive across the swap through the
/// handle still held by whoever resumed it.
extern "C" fn fiber_entry(_arg: usize) {
    let curr = Fiber::current();

    let cb = curr
        .cb
        .lock()
        .unwrap()
        .take()
        .expect("fiber entered without a callable");
    cb();

    curr.set_state(FiberState::Term);

    let raw: *const Fiber = Arc::as_ptr(&curr);
    drop(curr);
    unsafe { (*raw).yield_fiber() };

    unreachable!("terminated fiber resumed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_resume_and_finish() {
        Fiber::current();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();

        let fiber = Fiber::new(
            Box::new(move || {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
            0,
            false,
        );
        assert_eq!(fiber.state(), FiberState::Ready);

        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_yield_roundtrip() {
        Fiber::current();
        let steps = Arc::new(AtomicUsize::new(0));
        let steps2 = steps.clone();

        let fiber = Fiber::new(
            Box::new(move || {
                steps2.fetch_add(1, Ordering::SeqCst);
                Fiber::current().yield_fiber();
                steps2.fetch_add(1, Ordering::SeqCst);
            }),
            0,
            false,
        );

        fiber.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), FiberState::Ready);

        fiber.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_reset_reuses_stack() {
        Fiber::current();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let fiber = Fiber::new(Box::new(move || { h.fetch_add(1, Ordering::SeqCst); }), 0, false);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);

        let h = hits.clone();
        fiber.reset(Box::new(move || { h.fetch_add(10, Ordering::SeqCst); }));
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();

        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_ids_are_unique() {
        Fiber::current();
        let a = Fiber::new(Box::new(|| {}), 0, false);
        let b = Fiber::new(Box::new(|| {}), 0, false);
        assert_ne!(a.id(), b.id());
        a.resume();
        b.resume();
    }

    #[test]
    fn test_current_inside_fiber() {
        Fiber::current();
        let seen = Arc::new(AtomicU64::new(u64::MAX));
        let seen2 = seen.clone();

        let fiber = Fiber::new(
            Box::new(move || {
                seen2.store(Fiber::current().id(), Ordering::SeqCst);
            }),
            0,
            false,
        );
        let id = fiber.id();
        fiber.resume();
        assert_eq!(seen.load(Ordering::SeqCst), id);
    }

    #[test]
    fn test_default_stack_size() {
        Fiber::current();
        let fiber = Fiber::new(Box::new(|| {}), 0, false);
        assert_eq!(fiber.stack_size(), DEFAULT_STACK_SIZE);
        fiber.resume();
    }

    #[test]
    fn test_entry_callable_dropped_after_run() {
        Fiber::current();
        let marker = Arc::new(());
        let weak = Arc::downgrade(&marker);

        let fiber = Fiber::new(Box::new(move || drop(marker)), 0, false);
        fiber.resume();
        // The callable (and its captures) are gone even though the fiber
        // object itself is still alive.
        assert!(weak.upgrade().is_none());
        assert_eq!(fiber.state(), FiberState::Term);
    }
}
