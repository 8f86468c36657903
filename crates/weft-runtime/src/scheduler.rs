//! Work-queue dispatcher over a worker thread pool
//!
//! Workers pull tasks (fibers or callables) from a shared FIFO queue and
//! resume them. A task may be pinned to a specific worker's kernel thread
//! id. When the queue is empty a worker resumes its idle fiber; the base
//! scheduler's idle naps and polls, while the reactor overrides it to
//! drive epoll.
//!
//! The polymorphic points of the loop (`tickle`, `idle`, `stopping`) live
//! on the [`Dispatch`] trait; [`Scheduler`] itself provides the base
//! behavior and the reactor layers its own on the same core.

use crate::config::BASE_IDLE_NAP_MS;
use crate::fiber::{Fiber, FiberFn, FiberState};
use crate::tls;

use weft_core::thread::{gettid, Thread};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Any-thread marker for task pinning
pub const ANY_THREAD: libc::pid_t = -1;

enum TaskPayload {
    Fiber(Arc<Fiber>),
    Call(FiberFn),
}

/// A unit of work: a fiber to resume or a callable to wrap in one,
/// optionally pinned to a specific worker thread. Consumed once.
pub struct ScheduleTask {
    payload: TaskPayload,
    thread: libc::pid_t,
}

impl ScheduleTask {
    /// Task that resumes an existing fiber
    pub fn fiber(fiber: Arc<Fiber>) -> ScheduleTask {
        ScheduleTask {
            payload: TaskPayload::Fiber(fiber),
            thread: ANY_THREAD,
        }
    }

    /// Task that runs a callable in a fresh fiber
    pub fn call<F>(f: F) -> ScheduleTask
    where
        F: FnOnce() + Send + 'static,
    {
        ScheduleTask {
            payload: TaskPayload::Call(Box::new(f)),
            thread: ANY_THREAD,
        }
    }

    /// Pin the task to the worker with the given kernel thread id
    pub fn on_thread(mut self, tid: libc::pid_t) -> ScheduleTask {
        self.thread = tid;
        self
    }
}

/// Polymorphic points of the dispatch loop
pub trait Dispatch: Send + Sync + 'static {
    /// The scheduler core driving this dispatcher
    fn core(&self) -> &Scheduler;

    /// Wake a sleeping worker. The base scheduler's idle polls instead.
    fn tickle(&self) {}

    /// True once no further work can arrive
    fn stopping(&self) -> bool {
        self.core().base_stopping()
    }

    /// Body of the per-worker idle fiber
    fn idle(self: &Arc<Self>)
    where
        Self: Sized,
    {
        while !self.stopping() {
            std::thread::sleep(Duration::from_millis(BASE_IDLE_NAP_MS));
            Fiber::current().yield_fiber();
        }
    }

    /// Per-worker-thread setup before the dispatch loop starts
    fn bind_thread(self: &Arc<Self>)
    where
        Self: Sized,
    {
    }
}

/// Task queue and worker pool. Usable on its own (with the polling idle
/// above) or as the core of the reactor.
pub struct Scheduler {
    name: String,
    queue: Mutex<VecDeque<ScheduleTask>>,
    workers: Mutex<Vec<Thread>>,
    worker_ids: Mutex<Vec<libc::pid_t>>,
    /// Worker threads to spawn on start (excludes a participating caller)
    thread_count: usize,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    stop_requested: AtomicBool,
    started: AtomicBool,
    use_caller: bool,
    /// Kernel tid of the constructing thread; meaningful iff use_caller
    caller_tid: libc::pid_t,
    /// Present iff use_caller: the caller thread's dispatch-loop fiber
    dispatch_fiber: Mutex<Option<Arc<Fiber>>>,
}

impl Scheduler {
    /// Standalone scheduler with the base idle/tickle behavior
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        Arc::new(Scheduler::core_new(threads, use_caller, name))
    }

    pub(crate) fn core_new(threads: usize, use_caller: bool, name: &str) -> Scheduler {
        assert!(threads >= 1, "scheduler requires at least one thread");

        let mut thread_count = threads;
        let mut caller_tid = ANY_THREAD;
        let mut worker_ids = Vec::new();

        if use_caller {
            // The constructing thread becomes a worker: adopt its native
            // context now so yields have a target later.
            thread_count -= 1;
            Fiber::current();
            caller_tid = gettid();
            worker_ids.push(caller_tid);
        }

        Scheduler {
            name: name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            workers: Mutex::new(Vec::new()),
            worker_ids: Mutex::new(worker_ids),
            thread_count,
            active_threads: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            stop_requested: AtomicBool::new(false),
            started: AtomicBool::new(false),
            use_caller,
            caller_tid,
            dispatch_fiber: Mutex::new(None),
        }
    }

    /// Spawn the worker pool
    pub fn start(self: &Arc<Self>) {
        start_dispatch(self);
    }

    /// Signal drain, wake every worker and join them
    pub fn stop(self: &Arc<Self>) {
        stop_dispatch(self);
    }

    /// Enqueue a task, waking a worker if the queue was empty
    pub fn schedule(self: &Arc<Self>, task: ScheduleTask) {
        schedule_task(self, task);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel tids of the participating threads (caller first, if any)
    pub fn worker_ids(&self) -> Vec<libc::pid_t> {
        self.worker_ids.lock().unwrap().clone()
    }

    pub fn has_idle_threads(&self) -> bool {
        self.idle_threads.load(Ordering::Acquire) > 0
    }

    /// Drained and quiescent: stop was requested, the queue is empty and
    /// no worker is running a task.
    pub(crate) fn base_stopping(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
            && self.queue.lock().unwrap().is_empty()
            && self.active_threads.load(Ordering::Acquire) == 0
    }
}

// The base dispatcher: no-op tickle, polling idle, plain drain check.
impl Dispatch for Scheduler {
    fn core(&self) -> &Scheduler {
        self
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.started.load(Ordering::Acquire) && !self.stop_requested.load(Ordering::Acquire) {
            log::warn!("scheduler {} dropped without stop()", self.name);
        }
    }
}

/// Spawn the dispatcher's worker threads; with use_caller, also create the
/// caller's dispatch fiber (must run on the constructing thread).
pub(crate) fn start_dispatch<D: Dispatch>(disp: &Arc<D>) {
    let core = disp.core();
    if core.started.swap(true, Ordering::SeqCst) {
        return;
    }
    if core.stop_requested.load(Ordering::Acquire) {
        log::error!("{}: start() after stop()", core.name);
        return;
    }

    if core.use_caller {
        assert_eq!(
            core.caller_tid,
            gettid(),
            "start() must run on the thread that created the scheduler"
        );
        // The caller's dispatch loop lives in its own fiber so top-level
        // user code keeps its native context; stop() resumes it to drain.
        let weak = Arc::downgrade(disp);
        let fiber = Fiber::new(
            Box::new(move || {
                if let Some(disp) = weak.upgrade() {
                    run_worker(&disp);
                }
            }),
            0,
            false,
        );
        tls::set_sched_fiber(Arc::as_ptr(&fiber));
        *core.dispatch_fiber.lock().unwrap() = Some(fiber);
    }

    let mut workers = core.workers.lock().unwrap();
    for i in 0..core.thread_count {
        let disp = disp.clone();
        let thread = Thread::new(
            move || run_worker(&disp),
            &format!("{}_{}", core.name, i),
        )
        .expect("failed to spawn worker thread");
        core.worker_ids.lock().unwrap().push(thread.id());
        workers.push(thread);
    }
    log::debug!("{}: started {} worker(s)", core.name, core.thread_count);
}

/// Enqueue a task; a previously empty queue means some worker may be
/// sleeping, so tickle.
pub(crate) fn schedule_task<D: Dispatch>(disp: &Arc<D>, task: ScheduleTask) {
    let need_tickle = {
        let mut queue = disp.core().queue.lock().unwrap();
        let was_empty = queue.is_empty();
        queue.push_back(task);
        was_empty
    };
    if need_tickle {
        disp.tickle();
    }
}

/// The per-worker dispatch loop. Also runs inside the caller's dispatch
/// fiber when use_caller is set.
pub(crate) fn run_worker<D: Dispatch>(disp: &Arc<D>) {
    let core = disp.core();
    let tid = gettid();
    log::debug!("{}: dispatch loop starts on thread {}", core.name, tid);

    disp.bind_thread();
    Fiber::current();

    let weak = Arc::downgrade(disp);
    let idle_fiber = Fiber::new(
        Box::new(move || {
            if let Some(disp) = weak.upgrade() {
                disp.idle();
            }
        }),
        0,
        true,
    );

    loop {
        let mut task = None;
        let mut tickle_me = false;
        {
            let mut queue = core.queue.lock().unwrap();
            let mut i = 0;
            while i < queue.len() {
                // Leave tasks pinned to other workers in place, but make
                // sure someone is awake to take them.
                if queue[i].thread != ANY_THREAD && queue[i].thread != tid {
                    tickle_me = true;
                    i += 1;
                    continue;
                }
                task = queue.remove(i);
                core.active_threads.fetch_add(1, Ordering::SeqCst);
                break;
            }
            tickle_me = tickle_me || !queue.is_empty();
        }
        if tickle_me {
            disp.tickle();
        }

        match task.map(|t| t.payload) {
            Some(TaskPayload::Fiber(fiber)) => {
                {
                    // Serializes against the worker the fiber last ran on:
                    // it may still be mid-yield when the wake-up that
                    // re-queued the fiber arrives.
                    let _exec = fiber.exec_guard();
                    if fiber.state() != FiberState::Term {
                        fiber.resume();
                    }
                }
                core.active_threads.fetch_sub(1, Ordering::SeqCst);
            }
            Some(TaskPayload::Call(cb)) => {
                let fiber = Fiber::new(cb, 0, true);
                {
                    let _exec = fiber.exec_guard();
                    fiber.resume();
                }
                core.active_threads.fetch_sub(1, Ordering::SeqCst);
            }
            None => {
                // A terminated idle fiber is the shutdown signal.
                if idle_fiber.state() == FiberState::Term {
                    log::debug!("{}: dispatch loop ends on thread {}", core.name, tid);
                    break;
                }
                core.idle_threads.fetch_add(1, Ordering::SeqCst);
                idle_fiber.resume();
                core.idle_threads.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    // Pass the shutdown wake along: a single tickle byte may have been
    // consumed by this worker alone while siblings sleep out their full
    // poll timeout.
    disp.tickle();
}

/// Signal drain and join. With use_caller the dispatch fiber is resumed on
/// the caller so the caller thread works off its share before the workers
/// are joined.
pub(crate) fn stop_dispatch<D: Dispatch>(disp: &Arc<D>) {
    if disp.stopping() {
        return;
    }
    let core = disp.core();
    core.stop_requested.store(true, Ordering::SeqCst);

    if core.use_caller {
        assert_eq!(
            core.caller_tid,
            gettid(),
            "stop() must run on the caller thread when use_caller is set"
        );
    }

    for _ in 0..core.thread_count {
        disp.tickle();
    }

    let dispatch_fiber = core.dispatch_fiber.lock().unwrap().clone();
    if dispatch_fiber.is_some() {
        disp.tickle();
    }
    if let Some(fiber) = dispatch_fiber {
        fiber.resume();
        log::debug!("{}: caller dispatch fiber finished", core.name);
    }

    let mut workers: Vec<Thread> = core.workers.lock().unwrap().drain(..).collect();
    for thread in &mut workers {
        let _ = thread.join();
    }
    log::debug!("{}: stopped", core.name);
}
