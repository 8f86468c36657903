//! Edge-triggered epoll readiness reactor
//!
//! `Reactor` composes the scheduler core with a timer manager and an epoll
//! instance. Worker idle fibers drive `epoll_wait`; when an fd becomes
//! ready the registered fiber or callback is pushed back onto the task
//! queue and a worker resumes it. Registrations are one-shot: every
//! delivery re-registers (modify or delete) before dispatching.
//!
//! A self-pipe (the tickle pipe) wakes the poller when new work or an
//! earlier timer deadline arrives.

use crate::config::{MAX_IDLE_POLL_MS, MAX_POLL_EVENTS, NO_TIMER};
use crate::fiber::{Fiber, FiberFn, FiberState};
use crate::scheduler::{
    schedule_task, start_dispatch, stop_dispatch, Dispatch, ScheduleTask, Scheduler,
};
use crate::timer::{Timer, TimerFn, TimerManager};

use weft_core::error::EventError;
use weft_core::thread::gettid;

use std::any::Any;
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

bitflags::bitflags! {
    /// Readiness directions tracked per fd
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Event: u32 {
        const READ = libc::EPOLLIN as u32;
        const WRITE = libc::EPOLLOUT as u32;
    }
}

/// What to run when one direction of an fd becomes ready: the reactor to
/// re-enter and exactly one of (fiber, callback).
#[derive(Default)]
struct EventHandler {
    reactor: Option<Weak<Reactor>>,
    fiber: Option<Arc<Fiber>>,
    cb: Option<FiberFn>,
}

impl EventHandler {
    fn reset(&mut self) {
        self.reactor = None;
        self.fiber = None;
        self.cb = None;
    }

    fn is_empty(&self) -> bool {
        self.reactor.is_none() && self.fiber.is_none() && self.cb.is_none()
    }
}

/// Per-fd reactor state: the registered event mask and one handler slot
/// per direction.
struct FdContext {
    fd: RawFd,
    inner: Mutex<FdContextInner>,
}

struct FdContextInner {
    events: Event,
    read: EventHandler,
    write: EventHandler,
}

impl FdContext {
    fn new(fd: RawFd) -> FdContext {
        FdContext {
            fd,
            inner: Mutex::new(FdContextInner {
                events: Event::empty(),
                read: EventHandler::default(),
                write: EventHandler::default(),
            }),
        }
    }
}

impl FdContextInner {
    fn handler_mut(&mut self, event: Event) -> &mut EventHandler {
        if event == Event::READ {
            &mut self.read
        } else if event == Event::WRITE {
            &mut self.write
        } else {
            unreachable!("handler_mut() takes exactly one direction")
        }
    }
}

thread_local! {
    static CURRENT_REACTOR: RefCell<Option<Weak<Reactor>>> = const { RefCell::new(None) };
}

/// The I/O-driving scheduler: a worker pool whose idle fibers wait on
/// epoll and the timer set instead of napping.
pub struct Reactor {
    sched: Scheduler,
    timers: Arc<TimerManager>,
    epfd: RawFd,
    /// [read end, write end]; the read end is registered edge-triggered
    tickle_fds: [RawFd; 2],
    pending_events: AtomicUsize,
    /// Indexed by fd; entries are pre-created and never replaced
    fd_contexts: RwLock<Vec<Arc<FdContext>>>,
}

impl Reactor {
    /// Create the epoll instance and tickle pipe, then start the worker
    /// pool. OS failures here are fatal.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Reactor> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        assert!(
            epfd >= 0,
            "epoll_create1 failed: {}",
            std::io::Error::last_os_error()
        );

        let mut pipe_fds = [0 as RawFd; 2];
        let rt = unsafe { libc::pipe(pipe_fds.as_mut_ptr()) };
        assert_eq!(rt, 0, "pipe failed: {}", std::io::Error::last_os_error());

        // Non-blocking read end, to pair with edge-triggered draining
        unsafe {
            let flags = libc::fcntl(pipe_fds[0], libc::F_GETFL, 0);
            let rt = libc::fcntl(pipe_fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK);
            assert_eq!(rt, 0, "fcntl(O_NONBLOCK) on tickle pipe failed");
        }

        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: pipe_fds[0] as u64,
        };
        let rt = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pipe_fds[0], &mut ev) };
        assert_eq!(
            rt,
            0,
            "registering tickle pipe failed: {}",
            std::io::Error::last_os_error()
        );

        let reactor = Arc::new_cyclic(|weak: &Weak<Reactor>| {
            let timers = TimerManager::new();
            let notify = weak.clone();
            timers.set_front_notify(Box::new(move || {
                // A new earliest deadline: wake the poller so it re-reads
                // its timeout.
                if let Some(reactor) = notify.upgrade() {
                    reactor.tickle();
                }
            }));

            Reactor {
                sched: Scheduler::core_new(threads, use_caller, name),
                timers,
                epfd,
                tickle_fds: pipe_fds,
                pending_events: AtomicUsize::new(0),
                fd_contexts: RwLock::new(Vec::new()),
            }
        });

        reactor.grow_contexts(32);
        reactor.bind_current();
        start_dispatch(&reactor);
        reactor
    }

    /// The reactor bound to the calling thread, if any
    pub fn current() -> Option<Arc<Reactor>> {
        CURRENT_REACTOR.with(|r| r.borrow().as_ref().and_then(Weak::upgrade))
    }

    fn bind_current(self: &Arc<Self>) {
        CURRENT_REACTOR.with(|r| *r.borrow_mut() = Some(Arc::downgrade(self)));
    }

    /// Signal drain and join the worker pool
    pub fn stop(self: &Arc<Self>) {
        stop_dispatch(self);
    }

    /// Enqueue a task, waking a sleeping worker if needed
    pub fn schedule(self: &Arc<Self>, task: ScheduleTask) {
        schedule_task(self, task);
    }

    pub fn name(&self) -> &str {
        self.sched.name()
    }

    /// Kernel tids of the participating threads
    pub fn worker_ids(&self) -> Vec<libc::pid_t> {
        self.sched.worker_ids()
    }

    /// Registered-but-undelivered readiness registrations
    pub fn pending_event_count(&self) -> usize {
        self.pending_events.load(Ordering::Acquire)
    }

    // ── Timers ──

    /// Add a timer firing `ms` milliseconds from now
    pub fn add_timer(&self, ms: u64, cb: TimerFn, recurring: bool) -> Arc<Timer> {
        self.timers.add_timer(ms, cb, recurring)
    }

    /// Add a timer gated on a weak witness still being alive at fire time
    pub fn add_condition_timer(
        &self,
        ms: u64,
        cb: TimerFn,
        cond: Weak<dyn Any + Send + Sync>,
        recurring: bool,
    ) -> Arc<Timer> {
        self.timers.add_condition_timer(ms, cb, cond, recurring)
    }

    pub fn next_timer_ms(&self) -> u64 {
        self.timers.next_timer_ms()
    }

    pub fn has_timer(&self) -> bool {
        self.timers.has_timer()
    }

    // ── Event registration ──

    /// Register one-shot readiness interest for one direction of `fd`.
    /// With `cb` the callback is scheduled on delivery; without it the
    /// *current fiber* is parked and resumed instead.
    ///
    /// Rejects a second registration for a direction that is already
    /// pending.
    pub fn add_event(self: &Arc<Self>, fd: RawFd, event: Event, cb: Option<FiberFn>) -> Result<(), EventError> {
        debug_assert!(
            event == Event::READ || event == Event::WRITE,
            "register exactly one direction at a time"
        );

        let fd_ctx = self.context_for_grow(fd);
        let mut inner = fd_ctx.inner.lock().unwrap();

        if inner.events.contains(event) {
            log::warn!(
                "{}: duplicate {:?} registration for fd {}",
                self.name(),
                event,
                fd
            );
            return Err(EventError::AlreadyRegistered);
        }

        let op = if inner.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let new_events = inner.events | event;
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | new_events.bits(),
            u64: fd as u64,
        };
        let rt = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rt != 0 {
            let err = std::io::Error::last_os_error();
            log::error!("{}: add_event epoll_ctl({}) failed: {}", self.name(), fd, err);
            return Err(EventError::EpollCtl(err.raw_os_error().unwrap_or(0)));
        }

        self.pending_events.fetch_add(1, Ordering::AcqRel);
        inner.events = new_events;

        let handler = inner.handler_mut(event);
        debug_assert!(handler.is_empty());
        handler.reactor = Some(Arc::downgrade(self));
        match cb {
            Some(cb) => handler.cb = Some(cb),
            None => {
                let fiber = Fiber::current();
                assert_eq!(
                    fiber.state(),
                    FiberState::Running,
                    "add_event() without a callback parks the running fiber"
                );
                handler.fiber = Some(fiber);
            }
        }
        Ok(())
    }

    /// Drop a registration without firing its handler
    pub fn del_event(self: &Arc<Self>, fd: RawFd, event: Event) -> bool {
        let Some(fd_ctx) = self.context_for(fd) else {
            return false;
        };
        let mut inner = fd_ctx.inner.lock().unwrap();
        if !inner.events.contains(event) {
            return false;
        }

        if !self.reregister(fd, inner.events & !event) {
            return false;
        }
        self.pending_events.fetch_sub(1, Ordering::AcqRel);
        inner.events &= !event;
        inner.handler_mut(event).reset();
        true
    }

    /// Drop a registration and fire its handler exactly once
    pub fn cancel_event(self: &Arc<Self>, fd: RawFd, event: Event) -> bool {
        let Some(fd_ctx) = self.context_for(fd) else {
            return false;
        };
        let mut inner = fd_ctx.inner.lock().unwrap();
        if !inner.events.contains(event) {
            return false;
        }

        if !self.reregister(fd, inner.events & !event) {
            return false;
        }
        self.pending_events.fetch_sub(1, Ordering::AcqRel);
        Self::trigger_event(&mut inner, event);
        true
    }

    /// Unregister the fd entirely, firing both pending handlers
    pub fn cancel_all(self: &Arc<Self>, fd: RawFd) -> bool {
        let Some(fd_ctx) = self.context_for(fd) else {
            return false;
        };
        let mut inner = fd_ctx.inner.lock().unwrap();
        if inner.events.is_empty() {
            return false;
        }

        if !self.reregister(fd, Event::empty()) {
            return false;
        }
        if inner.events.contains(Event::READ) {
            Self::trigger_event(&mut inner, Event::READ);
            self.pending_events.fetch_sub(1, Ordering::AcqRel);
        }
        if inner.events.contains(Event::WRITE) {
            Self::trigger_event(&mut inner, Event::WRITE);
            self.pending_events.fetch_sub(1, Ordering::AcqRel);
        }
        debug_assert!(inner.events.is_empty());
        true
    }

    /// Clear the direction bit and push the handler onto its recorded
    /// reactor's queue. One-shot: observing the event again requires a new
    /// registration.
    fn trigger_event(inner: &mut FdContextInner, event: Event) {
        assert!(inner.events.contains(event));
        inner.events &= !event;

        let handler = inner.handler_mut(event);
        let reactor = handler.reactor.take().and_then(|w| w.upgrade());
        let Some(reactor) = reactor else {
            handler.reset();
            return;
        };
        if let Some(cb) = handler.cb.take() {
            schedule_task(&reactor, ScheduleTask::call(cb));
        } else if let Some(fiber) = handler.fiber.take() {
            schedule_task(&reactor, ScheduleTask::fiber(fiber));
        }
        handler.reset();
    }

    /// Modify or delete the kernel-side registration to match `remaining`
    fn reregister(&self, fd: RawFd, remaining: Event) -> bool {
        let op = if remaining.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | remaining.bits(),
            u64: fd as u64,
        };
        let rt = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rt != 0 {
            log::error!(
                "{}: epoll_ctl({}) failed: {}",
                self.name(),
                fd,
                std::io::Error::last_os_error()
            );
            return false;
        }
        true
    }

    fn context_for(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        self.fd_contexts.read().unwrap().get(fd as usize).cloned()
    }

    fn context_for_grow(&self, fd: RawFd) -> Arc<FdContext> {
        assert!(fd >= 0, "negative fd");
        {
            let table = self.fd_contexts.read().unwrap();
            if let Some(ctx) = table.get(fd as usize) {
                return ctx.clone();
            }
        }
        let mut table = self.fd_contexts.write().unwrap();
        if fd as usize >= table.len() {
            let target = (fd as usize * 3 / 2).max(fd as usize + 1);
            let start = table.len();
            table.extend((start..target).map(|i| Arc::new(FdContext::new(i as RawFd))));
        }
        table[fd as usize].clone()
    }

    fn grow_contexts(&self, len: usize) {
        let mut table = self.fd_contexts.write().unwrap();
        let start = table.len();
        table.extend((start..len).map(|i| Arc::new(FdContext::new(i as RawFd))));
    }

    /// The epoll loop run by every worker's idle fiber
    fn idle_loop(self: &Arc<Self>) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_POLL_EVENTS];

        loop {
            if self.stopping() {
                log::debug!("{}: idle exits on thread {}", self.name(), gettid());
                break;
            }

            let ready = loop {
                let timeout = self.timers.next_timer_ms().min(MAX_IDLE_POLL_MS);
                let n = unsafe {
                    libc::epoll_wait(
                        self.epfd,
                        events.as_mut_ptr(),
                        MAX_POLL_EVENTS as libc::c_int,
                        timeout as libc::c_int,
                    )
                };
                if n < 0 {
                    let err = std::io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        continue;
                    }
                    log::error!("{}: epoll_wait failed: {}", self.name(), err);
                    break 0;
                }
                break n as usize;
            };

            // Expired timers compete with I/O wake-ups through the queue.
            let mut cbs: Vec<TimerFn> = Vec::new();
            self.timers.list_expired(&mut cbs);
            for cb in cbs {
                schedule_task(self, ScheduleTask::call(move || cb()));
            }

            for ev in &events[..ready] {
                if ev.u64 == self.tickle_fds[0] as u64 {
                    let mut buf = [0u8; 256];
                    while unsafe {
                        libc::read(
                            self.tickle_fds[0],
                            buf.as_mut_ptr() as *mut libc::c_void,
                            buf.len(),
                        )
                    } > 0
                    {}
                    continue;
                }

                let fd = ev.u64 as RawFd;
                let Some(fd_ctx) = self.context_for(fd) else {
                    continue;
                };
                self.dispatch_ready(&fd_ctx, ev.events);
            }

            // Hand the thread back to the dispatch loop so it picks up
            // whatever was just scheduled.
            Fiber::current().yield_fiber();
        }
    }

    /// Translate one epoll event into handler firings for an fd
    fn dispatch_ready(self: &Arc<Self>, fd_ctx: &FdContext, mut ready: u32) {
        let mut inner = fd_ctx.inner.lock().unwrap();

        // Errors and hangups surface through whichever directions are
        // registered, so waiters observe them and retry.
        if ready & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
            ready |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & inner.events.bits();
        }

        let mut real = Event::empty();
        if ready & libc::EPOLLIN as u32 != 0 {
            real |= Event::READ;
        }
        if ready & libc::EPOLLOUT as u32 != 0 {
            real |= Event::WRITE;
        }
        let real = real & inner.events;
        if real.is_empty() {
            return;
        }

        if !self.reregister(fd_ctx.fd, inner.events & !real) {
            return;
        }
        if real.contains(Event::READ) {
            Self::trigger_event(&mut inner, Event::READ);
            self.pending_events.fetch_sub(1, Ordering::AcqRel);
        }
        if real.contains(Event::WRITE) {
            Self::trigger_event(&mut inner, Event::WRITE);
            self.pending_events.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Dispatch for Reactor {
    fn core(&self) -> &Scheduler {
        &self.sched
    }

    /// Wake the poller via the self-pipe, but only when some worker is
    /// actually sleeping in it.
    fn tickle(&self) {
        if !self.sched.has_idle_threads() {
            return;
        }
        let rt = unsafe {
            libc::write(
                self.tickle_fds[1],
                b"T".as_ptr() as *const libc::c_void,
                1,
            )
        };
        debug_assert_eq!(rt, 1, "tickle write failed");
    }

    /// Quiescent only once the queue, the pending registrations and the
    /// timer set are all empty.
    fn stopping(&self) -> bool {
        self.timers.next_timer_ms() == NO_TIMER
            && self.pending_events.load(Ordering::Acquire) == 0
            && self.sched.base_stopping()
    }

    fn idle(self: &Arc<Self>) {
        self.idle_loop();
    }

    /// Workers of a reactor transparently hook blocking syscalls.
    fn bind_thread(self: &Arc<Self>) {
        self.bind_current();
        crate::syscall::set_hook_enabled(true);
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        // Worker threads hold strong handles, so by the time this runs the
        // pool has been joined.
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}
