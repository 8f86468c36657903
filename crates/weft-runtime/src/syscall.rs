//! Blocking-syscall wrappers that park fibers instead of threads
//!
//! Each wrapper keeps the signature and errno contract of the libc call it
//! stands in for. With hooking disabled on the calling thread every
//! wrapper forwards verbatim. With hooking enabled, a call that would
//! block a socket instead registers one-shot readiness (plus an optional
//! deadline timer), yields the calling fiber, and retries once the
//! reactor resumes it.
//!
//! Reactor worker threads enable hooking automatically; other threads opt
//! in with [`set_hook_enabled`].

use crate::config::NO_TIMEOUT;
use crate::fd_table::{fd_table, TimeoutKind};
use crate::fiber::Fiber;
use crate::reactor::{Event, Reactor};
use crate::scheduler::ScheduleTask;

use weft_core::error::EventError;

use libc::{c_int, c_long, c_uint, c_ulong, c_void, size_t, socklen_t, ssize_t};

use std::any::Any;
use std::cell::Cell;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Whether blocking calls on this thread are transparently hooked
#[inline]
pub fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|h| h.get())
}

/// Toggle hooking for the calling thread
#[inline]
pub fn set_hook_enabled(flag: bool) {
    HOOK_ENABLED.with(|h| h.set(flag));
}

/// Default deadline for hooked connect(); `NO_TIMEOUT` = wait forever
static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(NO_TIMEOUT);

/// Change the default hooked-connect deadline
pub fn set_connect_timeout_ms(ms: u64) {
    CONNECT_TIMEOUT_MS.store(ms, Ordering::Release);
}

#[inline]
pub(crate) fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

#[inline]
fn set_errno(err: c_int) {
    unsafe { *libc::__errno_location() = err };
}

/// Shared flag between a parked operation and its deadline timer. The
/// timer holds only a weak reference, so a completed operation turns the
/// deadline into a no-op by dropping this.
struct OpState {
    cancelled: AtomicI32,
}

impl OpState {
    fn new() -> Arc<OpState> {
        Arc::new(OpState {
            cancelled: AtomicI32::new(0),
        })
    }
}

/// The generic hooked-I/O algorithm shared by all data-path wrappers.
///
/// Retries `orig` over EINTR; on EAGAIN it arms an optional condition
/// timer, registers one-shot readiness, parks the fiber, and loops once
/// resumed. A deadline firing first surfaces ETIMEDOUT.
fn do_io<F>(fd: c_int, mut orig: F, hook_name: &str, event: Event, timeout_kind: TimeoutKind) -> ssize_t
where
    F: FnMut() -> ssize_t,
{
    if !hook_enabled() {
        return orig();
    }
    let Some(info) = fd_table().get(fd, false) else {
        return orig();
    };
    if info.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !info.is_socket() || info.user_nonblock() {
        return orig();
    }

    let timeout = info.timeout(timeout_kind);
    let state = OpState::new();

    loop {
        let mut n = orig();
        while n == -1 && errno() == libc::EINTR {
            n = orig();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }

        // Would block: park on the reactor until the fd is ready.
        assert!(
            crate::fiber::on_fiber(),
            "hooked I/O must run on a scheduled fiber"
        );
        let reactor = Reactor::current().expect("hooked I/O requires a reactor on this thread");

        let timer = if timeout != NO_TIMEOUT {
            let weak_state = Arc::downgrade(&state);
            let weak_reactor = Arc::downgrade(&reactor);
            let state_any: Arc<dyn Any + Send + Sync> = state.clone();
            let cond: Weak<dyn Any + Send + Sync> = Arc::downgrade(&state_any);
            Some(reactor.add_condition_timer(
                timeout,
                Arc::new(move || {
                    let Some(state) = weak_state.upgrade() else {
                        return;
                    };
                    if state.cancelled.load(Ordering::Acquire) != 0 {
                        return;
                    }
                    state.cancelled.store(libc::ETIMEDOUT, Ordering::Release);
                    if let Some(reactor) = weak_reactor.upgrade() {
                        reactor.cancel_event(fd, event);
                    }
                }),
                cond,
                false,
            ))
        } else {
            None
        };

        if let Err(err) = reactor.add_event(fd, event, None) {
            log::error!("{}: add_event({}, {:?}) failed: {}", hook_name, fd, event, err);
            if let Some(timer) = &timer {
                timer.cancel();
            }
            return -1;
        }

        Fiber::current().yield_fiber();

        if let Some(timer) = &timer {
            timer.cancel();
        }
        if state.cancelled.load(Ordering::Acquire) == libc::ETIMEDOUT {
            set_errno(libc::ETIMEDOUT);
            return -1;
        }
        // Readiness or cancellation delivered; retry.
    }
}

/// Park the current fiber on a one-shot timer. Outside a scheduled fiber
/// there is nothing to park, so the OS thread sleeps instead.
fn park_on_timer(ms: u64) {
    if !crate::fiber::on_fiber() {
        std::thread::sleep(Duration::from_millis(ms));
        return;
    }
    let Some(reactor) = Reactor::current() else {
        std::thread::sleep(Duration::from_millis(ms));
        return;
    };
    let fiber = Fiber::current();
    let weak = Arc::downgrade(&reactor);
    reactor.add_timer(
        ms,
        Arc::new(move || {
            if let Some(reactor) = weak.upgrade() {
                reactor.schedule(ScheduleTask::fiber(fiber.clone()));
            }
        }),
        false,
    );
    Fiber::current().yield_fiber();
}

// ── Sleeps ──

/// Hooked sleep(3); the OS thread keeps running other fibers
pub fn sleep(seconds: c_uint) -> c_uint {
    if !hook_enabled() {
        return unsafe { libc::sleep(seconds) };
    }
    park_on_timer(seconds as u64 * 1000);
    0
}

/// Hooked usleep(3)
pub fn usleep(usec: c_uint) -> c_int {
    if !hook_enabled() {
        return unsafe { libc::usleep(usec) };
    }
    park_on_timer(usec as u64 / 1000);
    0
}

/// Hooked nanosleep(2). The remainder argument is never filled in: a
/// hooked sleep is not interruptible by signals.
///
/// # Safety
///
/// `req` must point to a valid timespec; `rem` may be null.
pub unsafe fn nanosleep(req: *const libc::timespec, rem: *mut libc::timespec) -> c_int {
    if !hook_enabled() {
        return unsafe { libc::nanosleep(req, rem) };
    }
    let req = unsafe { &*req };
    let ms = req.tv_sec as u64 * 1000 + req.tv_nsec as u64 / 1_000_000;
    park_on_timer(ms);
    0
}

// ── Socket lifecycle ──

/// Hooked socket(2): the new fd is registered (and, being a socket,
/// silently switched to kernel-side non-blocking)
pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if !hook_enabled() {
        return fd;
    }
    if fd == -1 {
        log::error!("socket() failed: {}", std::io::Error::last_os_error());
        return fd;
    }
    fd_table().get(fd, true);
    fd
}

/// Hooked connect(2) with an explicit deadline
///
/// # Safety
///
/// `addr` must point to a valid sockaddr of length `addrlen`.
pub unsafe fn connect_with_timeout(
    sockfd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
    timeout_ms: u64,
) -> c_int {
    if !hook_enabled() {
        return unsafe { libc::connect(sockfd, addr, addrlen) };
    }
    let Some(info) = fd_table().get(sockfd, false) else {
        set_errno(libc::EBADF);
        return -1;
    };
    if info.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !info.is_socket() || info.user_nonblock() {
        return unsafe { libc::connect(sockfd, addr, addrlen) };
    }

    let n = unsafe { libc::connect(sockfd, addr, addrlen) };
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    // Connection in progress: wait for write readiness.
    assert!(
        crate::fiber::on_fiber(),
        "hooked connect must run on a scheduled fiber"
    );
    let reactor = Reactor::current().expect("hooked connect requires a reactor on this thread");
    let state = OpState::new();

    let timer = if timeout_ms != NO_TIMEOUT {
        let weak_state = Arc::downgrade(&state);
        let weak_reactor = Arc::downgrade(&reactor);
        let state_any: Arc<dyn Any + Send + Sync> = state.clone();
        let cond: Weak<dyn Any + Send + Sync> = Arc::downgrade(&state_any);
        Some(reactor.add_condition_timer(
            timeout_ms,
            Arc::new(move || {
                let Some(state) = weak_state.upgrade() else {
                    return;
                };
                if state.cancelled.load(Ordering::Acquire) != 0 {
                    return;
                }
                state.cancelled.store(libc::ETIMEDOUT, Ordering::Release);
                if let Some(reactor) = weak_reactor.upgrade() {
                    reactor.cancel_event(sockfd, Event::WRITE);
                }
            }),
            cond,
            false,
        ))
    } else {
        None
    };

    match reactor.add_event(sockfd, Event::WRITE, None) {
        Ok(()) => {
            Fiber::current().yield_fiber();
            if let Some(timer) = &timer {
                timer.cancel();
            }
            let cancelled = state.cancelled.load(Ordering::Acquire);
            if cancelled != 0 {
                set_errno(cancelled);
                return -1;
            }
        }
        Err(err) => {
            // Nothing is watching the handshake; don't pretend it settled.
            if let Some(timer) = &timer {
                timer.cancel();
            }
            log::error!("connect: add_event({}, WRITE) failed: {}", sockfd, err);
            if let EventError::EpollCtl(e) = err {
                set_errno(e);
            }
            return -1;
        }
    }

    // The handshake finished (or failed); read the verdict.
    let mut error: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    let rt = unsafe {
        libc::getsockopt(
            sockfd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut error as *mut c_int as *mut c_void,
            &mut len,
        )
    };
    if rt != 0 {
        return -1;
    }
    if error == 0 {
        0
    } else {
        set_errno(error);
        -1
    }
}

/// Hooked connect(2) using the process-wide default deadline
///
/// # Safety
///
/// `addr` must point to a valid sockaddr of length `addrlen`.
pub unsafe fn connect(sockfd: c_int, addr: *const libc::sockaddr, addrlen: socklen_t) -> c_int {
    unsafe { connect_with_timeout(sockfd, addr, addrlen, CONNECT_TIMEOUT_MS.load(Ordering::Acquire)) }
}

/// Hooked accept(2); the accepted fd is registered like socket()
///
/// # Safety
///
/// `addr`/`addrlen` must be valid or null, as for accept(2).
pub unsafe fn accept(sockfd: c_int, addr: *mut libc::sockaddr, addrlen: *mut socklen_t) -> c_int {
    let fd = do_io(
        sockfd,
        || unsafe { libc::accept(sockfd, addr, addrlen) as ssize_t },
        "accept",
        Event::READ,
        TimeoutKind::Recv,
    ) as c_int;
    if fd >= 0 && hook_enabled() {
        fd_table().get(fd, true);
    }
    fd
}

// ── Reads ──

/// Hooked read(2)
///
/// # Safety
///
/// `buf` must be valid for `count` bytes.
pub unsafe fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(
        fd,
        || unsafe { libc::read(fd, buf, count) },
        "read",
        Event::READ,
        TimeoutKind::Recv,
    )
}

/// Hooked readv(2)
///
/// # Safety
///
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(
        fd,
        || unsafe { libc::readv(fd, iov, iovcnt) },
        "readv",
        Event::READ,
        TimeoutKind::Recv,
    )
}

/// Hooked recv(2)
///
/// # Safety
///
/// `buf` must be valid for `len` bytes.
pub unsafe fn recv(sockfd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(
        sockfd,
        || unsafe { libc::recv(sockfd, buf, len, flags) },
        "recv",
        Event::READ,
        TimeoutKind::Recv,
    )
}

/// Hooked recvfrom(2)
///
/// # Safety
///
/// Pointer arguments as for recvfrom(2).
pub unsafe fn recvfrom(
    sockfd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(
        sockfd,
        || unsafe { libc::recvfrom(sockfd, buf, len, flags, src_addr, addrlen) },
        "recvfrom",
        Event::READ,
        TimeoutKind::Recv,
    )
}

/// Hooked recvmsg(2)
///
/// # Safety
///
/// `msg` must point to a valid msghdr.
pub unsafe fn recvmsg(sockfd: c_int, msg: *mut libc::msghdr, flags: c_int) -> ssize_t {
    do_io(
        sockfd,
        || unsafe { libc::recvmsg(sockfd, msg, flags) },
        "recvmsg",
        Event::READ,
        TimeoutKind::Recv,
    )
}

// ── Writes ──

/// Hooked write(2)
///
/// # Safety
///
/// `buf` must be valid for `count` bytes.
pub unsafe fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(
        fd,
        || unsafe { libc::write(fd, buf, count) },
        "write",
        Event::WRITE,
        TimeoutKind::Send,
    )
}

/// Hooked writev(2)
///
/// # Safety
///
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(
        fd,
        || unsafe { libc::writev(fd, iov, iovcnt) },
        "writev",
        Event::WRITE,
        TimeoutKind::Send,
    )
}

/// Hooked send(2)
///
/// # Safety
///
/// `buf` must be valid for `len` bytes.
pub unsafe fn send(sockfd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(
        sockfd,
        || unsafe { libc::send(sockfd, buf, len, flags) },
        "send",
        Event::WRITE,
        TimeoutKind::Send,
    )
}

/// Hooked sendto(2)
///
/// # Safety
///
/// Pointer arguments as for sendto(2).
pub unsafe fn sendto(
    sockfd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest_addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    do_io(
        sockfd,
        || unsafe { libc::sendto(sockfd, buf, len, flags, dest_addr, addrlen) },
        "sendto",
        Event::WRITE,
        TimeoutKind::Send,
    )
}

/// Hooked sendmsg(2)
///
/// # Safety
///
/// `msg` must point to a valid msghdr.
pub unsafe fn sendmsg(sockfd: c_int, msg: *const libc::msghdr, flags: c_int) -> ssize_t {
    do_io(
        sockfd,
        || unsafe { libc::sendmsg(sockfd, msg, flags) },
        "sendmsg",
        Event::WRITE,
        TimeoutKind::Send,
    )
}

// ── Teardown and fd options ──

/// Hooked close(2): pending waiters on the fd are cancelled (and thus
/// resumed) before the descriptor goes away, so nobody deadlocks on a
/// dead fd.
pub fn close(fd: c_int) -> c_int {
    if !hook_enabled() {
        return unsafe { libc::close(fd) };
    }
    if fd_table().get(fd, false).is_some() {
        if let Some(reactor) = Reactor::current() {
            reactor.cancel_all(fd);
        }
        fd_table().del(fd);
    }
    unsafe { libc::close(fd) }
}

/// Hooked fcntl(2). F_SETFL records the user's O_NONBLOCK intent while
/// keeping the kernel state the runtime relies on; F_GETFL overlays that
/// intent on the result. Everything else passes through.
pub fn fcntl(fd: c_int, cmd: c_int, arg: c_long) -> c_int {
    match cmd {
        libc::F_SETFL => {
            let mut arg = arg as c_int;
            match fd_table().get(fd, false) {
                Some(info) if !info.is_closed() && info.is_socket() => {
                    info.set_user_nonblock(arg & libc::O_NONBLOCK != 0);
                    if info.sys_nonblock() {
                        arg |= libc::O_NONBLOCK;
                    } else {
                        arg &= !libc::O_NONBLOCK;
                    }
                    unsafe { libc::fcntl(fd, cmd, arg) }
                }
                _ => unsafe { libc::fcntl(fd, cmd, arg) },
            }
        }
        libc::F_GETFL => {
            let flags = unsafe { libc::fcntl(fd, cmd) };
            match fd_table().get(fd, false) {
                Some(info) if !info.is_closed() && info.is_socket() => {
                    if info.user_nonblock() {
                        flags | libc::O_NONBLOCK
                    } else {
                        flags & !libc::O_NONBLOCK
                    }
                }
                _ => flags,
            }
        }
        _ => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

/// Hooked ioctl(2); FIONBIO records the user's non-blocking intent
///
/// # Safety
///
/// `arg` must match what the request expects, as for ioctl(2).
pub unsafe fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO as c_ulong {
        let user_nonblock = unsafe { *(arg as *const c_int) } != 0;
        if let Some(info) = fd_table().get(fd, false) {
            if !info.is_closed() && info.is_socket() {
                info.set_user_nonblock(user_nonblock);
            }
        }
    }
    unsafe { libc::ioctl(fd, request as _, arg) }
}

/// Plain forward; present so hook users keep one import path
///
/// # Safety
///
/// Pointer arguments as for getsockopt(2).
pub unsafe fn getsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    unsafe { libc::getsockopt(sockfd, level, optname, optval, optlen) }
}

/// Hooked setsockopt(2); SO_RCVTIMEO / SO_SNDTIMEO are recorded so the
/// hooked data path can honor them
///
/// # Safety
///
/// `optval` must be valid for `optlen` bytes.
pub unsafe fn setsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if hook_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
    {
        if let Some(info) = fd_table().get(sockfd, false) {
            let tv = unsafe { &*(optval as *const libc::timeval) };
            let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            // A zero timeval means "block forever".
            let ms = if ms == 0 { NO_TIMEOUT } else { ms };
            let kind = if optname == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            info.set_timeout(kind, ms);
        }
    }
    unsafe { libc::setsockopt(sockfd, level, optname, optval, optlen) }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct HookGuard;

    impl HookGuard {
        fn enable() -> HookGuard {
            set_hook_enabled(true);
            HookGuard
        }
    }

    impl Drop for HookGuard {
        fn drop(&mut self) {
            set_hook_enabled(false);
        }
    }

    #[test]
    fn test_socket_registers_fd_when_enabled() {
        // Hook enabled means transparent async: the new socket must land
        // in the fd table, forced to kernel-side non-blocking.
        let _guard = HookGuard::enable();

        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);

        let info = fd_table().get(fd, false).expect("socket() must register the fd");
        assert!(info.is_socket());
        assert!(info.sys_nonblock());

        fd_table().del(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_socket_unregistered_when_disabled() {
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);
        assert!(fd_table().get(fd, false).is_none());
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_non_socket_io_is_transparent() {
        // Hooks enabled, but a pipe is not a socket: reads and writes are
        // byte-identical to the raw calls.
        let _guard = HookGuard::enable();

        let mut fds = [0 as c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let payload = b"weft!";
        let n = unsafe { write(fds[1], payload.as_ptr() as *const c_void, payload.len()) };
        assert_eq!(n, payload.len() as ssize_t);

        let mut buf = [0u8; 8];
        let n = unsafe { read(fds[0], buf.as_mut_ptr() as *mut c_void, buf.len()) };
        assert_eq!(n, payload.len() as ssize_t);
        assert_eq!(&buf[..payload.len()], payload);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_fcntl_overlays_user_nonblock_intent() {
        let _guard = HookGuard::enable();
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);

        // User asks for blocking mode: kernel stays non-blocking, user
        // view shows blocking.
        assert_eq!(fcntl(fd, libc::F_SETFL, 0), 0);
        let kernel = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert!(kernel & libc::O_NONBLOCK != 0);
        let seen = fcntl(fd, libc::F_GETFL, 0);
        assert_eq!(seen & libc::O_NONBLOCK, 0);

        // User opts into non-blocking: both views agree.
        assert_eq!(fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK as c_long), 0);
        let seen = fcntl(fd, libc::F_GETFL, 0);
        assert!(seen & libc::O_NONBLOCK != 0);
        let info = fd_table().get(fd, false).unwrap();
        assert!(info.user_nonblock());

        fd_table().del(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_ioctl_fionbio_records_intent() {
        let _guard = HookGuard::enable();
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);

        let mut on: c_int = 1;
        let rt = unsafe { ioctl(fd, libc::FIONBIO as c_ulong, &mut on as *mut c_int as *mut c_void) };
        assert_eq!(rt, 0);
        assert!(fd_table().get(fd, false).unwrap().user_nonblock());

        let mut off: c_int = 0;
        unsafe { ioctl(fd, libc::FIONBIO as c_ulong, &mut off as *mut c_int as *mut c_void) };
        assert!(!fd_table().get(fd, false).unwrap().user_nonblock());

        fd_table().del(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_setsockopt_records_timeouts() {
        let _guard = HookGuard::enable();
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);

        let tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 250_000,
        };
        let rt = unsafe {
            setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const c_void,
                std::mem::size_of::<libc::timeval>() as socklen_t,
            )
        };
        assert_eq!(rt, 0);

        let info = fd_table().get(fd, false).unwrap();
        assert_eq!(info.timeout(TimeoutKind::Recv), 250);
        assert_eq!(info.timeout(TimeoutKind::Send), NO_TIMEOUT);

        fd_table().del(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_zero_timeval_means_no_deadline() {
        let _guard = HookGuard::enable();
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);

        let tv = libc::timeval { tv_sec: 0, tv_usec: 0 };
        unsafe {
            setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const c_void,
                std::mem::size_of::<libc::timeval>() as socklen_t,
            )
        };
        let info = fd_table().get(fd, false).unwrap();
        assert_eq!(info.timeout(TimeoutKind::Recv), NO_TIMEOUT);

        fd_table().del(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_sleep_without_reactor_blocks_thread() {
        let _guard = HookGuard::enable();
        let start = std::time::Instant::now();
        // No reactor on this thread: falls back to a plain thread sleep.
        assert_eq!(usleep(30_000), 0);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }
}
