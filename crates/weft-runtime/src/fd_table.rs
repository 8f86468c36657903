//! Process-wide fd metadata for the syscall hooks
//!
//! Every fd the hooks touch gets an `FdInfo` describing what kind of file
//! it is and how the *user* asked it to behave. Sockets are silently
//! forced to kernel-side non-blocking; the user-visible blocking semantics
//! are reconstructed by the hooks from `user_nonblock`.

use crate::config::NO_TIMEOUT;

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

/// Which per-fd timeout a hooked operation consults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// SO_RCVTIMEO: reads, receives, accept
    Recv,
    /// SO_SNDTIMEO: writes, sends, connect
    Send,
}

/// Per-fd metadata, initialized lazily on first observation
pub struct FdInfo {
    fd: RawFd,
    is_init: bool,
    is_socket: bool,
    /// What the kernel sees; sockets are forced non-blocking
    sys_nonblock: AtomicBool,
    /// What the user requested through fcntl/ioctl
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdInfo {
    fn new(fd: RawFd) -> FdInfo {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let (is_init, is_socket) = if unsafe { libc::fstat(fd, &mut stat) } == -1 {
            (false, false)
        } else {
            (true, stat.st_mode & libc::S_IFMT == libc::S_IFSOCK)
        };

        let sys_nonblock = if is_socket {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL, 0);
                if flags & libc::O_NONBLOCK == 0 {
                    libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                }
            }
            true
        } else {
            false
        };

        FdInfo {
            fd,
            is_init,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_init(&self) -> bool {
        self.is_init
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    pub fn set_sys_nonblock(&self, flag: bool) {
        self.sys_nonblock.store(flag, Ordering::Release);
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, flag: bool) {
        self.user_nonblock.store(flag, Ordering::Release);
    }

    /// Timeout in milliseconds; `NO_TIMEOUT` when unset
    pub fn timeout(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Acquire),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Acquire),
        }
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Release),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Release),
        }
    }
}

/// fd → `FdInfo` map backed by a growable vector, the fd as index
pub struct FdTable {
    slots: RwLock<Vec<Option<Arc<FdInfo>>>>,
}

impl FdTable {
    fn new() -> FdTable {
        FdTable {
            slots: RwLock::new(vec![None; 64]),
        }
    }

    /// Look up an fd; with `auto_create` a missing entry is initialized
    /// (growing the table by 1.5x when the fd is out of range).
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdInfo>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;

        {
            let slots = self.slots.read().unwrap();
            if idx < slots.len() {
                if slots[idx].is_some() || !auto_create {
                    return slots[idx].clone();
                }
            } else if !auto_create {
                return None;
            }
        }

        let mut slots = self.slots.write().unwrap();
        if idx >= slots.len() {
            let target = (idx * 3 / 2).max(idx + 1);
            slots.resize(target, None);
        }
        if slots[idx].is_none() {
            slots[idx] = Some(Arc::new(FdInfo::new(fd)));
        }
        slots[idx].clone()
    }

    /// Forget an fd (on close)
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().unwrap();
        if let Some(slot) = slots.get_mut(fd as usize) {
            *slot = None;
        }
    }
}

static FD_TABLE: OnceLock<FdTable> = OnceLock::new();

/// The process-wide fd table, created on first use
pub fn fd_table() -> &'static FdTable {
    FD_TABLE.get_or_init(FdTable::new)
}
