//! Named OS thread wrapper with a construction handshake.
//!
//! The spawned thread stores its name in thread-local state, records its
//! kernel thread id and signals a semaphore before running the user
//! callable, so by the time `Thread::new` returns the thread is observably
//! initialized.

use crate::error::{SchedResult, WorkerError};
use crate::semaphore::Semaphore;

use std::cell::RefCell;
use std::ffi::CString;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

thread_local! {
    static THREAD_NAME: RefCell<String> = RefCell::new(String::from("UNKNOWN"));
}

/// Kernel thread id of the calling thread
#[inline]
pub fn gettid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

/// A named OS thread whose constructor returns only after the thread
/// function has initialized.
pub struct Thread {
    handle: Option<JoinHandle<()>>,
    id: libc::pid_t,
    name: String,
}

impl Thread {
    /// Spawn a named thread running `cb`. Blocks until the thread has
    /// recorded its kernel id and published its name.
    pub fn new<F>(cb: F, name: &str) -> SchedResult<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let sem = Arc::new(Semaphore::new(0));
        let tid = Arc::new(AtomicI32::new(0));

        let sem2 = sem.clone();
        let tid2 = tid.clone();
        let thread_name = name.to_string();

        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                THREAD_NAME.with(|n| *n.borrow_mut() = thread_name.clone());
                tid2.store(gettid(), Ordering::Release);
                set_os_thread_name(&thread_name);

                sem2.signal();

                cb();
            })
            .map_err(|_| WorkerError::SpawnFailed)?;

        sem.wait();

        Ok(Thread {
            handle: Some(handle),
            id: tid.load(Ordering::Acquire),
            name: name.to_string(),
        })
    }

    /// Kernel thread id of the spawned thread
    #[inline]
    pub fn id(&self) -> libc::pid_t {
        self.id
    }

    /// Name the thread was created with
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until the thread function completes
    pub fn join(&mut self) -> SchedResult<()> {
        if let Some(handle) = self.handle.take() {
            handle.join().map_err(|_| WorkerError::Panicked)?;
        }
        Ok(())
    }

    /// Name of the calling thread, as published by the trampoline
    pub fn current_name() -> String {
        THREAD_NAME.with(|n| n.borrow().clone())
    }

    /// Rename the calling thread
    pub fn set_current_name(name: &str) {
        THREAD_NAME.with(|n| *n.borrow_mut() = name.to_string());
        set_os_thread_name(name);
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        // Un-joined threads are detached, like pthread_detach
        drop(self.handle.take());
    }
}

/// Publish the name to the kernel. pthread limits names to 15 bytes + NUL.
fn set_os_thread_name(name: &str) {
    let truncated = &name.as_bytes()[..name.len().min(15)];
    if let Ok(cname) = CString::new(truncated) {
        unsafe {
            libc::pthread_setname_np(libc::pthread_self(), cname.as_ptr());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_constructor_waits_for_init() {
        let ran_init = Arc::new(AtomicBool::new(false));
        let ran_init2 = ran_init.clone();

        let mut t = Thread::new(
            move || {
                // By the time Thread::new returned, the trampoline already
                // signalled; this body may still be pending.
                ran_init2.store(true, Ordering::SeqCst);
            },
            "weft-test",
        )
        .unwrap();

        assert!(t.id() > 0);
        t.join().unwrap();
        assert!(ran_init.load(Ordering::SeqCst));
    }

    #[test]
    fn test_thread_name_published() {
        let mut t = Thread::new(
            || {
                assert_eq!(Thread::current_name(), "named-worker");
            },
            "named-worker",
        )
        .unwrap();
        t.join().unwrap();
        assert_eq!(t.name(), "named-worker");
    }

    #[test]
    fn test_long_name_truncated_for_kernel() {
        // Only the kernel-visible name is truncated; ours is kept whole.
        let long = "a-very-long-thread-name-indeed";
        let mut t = Thread::new(
            move || {
                assert_eq!(Thread::current_name(), "a-very-long-thread-name-indeed");
            },
            long,
        )
        .unwrap();
        t.join().unwrap();
    }
}
