//! High-level TCP wrappers over the syscall hooks
//!
//! `TcpListener` and `TcpStream` give fibers a Go-like blocking API:
//!
//! ```ignore
//! let listener = TcpListener::bind(8080)?;
//! loop {
//!     let stream = listener.accept()?;
//!     reactor.schedule(ScheduleTask::call(move || {
//!         handle_connection(stream);
//!     }));
//! }
//! ```
//!
//! Every call goes through the hook layer, so on a reactor worker these
//! park the fiber; on an unhooked thread they behave like the raw calls.

use crate::syscall;

use libc::{c_int, c_void};
use std::io;
use std::os::unix::io::RawFd;

fn os_error() -> io::Error {
    io::Error::from_raw_os_error(syscall::errno())
}

/// A listening TCP socket bound to 127.0.0.1
pub struct TcpListener {
    fd: RawFd,
}

impl TcpListener {
    /// Bind and listen on localhost. Port 0 asks the kernel for a free
    /// port; query it with `local_port`.
    pub fn bind(port: u16) -> io::Result<TcpListener> {
        let fd = syscall::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(os_error());
        }

        unsafe {
            let opt: c_int = 1;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &opt as *const c_int as *const c_void,
                std::mem::size_of::<c_int>() as libc::socklen_t,
            );
        }

        let addr = loopback_addr(port);
        let rt = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rt != 0 {
            let err = os_error();
            syscall::close(fd);
            return Err(err);
        }

        if unsafe { libc::listen(fd, 1024) } != 0 {
            let err = os_error();
            syscall::close(fd);
            return Err(err);
        }

        Ok(TcpListener { fd })
    }

    /// Port the kernel actually bound
    pub fn local_port(&self) -> io::Result<u16> {
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rt = unsafe {
            libc::getsockname(
                self.fd,
                &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rt != 0 {
            return Err(os_error());
        }
        Ok(u16::from_be(addr.sin_port))
    }

    /// Accept a connection, parking the calling fiber until one arrives
    pub fn accept(&self) -> io::Result<TcpStream> {
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let fd = unsafe {
            syscall::accept(
                self.fd,
                &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            )
        };
        if fd < 0 {
            return Err(os_error());
        }
        Ok(TcpStream { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        syscall::close(self.fd);
    }
}

/// A connected TCP socket
pub struct TcpStream {
    fd: RawFd,
}

impl TcpStream {
    /// Connect to 127.0.0.1:port, parking the fiber during the handshake
    pub fn connect(port: u16) -> io::Result<TcpStream> {
        let fd = syscall::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(os_error());
        }

        let addr = loopback_addr(port);
        let rt = unsafe {
            syscall::connect(
                fd,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rt != 0 {
            let err = os_error();
            syscall::close(fd);
            return Err(err);
        }
        Ok(TcpStream { fd })
    }

    /// Wrap an fd already produced by accept/connect
    pub fn from_raw(fd: RawFd) -> TcpStream {
        TcpStream { fd }
    }

    /// Read into `buf`. Ok(0) means the peer closed the connection.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { syscall::recv(self.fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        if n < 0 {
            return Err(os_error());
        }
        Ok(n as usize)
    }

    /// Write the whole buffer
    pub fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut sent = 0;
        while sent < buf.len() {
            let n = unsafe {
                syscall::send(
                    self.fd,
                    buf[sent..].as_ptr() as *const c_void,
                    buf.len() - sent,
                    0,
                )
            };
            if n < 0 {
                return Err(os_error());
            }
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero));
            }
            sent += n as usize;
        }
        Ok(())
    }

    /// Per-direction timeout, honored by the hooked data path
    pub fn set_read_timeout(&self, ms: u64) -> io::Result<()> {
        self.set_timeout(libc::SO_RCVTIMEO, ms)
    }

    pub fn set_write_timeout(&self, ms: u64) -> io::Result<()> {
        self.set_timeout(libc::SO_SNDTIMEO, ms)
    }

    fn set_timeout(&self, optname: c_int, ms: u64) -> io::Result<()> {
        let tv = libc::timeval {
            tv_sec: (ms / 1000) as libc::time_t,
            tv_usec: ((ms % 1000) * 1000) as libc::suseconds_t,
        };
        let rt = unsafe {
            syscall::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                optname,
                &tv as *const libc::timeval as *const c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if rt != 0 {
            return Err(os_error());
        }
        Ok(())
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Close explicitly; waiters on the fd are cancelled first
    pub fn close(self) -> io::Result<()> {
        let fd = self.fd;
        std::mem::forget(self);
        if syscall::close(fd) != 0 {
            return Err(os_error());
        }
        Ok(())
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        syscall::close(self.fd);
    }
}

fn loopback_addr(port: u16) -> libc::sockaddr_in {
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr = libc::in_addr {
        s_addr: u32::from(std::net::Ipv4Addr::LOCALHOST).to_be(),
    };
    addr
}
