//! Readiness registration.
//!
//! Connections are always registered one-shot: after an event fires the
//! descriptor stays silent until it is explicitly re-armed. Whoever handles
//! the event owns the connection until it re-arms, which is what keeps two
//! workers off the same socket. Hangup and error detection are always on.

use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::ptr;

/// Identifies a registered descriptor; the event loop uses slot indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

/// Registration contract a connection relies on.
pub trait Reactor: Send + Sync {
    fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()>;
    fn rearm(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()>;
    fn deregister(&self, fd: RawFd) -> io::Result<()>;
}

/// A decoded readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    /// Peer hangup or socket error.
    pub hangup: bool,
}

impl Event {
    pub fn from_raw(raw: libc::epoll_event) -> Self {
        let bits = raw.events;
        let token = raw.u64;
        Self {
            token: Token(token as usize),
            readable: bits & libc::EPOLLIN as u32 != 0,
            writable: bits & libc::EPOLLOUT as u32 != 0,
            hangup: bits & (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0,
        }
    }
}

pub struct Epoll {
    fd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    /// Level-triggered, persistent read registration, used for the listening
    /// socket and the waker.
    pub fn watch(&self, fd: RawFd, token: Token) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, libc::EPOLLIN as u32)
    }

    /// Blocks for up to `timeout_ms`. An interrupted wait returns no events.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> io::Result<usize> {
        let res = unsafe {
            libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(res as usize)
    }

    fn one_shot_bits(interest: Interest) -> u32 {
        let base = match interest {
            Interest::Readable => libc::EPOLLIN,
            Interest::Writable => libc::EPOLLOUT,
        };
        (base | libc::EPOLLONESHOT | libc::EPOLLRDHUP) as u32
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: Token, events: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events,
            u64: token.0 as u64,
        };
        if unsafe { libc::epoll_ctl(self.fd, op, fd, &mut event) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Reactor for Epoll {
    fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, Self::one_shot_bits(interest))
    }

    fn rearm(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, Self::one_shot_bits(interest))
    }

    fn deregister(&self, fd: RawFd) -> io::Result<()> {
        if unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) } < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(err);
            }
        }
        Ok(())
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Interrupts a blocked `Epoll::wait` from another thread.
pub struct Waker {
    fd: RawFd,
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn wake(&self) -> io::Result<()> {
        let one: u64 = 1;
        let res = unsafe {
            libc::write(
                self.fd,
                (&one as *const u64).cast::<libc::c_void>(),
                mem::size_of::<u64>(),
            )
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            // A saturated counter is still a pending wakeup.
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Clears pending wakeups.
    pub fn reset(&self) {
        let mut count: u64 = 0;
        unsafe {
            libc::read(
                self.fd,
                (&mut count as *mut u64).cast::<libc::c_void>(),
                mem::size_of::<u64>(),
            );
        }
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
