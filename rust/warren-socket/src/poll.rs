//! Readiness poller: epoll on Linux, kqueue on BSD/macOS.
//!
//! Sockets are registered read-only; write interest is toggled with
//! [`Poller::set_write`] as buffers fill and drain. Registration carries a
//! `u64` key (the slot index, or the control-pipe sentinel) that comes
//! back on every event. All operations are safe to call from any thread
//! (the kernel serializes `epoll_ctl`/`kevent`), which is what lets the
//! direct-write path arm write-readiness without the reactor's help.

use std::io;
use std::os::unix::io::RawFd;

/// Maximum events drained per wait call.
pub const MAX_EVENT: usize = 64;

/// One readiness event.
#[derive(Debug, Clone, Copy, Default)]
pub struct PollEvent {
    pub key: u64,
    pub read: bool,
    pub write: bool,
    pub error: bool,
}

// ---------------------------------------------------------------------------
// epoll (Linux)
// ---------------------------------------------------------------------------

#[cfg(target_os = "linux")]
#[derive(Debug)]
pub struct Poller {
    epfd: RawFd,
}

#[cfg(target_os = "linux")]
impl Poller {
    pub fn new() -> io::Result<Poller> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Poller { epfd })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, key: u64) -> io::Result<()> {
        let mut ev = libc::epoll_event { events, u64: key };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Watch `fd` for readability.
    pub fn add(&self, fd: RawFd, key: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, libc::EPOLLIN as u32, key)
    }

    /// Stop watching `fd` entirely.
    pub fn del(&self, fd: RawFd) {
        let _ = self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0);
    }

    /// Toggle write interest; read interest stays on.
    pub fn set_write(&self, fd: RawFd, key: u64, enable: bool) {
        let events = libc::EPOLLIN as u32 | if enable { libc::EPOLLOUT as u32 } else { 0 };
        let _ = self.ctl(libc::EPOLL_CTL_MOD, fd, events, key);
    }

    /// Block until events are ready; fills `out` and returns the count.
    pub fn wait(&self, out: &mut [PollEvent; MAX_EVENT]) -> io::Result<usize> {
        let mut raw: [libc::epoll_event; MAX_EVENT] = unsafe { std::mem::zeroed() };
        let n = unsafe {
            libc::epoll_wait(self.epfd, raw.as_mut_ptr(), MAX_EVENT as libc::c_int, -1)
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        for i in 0..n as usize {
            let flags = raw[i].events;
            out[i] = PollEvent {
                key: raw[i].u64,
                read: (flags & (libc::EPOLLIN | libc::EPOLLHUP) as u32) != 0,
                write: (flags & libc::EPOLLOUT as u32) != 0,
                error: (flags & libc::EPOLLERR as u32) != 0,
            };
        }
        Ok(n as usize)
    }
}

#[cfg(target_os = "linux")]
impl Drop for Poller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}

// ---------------------------------------------------------------------------
// kqueue (BSD / macOS)
// ---------------------------------------------------------------------------

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
#[derive(Debug)]
pub struct Poller {
    kqfd: RawFd,
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
impl Poller {
    pub fn new() -> io::Result<Poller> {
        let kqfd = unsafe { libc::kqueue() };
        if kqfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Poller { kqfd })
    }

    fn change(&self, fd: RawFd, filter: i16, flags: u16, key: u64) -> io::Result<()> {
        let ev = libc::kevent {
            ident: fd as usize,
            filter,
            flags,
            fflags: 0,
            data: 0,
            udata: key as *mut libc::c_void,
        };
        let rc = unsafe { libc::kevent(self.kqfd, &ev, 1, std::ptr::null_mut(), 0, std::ptr::null()) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn add(&self, fd: RawFd, key: u64) -> io::Result<()> {
        self.change(fd, libc::EVFILT_READ, libc::EV_ADD, key)
    }

    pub fn del(&self, fd: RawFd) {
        let _ = self.change(fd, libc::EVFILT_READ, libc::EV_DELETE, 0);
        let _ = self.change(fd, libc::EVFILT_WRITE, libc::EV_DELETE, 0);
    }

    pub fn set_write(&self, fd: RawFd, key: u64, enable: bool) {
        if enable {
            let _ = self.change(fd, libc::EVFILT_WRITE, libc::EV_ADD, key);
        } else {
            let _ = self.change(fd, libc::EVFILT_WRITE, libc::EV_DELETE, key);
        }
    }

    pub fn wait(&self, out: &mut [PollEvent; MAX_EVENT]) -> io::Result<usize> {
        let mut raw: [libc::kevent; MAX_EVENT] = unsafe { std::mem::zeroed() };
        let n = unsafe {
            libc::kevent(
                self.kqfd,
                std::ptr::null(),
                0,
                raw.as_mut_ptr(),
                MAX_EVENT as libc::c_int,
                std::ptr::null(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        for i in 0..n as usize {
            let ev = &raw[i];
            out[i] = PollEvent {
                key: ev.udata as u64,
                read: ev.filter == libc::EVFILT_READ,
                write: ev.filter == libc::EVFILT_WRITE,
                error: (ev.flags & libc::EV_ERROR) != 0,
            };
        }
        Ok(n as usize)
    }
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
impl Drop for Poller {
    fn drop(&mut self) {
        unsafe { libc::close(self.kqfd) };
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys;

    #[test]
    fn pipe_readability_round_trip() {
        let poller = Poller::new().unwrap();
        let (rd, wr) = sys::pipe().unwrap();
        poller.add(rd, 99).unwrap();

        let n = unsafe { libc::write(wr, b"x".as_ptr().cast(), 1) };
        assert_eq!(n, 1);

        let mut events = [PollEvent::default(); MAX_EVENT];
        let count = poller.wait(&mut events).unwrap();
        assert_eq!(count, 1);
        assert_eq!(events[0].key, 99);
        assert!(events[0].read);
        assert!(!events[0].write);

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }
}
