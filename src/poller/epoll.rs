//! Level-triggered epoll backend with an eventfd wakeup.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{EventTag, Ready, push_tags};

const MAX_EVENTS: usize = 128;

/// Cross-thread wake signal. Writing the eventfd makes it readable in the
/// owning poller's wait; the tag bits ride alongside in `pending`.
pub(crate) struct Wakeup {
    efd: OwnedFd,
    pending: AtomicU64,
}

impl Wakeup {
    fn new() -> io::Result<Wakeup> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Wakeup {
            efd: unsafe { OwnedFd::from_raw_fd(fd) },
            pending: AtomicU64::new(0),
        })
    }

    /// Queue `tag` for delivery on the next wake. Safe from any thread.
    pub(crate) fn fire(&self, tag: EventTag) -> io::Result<()> {
        self.pending.fetch_or(tag.bit(), Ordering::Release);
        let one: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.efd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // A saturated counter still leaves the fd readable.
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }

    fn drain(&self) -> u64 {
        let mut counter: u64 = 0;
        unsafe {
            libc::read(
                self.efd.as_raw_fd(),
                &mut counter as *mut u64 as *mut libc::c_void,
                8,
            );
        }
        self.pending.swap(0, Ordering::Acquire)
    }
}

pub(crate) struct Poller {
    epfd: OwnedFd,
    wakeup: Arc<Wakeup>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let poller = Poller {
            epfd: unsafe { OwnedFd::from_raw_fd(fd) },
            wakeup: Arc::new(Wakeup::new()?),
        };
        poller.arm(poller.wakeup.efd.as_raw_fd(), libc::EPOLLIN as u32)?;
        Ok(poller)
    }

    pub(crate) fn wakeup(&self) -> &Arc<Wakeup> {
        &self.wakeup
    }

    pub(crate) fn add_read(&self, fd: RawFd) -> io::Result<()> {
        self.arm(fd, libc::EPOLLIN as u32)
    }

    pub(crate) fn add_read_write(&self, fd: RawFd) -> io::Result<()> {
        self.arm(fd, (libc::EPOLLIN | libc::EPOLLOUT) as u32)
    }

    pub(crate) fn mod_read(&self, fd: RawFd) -> io::Result<()> {
        self.arm(fd, libc::EPOLLIN as u32)
    }

    pub(crate) fn mod_read_write(&self, fd: RawFd) -> io::Result<()> {
        self.arm(fd, (libc::EPOLLIN | libc::EPOLLOUT) as u32)
    }

    pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
        match self.ctl(libc::EPOLL_CTL_DEL, fd, 0) {
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            other => other,
        }
    }

    /// Set `fd`'s interest to exactly `events`, registering it first if
    /// needed. Makes every interest change idempotent.
    fn arm(&self, fd: RawFd, events: u32) -> io::Result<()> {
        match self.ctl(libc::EPOLL_CTL_ADD, fd, events) {
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                self.ctl(libc::EPOLL_CTL_MOD, fd, events)
            }
            other => other,
        }
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut event) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block until something is ready. Clears and refills `out` with any
    /// pending wakeup tags followed by the ready fds. `EINTR` is retried.
    pub(crate) fn wait(&self, out: &mut Vec<Ready>) -> io::Result<()> {
        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };
        let n = loop {
            let ret = unsafe {
                libc::epoll_wait(
                    self.epfd.as_raw_fd(),
                    events.as_mut_ptr(),
                    MAX_EVENTS as libc::c_int,
                    -1,
                )
            };
            if ret >= 0 {
                break ret as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };

        out.clear();
        let wake_fd = self.wakeup.efd.as_raw_fd();
        let mut woke = false;
        for event in events.iter().take(n) {
            let ev = *event;
            if ev.u64 as RawFd == wake_fd {
                woke = true;
            }
        }
        if woke {
            push_tags(self.wakeup.drain(), out);
        }
        for event in events.iter().take(n) {
            let ev = *event;
            let fd = ev.u64 as RawFd;
            if fd != wake_fd {
                out.push(Ready::Fd(fd));
            }
        }
        Ok(())
    }
}
