//! Level-triggered kqueue backend with an `EVFILT_USER` wakeup.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{EventTag, Ready, push_tags};

const MAX_EVENTS: usize = 128;

/// Identifier of the user-event filter used for wakeups.
const WAKE_IDENT: libc::uintptr_t = 0;

/// Cross-thread wake signal. Triggering the user event makes the owning
/// kqueue's wait return; the tag bits ride alongside in `pending`.
pub(crate) struct Wakeup {
    kq: RawFd,
    pending: AtomicU64,
}

impl Wakeup {
    /// Queue `tag` for delivery on the next wake. Safe from any thread.
    pub(crate) fn fire(&self, tag: EventTag) -> io::Result<()> {
        self.pending.fetch_or(tag.bit(), Ordering::Release);
        let change = kev(WAKE_IDENT, libc::EVFILT_USER, 0, libc::NOTE_TRIGGER);
        let ret = unsafe { libc::kevent(self.kq, &change, 1, ptr::null_mut(), 0, ptr::null()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn drain(&self) -> u64 {
        self.pending.swap(0, Ordering::Acquire)
    }
}

pub(crate) struct Poller {
    kq: OwnedFd,
    wakeup: Arc<Wakeup>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        let fd = unsafe { libc::kqueue() };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe {
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
        let poller = Poller {
            kq: unsafe { OwnedFd::from_raw_fd(fd) },
            wakeup: Arc::new(Wakeup {
                kq: fd,
                pending: AtomicU64::new(0),
            }),
        };
        let register = kev(
            WAKE_IDENT,
            libc::EVFILT_USER,
            libc::EV_ADD | libc::EV_CLEAR,
            0,
        );
        poller.change(&register, false)?;
        Ok(poller)
    }

    pub(crate) fn wakeup(&self) -> &Arc<Wakeup> {
        &self.wakeup
    }

    pub(crate) fn add_read(&self, fd: RawFd) -> io::Result<()> {
        self.change(
            &kev(fd as libc::uintptr_t, libc::EVFILT_READ, libc::EV_ADD, 0),
            false,
        )?;
        self.change(
            &kev(fd as libc::uintptr_t, libc::EVFILT_WRITE, libc::EV_DELETE, 0),
            true,
        )
    }

    pub(crate) fn add_read_write(&self, fd: RawFd) -> io::Result<()> {
        self.change(
            &kev(fd as libc::uintptr_t, libc::EVFILT_READ, libc::EV_ADD, 0),
            false,
        )?;
        self.change(
            &kev(fd as libc::uintptr_t, libc::EVFILT_WRITE, libc::EV_ADD, 0),
            false,
        )
    }

    pub(crate) fn mod_read(&self, fd: RawFd) -> io::Result<()> {
        self.add_read(fd)
    }

    pub(crate) fn mod_read_write(&self, fd: RawFd) -> io::Result<()> {
        self.add_read_write(fd)
    }

    pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.change(
            &kev(fd as libc::uintptr_t, libc::EVFILT_READ, libc::EV_DELETE, 0),
            true,
        )?;
        self.change(
            &kev(fd as libc::uintptr_t, libc::EVFILT_WRITE, libc::EV_DELETE, 0),
            true,
        )
    }

    fn change(&self, change: &libc::kevent, ignore_enoent: bool) -> io::Result<()> {
        let ret =
            unsafe { libc::kevent(self.kq.as_raw_fd(), change, 1, ptr::null_mut(), 0, ptr::null()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if ignore_enoent && err.raw_os_error() == Some(libc::ENOENT) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Block until something is ready. Clears and refills `out` with any
    /// pending wakeup tags followed by the ready fds. A connection with
    /// both filters armed may appear once per filter. `EINTR` is retried.
    pub(crate) fn wait(&self, out: &mut Vec<Ready>) -> io::Result<()> {
        let mut events: [libc::kevent; MAX_EVENTS] = unsafe { std::mem::zeroed() };
        let n = loop {
            let ret = unsafe {
                libc::kevent(
                    self.kq.as_raw_fd(),
                    ptr::null(),
                    0,
                    events.as_mut_ptr(),
                    MAX_EVENTS as libc::c_int,
                    ptr::null(),
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
        let woke = events
            .iter()
            .take(n)
            .any(|ev| ev.filter == libc::EVFILT_USER);
        if woke {
            push_tags(self.wakeup.drain(), out);
        }
        for ev in events.iter().take(n) {
            if ev.filter != libc::EVFILT_USER {
                out.push(Ready::Fd(ev.ident as RawFd));
            }
        }
        Ok(())
    }
}

fn kev(ident: libc::uintptr_t, filter: i16, flags: u16, fflags: u32) -> libc::kevent {
    libc::kevent {
        ident,
        filter,
        flags,
        fflags,
        data: 0,
        udata: ptr::null_mut(),
    }
}
