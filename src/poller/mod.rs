//! Readiness poller and cross-thread wakeup.
//!
//! One poller per loop, registered level-triggered so that a declined
//! accept or an unconsumed readiness condition is re-reported on the next
//! wait. The wakeup is a kernel-visible signal (eventfd on Linux, an
//! `EVFILT_USER` event on kqueue) paired with an atomic bitmask of pending
//! tags, so any thread can inject a [`EventTag`] into a loop's wait.

use std::os::fd::RawFd;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
pub(crate) use epoll::{Poller, Wakeup};

#[cfg(any(target_os = "macos", target_os = "ios"))]
mod kqueue;
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub(crate) use kqueue::{Poller, Wakeup};

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios")))]
compile_error!("unsupported platform: a level-triggered epoll or kqueue backend is required");

/// Tags carried by the wakeup into a loop's readiness wait. Repeated fires
/// of one tag between two waits coalesce into a single delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventTag {
    /// Terminate the loop.
    Close,
    /// Run the tick callback on loop 0.
    Tick,
    /// Drain the loop's pending-write queue.
    Write,
}

impl EventTag {
    pub(crate) fn bit(self) -> u64 {
        match self {
            EventTag::Close => 1,
            EventTag::Tick => 2,
            EventTag::Write => 4,
        }
    }
}

/// One readiness item delivered by [`Poller::wait`]. Tags are always
/// ordered before fd events within a single wake.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Ready {
    Tag(EventTag),
    Fd(RawFd),
}

pub(crate) fn push_tags(bits: u64, out: &mut Vec<Ready>) {
    for tag in [EventTag::Close, EventTag::Tick, EventTag::Write] {
        if bits & tag.bit() != 0 {
            out.push(Ready::Tag(tag));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn tags(ready: &[Ready]) -> Vec<EventTag> {
        ready
            .iter()
            .filter_map(|r| match r {
                Ready::Tag(t) => Some(*t),
                Ready::Fd(_) => None,
            })
            .collect()
    }

    #[test]
    fn fire_wakes_wait_and_coalesces() {
        let poller = Poller::new().unwrap();
        let wakeup = poller.wakeup().clone();
        wakeup.fire(EventTag::Tick).unwrap();
        wakeup.fire(EventTag::Tick).unwrap();
        wakeup.fire(EventTag::Write).unwrap();

        let mut ready = Vec::new();
        poller.wait(&mut ready).unwrap();
        assert_eq!(tags(&ready), vec![EventTag::Tick, EventTag::Write]);
    }

    #[test]
    fn fire_from_another_thread() {
        let poller = Poller::new().unwrap();
        let wakeup = Arc::clone(poller.wakeup());
        let firer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            wakeup.fire(EventTag::Close).unwrap();
        });

        let mut ready = Vec::new();
        poller.wait(&mut ready).unwrap();
        firer.join().unwrap();
        assert_eq!(tags(&ready), vec![EventTag::Close]);
    }

    #[test]
    fn reports_readable_fd() {
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let fd = b.as_raw_fd();

        let poller = Poller::new().unwrap();
        poller.add_read(fd).unwrap();
        a.write_all(b"x").unwrap();

        let mut ready = Vec::new();
        poller.wait(&mut ready).unwrap();
        assert!(
            ready
                .iter()
                .any(|r| matches!(r, Ready::Fd(got) if *got == fd))
        );
        poller.delete(fd).unwrap();
    }

    #[test]
    fn interest_changes_are_idempotent() {
        let (_a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let fd = b.as_raw_fd();

        let poller = Poller::new().unwrap();
        poller.add_read(fd).unwrap();
        poller.add_read(fd).unwrap();
        poller.mod_read_write(fd).unwrap();
        poller.mod_read_write(fd).unwrap();
        poller.mod_read(fd).unwrap();
        poller.mod_read(fd).unwrap();
        poller.delete(fd).unwrap();
        poller.delete(fd).unwrap();
        // interest changes on an unregistered fd register it
        poller.mod_read(fd).unwrap();
        poller.delete(fd).unwrap();
    }
}
