//! The per-thread event loop: owns a poller, a scratch read buffer, and
//! the fd→connection map, and drives the connection state machine.
//!
//! Dispatch for a ready fd picks exactly one transition in priority
//! order: listener accept, first-readiness open, pending-write drain,
//! deferred action, read. Level-triggered registration re-reports the fd
//! until the state machine has nothing left to do with it.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use ahash::AHashMap;
use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::connection::{Connection, WriteRequest};
use crate::error::Error;
use crate::events::{Action, Events};
use crate::metrics::{BYTES_RECEIVED, BYTES_SENT, CONNECTIONS_ACCEPTED, CONNECTIONS_ACTIVE};
use crate::poller::{EventTag, Poller, Ready};
use crate::server::Shared;

const SCRATCH_LEN: usize = 64 * 1024;

/// Why a loop stopped dispatching.
pub(crate) enum LoopExit {
    /// A callback requested server shutdown. Internal sentinel, never
    /// surfaced to users.
    Closing,
    /// Unrecoverable poller failure.
    Fatal(Error),
}

type Dispatch = Result<(), LoopExit>;

pub(crate) struct EventLoop<E: Events> {
    pub(crate) idx: usize,
    pub(crate) shared: Arc<Shared<E>>,
    pub(crate) poller: Poller,
    scratch: Vec<u8>,
    conns: AHashMap<RawFd, Connection>,
    count: Arc<AtomicI32>,
    write_rx: Receiver<WriteRequest>,
    write_tx: Sender<WriteRequest>,
    next_id: u64,
}

impl<E: Events> EventLoop<E> {
    pub(crate) fn new(idx: usize, shared: Arc<Shared<E>>) -> Result<EventLoop<E>, Error> {
        let poller = Poller::new()?;
        poller.add_read(shared.listener.raw_fd())?;
        let count = Arc::clone(&shared.counts[idx]);
        let (write_tx, write_rx) = unbounded();
        Ok(EventLoop {
            idx,
            shared,
            poller,
            scratch: vec![0u8; SCRATCH_LEN],
            conns: AHashMap::new(),
            count,
            write_rx,
            write_tx,
            next_id: 0,
        })
    }

    /// Run until a callback requests shutdown, a `Close` tag arrives, or
    /// the poller fails.
    pub(crate) fn run(&mut self) -> Result<(), Error> {
        tracing::debug!(idx = self.idx, "event loop started");
        let mut ready = Vec::with_capacity(256);
        loop {
            self.poller.wait(&mut ready).map_err(Error::Io)?;
            for item in ready.drain(..) {
                match self.dispatch(item) {
                    Ok(()) => {}
                    Err(LoopExit::Closing) => {
                        tracing::debug!(idx = self.idx, "event loop closing");
                        return Ok(());
                    }
                    Err(LoopExit::Fatal(e)) => return Err(e),
                }
            }
        }
    }

    fn dispatch(&mut self, item: Ready) -> Dispatch {
        match item {
            Ready::Tag(tag) => self.on_tag(tag),
            Ready::Fd(fd) => self.on_fd(fd),
        }
    }

    fn on_tag(&mut self, tag: EventTag) -> Dispatch {
        match tag {
            EventTag::Close => Err(LoopExit::Closing),
            EventTag::Tick => self.on_tick(),
            EventTag::Write => self.drain_write_queue(),
        }
    }

    fn on_tick(&mut self) -> Dispatch {
        if let Some((delay, action)) = self.shared.events.tick() {
            if action == Action::Shutdown {
                return Err(LoopExit::Closing);
            }
            let _ = self.shared.tick_tx.send(delay);
        }
        Ok(())
    }

    /// Apply queued cross-thread writes. The wakeup coalesces repeated
    /// `Write` tags, so one delivery drains the whole queue.
    fn drain_write_queue(&mut self) -> Dispatch {
        while let Ok(request) = self.write_rx.try_recv() {
            let Some(conn) = self.conns.get_mut(&request.fd) else {
                continue;
            };
            if conn.id != request.id {
                continue;
            }
            conn.out.extend_from_slice(&request.data);
            self.poller.mod_read_write(request.fd).map_err(fatal)?;
        }
        Ok(())
    }

    fn on_fd(&mut self, fd: RawFd) -> Dispatch {
        if fd == self.shared.listener.raw_fd() {
            return self.accept();
        }
        let Some(conn) = self.conns.get(&fd) else {
            return Ok(());
        };
        if !conn.opened {
            self.opened(fd)
        } else if !conn.out.is_empty() {
            self.write(fd)
        } else if conn.action != Action::None {
            self.action(fd)
        } else {
            self.read(fd)
        }
    }

    fn accept(&mut self) -> Dispatch {
        if !self.shared.should_accept(self.idx) {
            return Ok(());
        }
        let (fd, remote) = match self.shared.listener.accept() {
            Ok(Some(accepted)) => accepted,
            Ok(None) => return Ok(()),
            Err(e) => {
                // fd exhaustion and friends: drop this accept, keep serving
                tracing::warn!(idx = self.idx, error = %e, "accept failed");
                return Ok(());
            }
        };

        self.shared.accepted.fetch_add(1, Ordering::Relaxed);
        CONNECTIONS_ACCEPTED.increment();
        CONNECTIONS_ACTIVE.increment();

        let id = self.next_id;
        self.next_id += 1;
        let conn = Connection::new(
            fd,
            id,
            self.idx,
            self.shared.listener.local_addr().clone(),
            remote,
            self.write_tx.clone(),
            Arc::clone(self.poller.wakeup()),
        );
        self.conns.insert(fd, conn);
        self.poller.add_read_write(fd).map_err(fatal)?;
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn opened(&mut self, fd: RawFd) -> Dispatch {
        let Some(conn) = self.conns.get_mut(&fd) else {
            return Ok(());
        };
        conn.opened = true;
        let (out, opts, action) = self.shared.events.opened(conn);
        conn.action = action;
        conn.reuse_input_buffer = opts.reuse_input_buffer;
        if !out.is_empty() {
            conn.out = out;
        }
        if self.shared.listener.is_tcp() && !opts.tcp_keep_alive.is_zero() {
            if let Err(e) = conn.set_keepalive(opts.tcp_keep_alive) {
                tracing::warn!(fd, error = %e, "failed to enable tcp keep-alive");
            }
        }
        if conn.out.is_empty() && conn.action == Action::None {
            self.poller.mod_read(fd).map_err(fatal)?;
        }
        Ok(())
    }

    fn write(&mut self, fd: RawFd) -> Dispatch {
        let Some(conn) = self.conns.get_mut(&fd) else {
            return Ok(());
        };
        let ret = unsafe {
            libc::write(
                fd,
                conn.out.as_ptr() as *const libc::c_void,
                conn.out.len(),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return self.close(fd, Some(err));
        }
        let n = ret as usize;
        BYTES_SENT.add(n as u64);
        if n == conn.out.len() {
            conn.out.clear();
        } else {
            conn.out.drain(..n);
        }
        if conn.out.is_empty() && conn.action == Action::None {
            self.poller.mod_read(fd).map_err(fatal)?;
        }
        Ok(())
    }

    fn action(&mut self, fd: RawFd) -> Dispatch {
        let action = match self.conns.get(&fd) {
            Some(conn) => conn.action,
            None => return Ok(()),
        };
        match action {
            Action::Close => self.close(fd, None),
            Action::Shutdown => Err(LoopExit::Closing),
            Action::None => {
                if let Some(conn) = self.conns.get_mut(&fd) {
                    conn.action = Action::None;
                    if conn.out.is_empty() {
                        self.poller.mod_read(fd).map_err(fatal)?;
                    }
                }
                Ok(())
            }
        }
    }

    fn read(&mut self, fd: RawFd) -> Dispatch {
        let ret = unsafe {
            libc::read(
                fd,
                self.scratch.as_mut_ptr() as *mut libc::c_void,
                self.scratch.len(),
            )
        };
        if ret == 0 {
            return self.close(fd, None);
        }
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return self.close(fd, Some(err));
        }
        let n = ret as usize;
        BYTES_RECEIVED.add(n as u64);

        let Some(conn) = self.conns.get_mut(&fd) else {
            return Ok(());
        };
        let (out, action) = if conn.reuse_input_buffer {
            self.shared.events.data(conn, &self.scratch[..n])
        } else {
            let input = self.scratch[..n].to_vec();
            self.shared.events.data(conn, &input)
        };
        conn.action = action;
        if !out.is_empty() {
            conn.out = out;
        }
        if !conn.out.is_empty() || conn.action != Action::None {
            self.poller.mod_read_write(fd).map_err(fatal)?;
        }
        Ok(())
    }

    /// Retire a connection: drop it from the map and poller, close the fd,
    /// and fire `closed` exactly once.
    fn close(&mut self, fd: RawFd, err: Option<io::Error>) -> Dispatch {
        let Some(mut conn) = self.conns.remove(&fd) else {
            return Ok(());
        };
        self.count.fetch_sub(1, Ordering::Relaxed);
        CONNECTIONS_ACTIVE.decrement();
        let _ = self.poller.delete(fd);
        unsafe {
            libc::close(fd);
        }
        if self.shared.events.closed(&mut conn, err) == Action::Shutdown {
            return Err(LoopExit::Closing);
        }
        Ok(())
    }

    /// Close every surviving connection during server teardown. Runs on
    /// the serve thread after this loop's thread has exited.
    pub(crate) fn teardown(&mut self) {
        for (fd, mut conn) in self.conns.drain() {
            self.count.fetch_sub(1, Ordering::Relaxed);
            CONNECTIONS_ACTIVE.decrement();
            let _ = self.poller.delete(fd);
            unsafe {
                libc::close(fd);
            }
            let _ = self.shared.events.closed(&mut conn, None);
        }
    }
}

fn fatal(e: io::Error) -> LoopExit {
    LoopExit::Fatal(Error::Io(e))
}
