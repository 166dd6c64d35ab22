use std::any::Any;
use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use socket2::{SockAddr, SockRef, TcpKeepalive};

use crate::events::Action;
use crate::poller::{EventTag, Wakeup};

/// Bytes queued for a connection from outside its owning loop. Tagged with
/// the connection id so a recycled fd cannot receive another connection's
/// payload.
pub(crate) struct WriteRequest {
    pub(crate) fd: RawFd,
    pub(crate) id: u64,
    pub(crate) data: Vec<u8>,
}

/// Per-connection state. Owned by exactly one loop for the connection's
/// whole lifetime; callbacks receive it by mutable reference and every
/// mutation happens on the owning loop thread.
pub struct Connection {
    pub(crate) fd: RawFd,
    pub(crate) id: u64,
    pub(crate) loop_idx: usize,
    pub(crate) opened: bool,
    pub(crate) reuse_input_buffer: bool,
    pub(crate) action: Action,
    pub(crate) out: Vec<u8>,
    local: SockAddr,
    remote: SockAddr,
    ctx: Option<Box<dyn Any + Send>>,
    write_tx: Sender<WriteRequest>,
    wakeup: Arc<Wakeup>,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        fd: RawFd,
        id: u64,
        loop_idx: usize,
        local: SockAddr,
        remote: SockAddr,
        write_tx: Sender<WriteRequest>,
        wakeup: Arc<Wakeup>,
    ) -> Connection {
        Connection {
            fd,
            id,
            loop_idx,
            opened: false,
            reuse_input_buffer: false,
            action: Action::None,
            out: Vec::new(),
            local,
            remote,
            ctx: None,
            write_tx,
            wakeup,
        }
    }

    /// The listener address this connection arrived on.
    pub fn local_addr(&self) -> &SockAddr {
        &self.local
    }

    /// The peer address reported by accept.
    pub fn remote_addr(&self) -> &SockAddr {
        &self.remote
    }

    /// Index of the loop that owns this connection.
    pub fn loop_index(&self) -> usize {
        self.loop_idx
    }

    /// Attach an arbitrary user value to the connection. Replaces any
    /// previous context.
    pub fn set_context<T: Any + Send>(&mut self, ctx: T) {
        self.ctx = Some(Box::new(ctx));
    }

    pub fn context<T: Any + Send>(&self) -> Option<&T> {
        self.ctx.as_deref().and_then(|c| c.downcast_ref())
    }

    pub fn context_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.ctx.as_deref_mut().and_then(|c| c.downcast_mut())
    }

    pub fn take_context(&mut self) -> Option<Box<dyn Any + Send>> {
        self.ctx.take()
    }

    /// A cloneable handle for writing to this connection from outside its
    /// callbacks, including from other threads.
    pub fn handle(&self) -> ConnHandle {
        ConnHandle {
            fd: self.fd,
            id: self.id,
            write_tx: self.write_tx.clone(),
            wakeup: Arc::clone(&self.wakeup),
        }
    }

    pub(crate) fn set_keepalive(&self, idle: Duration) -> io::Result<()> {
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd) };
        let sock = SockRef::from(&fd);
        sock.set_keepalive(true)?;
        sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))
    }
}

/// Write access to a connection from any thread.
///
/// Every write is posted to the owning loop's pending-write queue and a
/// wakeup is fired; the loop appends the bytes to the connection's
/// outbound buffer on delivery. There is no direct-write fast path, which
/// is what makes the handle safe to use from outside the loop. Writes to
/// a connection that has since closed are silently dropped; writes after
/// the loop itself has shut down report `BrokenPipe`.
#[derive(Clone)]
pub struct ConnHandle {
    fd: RawFd,
    id: u64,
    write_tx: Sender<WriteRequest>,
    wakeup: Arc<Wakeup>,
}

impl ConnHandle {
    pub fn write(&self, data: &[u8]) -> io::Result<()> {
        let request = WriteRequest {
            fd: self.fd,
            id: self.id,
            data: data.to_vec(),
        };
        self.write_tx
            .send(request)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "event loop has shut down"))?;
        self.wakeup.fire(EventTag::Write)
    }
}
