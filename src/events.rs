use std::io;
use std::time::Duration;

use socket2::SockAddr;

use crate::connection::Connection;

/// Directive returned by every callback. The owning loop performs the
/// associated transition after the callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    /// Keep serving the connection.
    #[default]
    None,
    /// Close this connection once its outbound buffer has drained.
    Close,
    /// Stop the entire server.
    Shutdown,
}

/// Which loop accepts an incoming connection when more than one loop is
/// attached to the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalance {
    /// Every loop races to accept; the kernel picks the winner.
    #[default]
    Random,
    /// Loops accept in turn, driven by a shared accept counter.
    RoundRobin,
    /// Only loops with the fewest live connections accept.
    LeastConnections,
}

/// Per-connection options returned by [`Events::opened`].
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Keep-alive idle interval. A non-zero value enables `SO_KEEPALIVE`
    /// on the connection when the listener is TCP; zero leaves it off.
    pub tcp_keep_alive: Duration,
    /// When true, the slice passed to [`Events::data`] aliases the loop's
    /// scratch read buffer and is invalidated when the callback returns.
    /// When false each call receives a freshly allocated copy.
    pub reuse_input_buffer: bool,
}

/// Facts about the running server, passed once to [`Events::serving`].
#[derive(Debug, Clone)]
pub struct ServerInfo {
    /// Number of event loops the server is running.
    pub num_loops: usize,
    /// The address the listener is bound to.
    pub local_addr: SockAddr,
}

/// The user contract. Implementations are shared by every loop thread, so
/// they must be `Send + Sync`; shared mutable state belongs behind atomics
/// or locks. Per-connection callbacks are serialized on the owning loop.
///
/// Callbacks run on a loop's hot path and must not perform blocking
/// syscalls. Use [`Connection::handle`] plus a separate thread for work
/// that has to block, and [`Events::tick`] for timers.
pub trait Events: Send + Sync + 'static {
    /// Number of event loops to run. `0` means one loop per CPU core,
    /// any other value is used as-is.
    fn num_loops(&self) -> usize {
        1
    }

    /// Accept load-balancing policy. Only consulted when more than one
    /// loop is running.
    fn load_balance(&self) -> LoadBalance {
        LoadBalance::Random
    }

    /// Called once after the listener is bound and before any I/O.
    /// Returning [`Action::Shutdown`] tears the server down immediately.
    fn serving(&self, _srv: &ServerInfo) -> Action {
        Action::None
    }

    /// A connection has been accepted and has seen its first readiness
    /// event. The returned bytes are queued for transmission.
    fn opened(&self, _conn: &mut Connection) -> (Vec<u8>, Options, Action) {
        (Vec::new(), Options::default(), Action::None)
    }

    /// The connection has been closed and removed from its loop. `err` is
    /// `None` for orderly closes (peer EOF, [`Action::Close`], server
    /// teardown) and carries the I/O error otherwise. Called exactly once
    /// per connection.
    fn closed(&self, _conn: &mut Connection, _err: Option<io::Error>) -> Action {
        Action::None
    }

    /// Bytes arrived. The returned bytes are queued for transmission.
    /// See [`Options::reuse_input_buffer`] for the lifetime of `input`.
    fn data(&self, _conn: &mut Connection, _input: &[u8]) -> (Vec<u8>, Action) {
        (Vec::new(), Action::None)
    }

    /// Periodic timer on loop 0. Return the delay until the next tick.
    /// `None` (the default) disables ticking for the rest of the server's
    /// lifetime.
    fn tick(&self) -> Option<(Duration, Action)> {
        None
    }
}
