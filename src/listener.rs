use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::path::PathBuf;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::addr::{Endpoint, Proto};
use crate::error::Error;

const BACKLOG: i32 = 1024;

/// The server's listening socket. One per server, shared read-only among
/// all loops; every loop registers the fd with its own poller and races
/// non-blocking accepts on readiness.
pub(crate) struct Listener {
    socket: Socket,
    local: SockAddr,
    unix_path: Option<PathBuf>,
}

impl Listener {
    pub(crate) fn bind(endpoint: &Endpoint) -> Result<Listener, Error> {
        match endpoint.proto {
            Proto::Unix => Listener::bind_unix(&endpoint.addr),
            _ => Listener::bind_tcp(endpoint),
        }
    }

    fn bind_tcp(endpoint: &Endpoint) -> Result<Listener, Error> {
        let addr = resolve_tcp(endpoint)?;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        if endpoint.reuse_port {
            socket.set_reuse_port(true)?;
        }
        socket.bind(&addr.into())?;
        socket.listen(BACKLOG)?;
        socket.set_nonblocking(true)?;
        let local = socket.local_addr()?;
        Ok(Listener {
            socket,
            local,
            unix_path: None,
        })
    }

    fn bind_unix(path: &str) -> Result<Listener, Error> {
        // A stale socket inode from an unclean exit would fail the bind.
        let _ = std::fs::remove_file(path);
        let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        socket.bind(&SockAddr::unix(path)?)?;
        socket.listen(BACKLOG)?;
        socket.set_nonblocking(true)?;
        let local = socket.local_addr()?;
        Ok(Listener {
            socket,
            local,
            unix_path: Some(PathBuf::from(path)),
        })
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub(crate) fn local_addr(&self) -> &SockAddr {
        &self.local
    }

    pub(crate) fn is_tcp(&self) -> bool {
        self.unix_path.is_none()
    }

    /// One non-blocking accept attempt. `Ok(None)` means nothing was
    /// pending; the poller will report the listener again.
    pub(crate) fn accept(&self) -> io::Result<Option<(RawFd, SockAddr)>> {
        match self.socket.accept() {
            Ok((socket, remote)) => {
                socket.set_nonblocking(true)?;
                Ok(Some((socket.into_raw_fd(), remote)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(path) = &self.unix_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Resolve the endpoint's `host:port` fragment, defaulting missing pieces
/// to an ephemeral wildcard bind.
fn resolve_tcp(endpoint: &Endpoint) -> Result<SocketAddr, Error> {
    let mut text = endpoint.addr.clone();
    if text.is_empty() {
        text.push_str(":0");
    }
    if text.starts_with(':') {
        let host = match endpoint.proto {
            Proto::Tcp6 => "[::]",
            _ => "0.0.0.0",
        };
        text = format!("{host}{text}");
    }

    let candidates = text
        .to_socket_addrs()
        .map_err(|e| Error::InvalidAddress(format!("{:?}: {e}", endpoint.addr)))?;
    let mut fallback = None;
    for candidate in candidates {
        let matches_proto = match endpoint.proto {
            Proto::Tcp4 => candidate.is_ipv4(),
            Proto::Tcp6 => candidate.is_ipv6(),
            _ => true,
        };
        if matches_proto {
            return Ok(candidate);
        }
        fallback.get_or_insert(candidate);
    }
    match (endpoint.proto, fallback) {
        (Proto::Tcp, Some(addr)) => Ok(addr),
        _ => Err(Error::InvalidAddress(format!(
            "{:?} has no address for the requested protocol",
            endpoint.addr
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr;

    #[test]
    fn binds_ephemeral_tcp() {
        let endpoint = addr::parse("tcp://127.0.0.1:0").unwrap();
        let listener = Listener::bind(&endpoint).unwrap();
        assert!(listener.is_tcp());
        let local = listener.local_addr().as_socket().unwrap();
        assert_ne!(local.port(), 0);
        // nothing pending yet
        assert!(listener.accept().unwrap().is_none());
    }

    #[test]
    fn binds_empty_host_and_port() {
        let endpoint = addr::parse("tcp://").unwrap();
        let listener = Listener::bind(&endpoint).unwrap();
        assert_ne!(listener.local_addr().as_socket().unwrap().port(), 0);
    }

    #[test]
    fn unix_socket_inode_is_unlinked_on_drop() {
        let path = std::env::temp_dir().join(format!("gyre-listener-{}.sock", std::process::id()));
        let endpoint = addr::parse(&format!("unix://{}", path.display())).unwrap();
        let listener = Listener::bind(&endpoint).unwrap();
        assert!(!listener.is_tcp());
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());
    }
}
