//! Endpoint syntax: `proto://host[:port][?query]` where proto is one of
//! `tcp`, `tcp4`, `tcp6`, `unix`. Missing host or port is valid for TCP
//! and binds an ephemeral address. The only recognized query parameter is
//! `reuseport=<truthy>`; unknown parameters are ignored.

use crate::error::Error;

/// Listener protocol selected by the endpoint scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Proto {
    Tcp,
    Tcp4,
    Tcp6,
    Unix,
}

/// A parsed endpoint. For TCP `addr` is a `host:port` fragment (possibly
/// empty or port-only); for Unix it is the socket path.
#[derive(Debug, Clone)]
pub(crate) struct Endpoint {
    pub proto: Proto,
    pub addr: String,
    pub reuse_port: bool,
}

pub(crate) fn parse(endpoint: &str) -> Result<Endpoint, Error> {
    let (scheme, rest) = endpoint
        .split_once("://")
        .ok_or_else(|| Error::InvalidAddress(format!("missing scheme in {endpoint:?}")))?;

    let proto = match scheme {
        "tcp" => Proto::Tcp,
        "tcp4" => Proto::Tcp4,
        "tcp6" => Proto::Tcp6,
        "unix" => Proto::Unix,
        other => {
            return Err(Error::InvalidAddress(format!("unknown scheme {other:?}")));
        }
    };

    let (addr, query) = match rest.split_once('?') {
        Some((a, q)) => (a, q),
        None => (rest, ""),
    };

    let mut reuse_port = false;
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key == "reuseport" {
            reuse_port = truthy(value);
        }
    }

    if proto == Proto::Unix && addr.is_empty() {
        return Err(Error::InvalidAddress("empty unix socket path".to_string()));
    }

    Ok(Endpoint {
        proto,
        addr: addr.to_string(),
        reuse_port,
    })
}

fn truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
