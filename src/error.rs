use std::fmt;
use std::io;

/// Errors returned by the framework.
#[derive(Debug)]
pub enum Error {
    /// Socket setup, readiness facility, or I/O syscall failed.
    Io(io::Error),
    /// The endpoint string could not be parsed into a listenable address.
    InvalidAddress(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::InvalidAddress(msg) => write!(f, "invalid address: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
