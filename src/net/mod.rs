// src/net/mod.rs - Host socket transports with embedded-stack semantics
//!
//! Both transports sit on the host's own TCP/IP stack and only translate its
//! blocking behaviour: every call is bounded by an explicit millisecond
//! timeout (zero means "whatever is available right now"), short results are
//! normal, and "nothing yet", "peer closed" and "hard error" stay distinct.

pub mod buffer;
pub mod datagram;
pub mod dispatch;
pub mod poll;
pub mod stream;

pub use buffer::ConnBuffer;
pub use datagram::{AddressFamily, DatagramContext};
pub use dispatch::DatagramDispatcher;
pub use stream::{StreamListener, StreamTransport};

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    /// Nothing available right now; retry later.
    #[error("operation would block")]
    WouldBlock,
    /// Orderly shutdown by the remote end, all buffered data consumed.
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("datagram has {available} bytes left, {requested} requested")]
    NoMoreData { requested: usize, available: usize },
    #[error("timed out after {0} ms")]
    Timeout(u32),
    /// OS-level socket error; the connection must be torn down.
    #[error("{op} failed: {source}")]
    Fatal {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("buffer overflow: {requested} bytes needed, capacity is {capacity}")]
    Overflow { capacity: usize, requested: usize },
    #[error("position {pos} is past the end of a {len}-byte datagram")]
    OutOfRange { pos: usize, len: usize },
    #[error("no destination for datagram")]
    NoDestination,
    #[error("datagram sent partially ({sent} of {len} bytes)")]
    ShortSend { sent: usize, len: usize },
    #[error("could not resolve {0}")]
    Resolve(String),
}

impl TransportError {
    pub(crate) fn fatal(op: &'static str, source: io::Error) -> Self {
        TransportError::Fatal { op, source }
    }

    /// Whether the transport that produced this error must be torn down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Fatal { .. })
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Resolve `host:port` to every candidate address.
pub fn resolve(host: &str, port: u16) -> TransportResult<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|_| TransportError::Resolve(format!("{host}:{port}")))?
        .collect();
    if addrs.is_empty() {
        return Err(TransportError::Resolve(format!("{host}:{port}")));
    }
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_os_errors_are_fatal() {
        let fatal = TransportError::fatal("read", io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(fatal.is_fatal());
        assert!(!TransportError::PeerClosed.is_fatal());
        assert!(!TransportError::WouldBlock.is_fatal());
        assert!(!TransportError::Timeout(10).is_fatal());
    }

    #[test]
    fn resolves_numeric_loopback() {
        let addrs = resolve("127.0.0.1", 9000).unwrap();
        assert_eq!(addrs[0], "127.0.0.1:9000".parse::<SocketAddr>().unwrap());
    }
}
