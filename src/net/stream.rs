// src/net/stream.rs - Buffered, timeout-bounded TCP transport
use crate::config::StreamConfig;
use crate::net::buffer::ConnBuffer;
use crate::net::poll::{
    deadline_after_ms, is_transient, time_left, wait_readable, wait_writable,
};
use crate::net::{TransportError, TransportResult, resolve};
use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

/// One connected stream socket plus its inbound buffer.
///
/// The buffer is owned exclusively by this instance and is only touched
/// while servicing one of its calls.
pub struct StreamTransport {
    socket: TcpStream,
    inbound: ConnBuffer,
    peer: SocketAddr,
    peer_closed: bool,
}

// Linux and the BSDs get MSG_NOSIGNAL on every send from std; Apple
// platforms lack it and need the socket option instead.
#[cfg(any(target_os = "macos", target_os = "ios"))]
fn suppress_sigpipe(socket: SockRef<'_>) -> TransportResult<()> {
    socket
        .set_nosigpipe(true)
        .map_err(|e| TransportError::fatal("setsockopt(SO_NOSIGPIPE)", e))
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
fn suppress_sigpipe(_socket: SockRef<'_>) -> TransportResult<()> {
    Ok(())
}

impl StreamTransport {
    /// Connect to `host:port`, trying each resolved address in turn.
    pub fn connect(host: &str, port: u16, config: &StreamConfig) -> TransportResult<Self> {
        let mut last_err = None;
        for addr in resolve(host, port)? {
            match Self::connect_addr(addr, config) {
                Ok(transport) => return Ok(transport),
                Err(e) => {
                    tracing::debug!("connect to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| TransportError::Resolve(format!("{host}:{port}"))))
    }

    pub fn connect_addr(addr: SocketAddr, config: &StreamConfig) -> TransportResult<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| TransportError::fatal("socket", e))?;
        suppress_sigpipe(SockRef::from(&socket))?;

        let target = SockAddr::from(addr);
        let connected = if config.connect_timeout_ms == 0 {
            socket.connect(&target)
        } else {
            socket.connect_timeout(
                &target,
                Duration::from_millis(u64::from(config.connect_timeout_ms)),
            )
        };
        connected.map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                TransportError::Timeout(config.connect_timeout_ms)
            }
            _ => TransportError::fatal("connect", e),
        })?;

        tracing::debug!("connected to {}", addr);
        Self::from_stream(socket.into(), config)
    }

    /// Adopt an already-connected socket (e.g. from [`StreamListener::accept`]).
    pub fn from_stream(socket: TcpStream, config: &StreamConfig) -> TransportResult<Self> {
        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::fatal("set_nonblocking", e))?;
        if config.nodelay {
            socket
                .set_nodelay(true)
                .map_err(|e| TransportError::fatal("setsockopt(TCP_NODELAY)", e))?;
        }
        suppress_sigpipe(SockRef::from(&socket))?;
        let peer = socket
            .peer_addr()
            .map_err(|e| TransportError::fatal("getpeername", e))?;
        Ok(Self {
            socket,
            inbound: ConnBuffer::with_capacity(config.buffer_capacity),
            peer,
            peer_closed: false,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| TransportError::fatal("getsockname", e))
    }

    pub fn capacity(&self) -> usize {
        self.inbound.capacity()
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        self.inbound.filled()
    }

    pub fn is_peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// One non-blocking read into the tail of the buffer.
    ///
    /// `Ok(n)` with `n > 0` appended bytes; `Ok(0)` means would-block or a
    /// full buffer; `PeerClosed` once the remote end shut down. A zero-length
    /// read with spare room is always treated as the peer closing.
    pub fn fill(&mut self) -> TransportResult<usize> {
        if self.peer_closed {
            return Err(TransportError::PeerClosed);
        }
        if self.inbound.is_full() {
            return Ok(0);
        }
        match (&self.socket).read(self.inbound.spare_mut()) {
            Ok(0) => {
                tracing::debug!("{}: peer closed", self.peer);
                self.peer_closed = true;
                Err(TransportError::PeerClosed)
            }
            Ok(n) => {
                self.inbound.advance(n);
                tracing::trace!(
                    "{}: filled {} bytes ({} buffered)",
                    self.peer,
                    n,
                    self.inbound.len()
                );
                Ok(n)
            }
            Err(e) if is_transient(&e) => {
                Ok(0)
            }
            Err(e) => {
                tracing::error!("{}: read error: {}", self.peer, e);
                Err(TransportError::fatal("read", e))
            }
        }
    }

    /// Wait until `wanted` bytes are buffered, without consuming any.
    ///
    /// `wanted == 0` performs a single fill and reports how much is buffered.
    /// Otherwise the result is `wanted`, or fewer when the timeout elapsed or
    /// the peer closed first. Requests larger than the buffer are clamped to
    /// its capacity.
    pub fn peek(&mut self, wanted: usize, timeout_ms: u32) -> TransportResult<usize> {
        self.peek_until(wanted, deadline_after_ms(timeout_ms))
    }

    fn peek_until(&mut self, wanted: usize, deadline: Instant) -> TransportResult<usize> {
        if wanted == 0 {
            return match self.fill() {
                Ok(_) => Ok(self.inbound.len()),
                Err(TransportError::PeerClosed) => self.closed_result(),
                Err(e) => Err(e),
            };
        }

        let wanted = if wanted > self.inbound.capacity() {
            tracing::debug!(
                "{}: peek of {} bytes exceeds buffer capacity {}",
                self.peer,
                wanted,
                self.inbound.capacity()
            );
            self.inbound.capacity()
        } else {
            wanted
        };

        loop {
            if self.inbound.len() >= wanted {
                return Ok(wanted);
            }
            match self.fill() {
                Ok(_) => {}
                Err(TransportError::PeerClosed) => return self.closed_result(),
                Err(e) => return Err(e),
            }
            if self.inbound.len() >= wanted {
                return Ok(wanted);
            }
            let left = time_left(deadline);
            if left.is_zero() {
                return Ok(self.inbound.len());
            }
            let ready = wait_readable(&self.socket, left)
                .map_err(|e| TransportError::fatal("poll", e))?;
            if !ready {
                return Ok(self.inbound.len());
            }
        }
    }

    fn closed_result(&self) -> TransportResult<usize> {
        if self.inbound.is_empty() {
            Err(TransportError::PeerClosed)
        } else {
            Ok(self.inbound.len())
        }
    }

    /// Copy up to `dst.len()` buffered bytes into `dst` without consuming them.
    pub fn peek_bytes(&mut self, dst: &mut [u8], timeout_ms: u32) -> TransportResult<usize> {
        let n = self.peek(dst.len(), timeout_ms)?;
        let len = n.min(dst.len());
        Ok(self.inbound.peek_into(&mut dst[..len]))
    }

    /// Bytes available without waiting.
    pub fn available(&mut self) -> TransportResult<usize> {
        self.peek(0, 0)
    }

    /// Read up to `dst.len()` bytes within `timeout_ms`.
    ///
    /// Larger reads than the buffer holds go through several fill and compact
    /// cycles under the same deadline. A short count means the timeout
    /// elapsed or the peer closed after sending what was returned.
    pub fn read(&mut self, dst: &mut [u8], timeout_ms: u32) -> TransportResult<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        let deadline = deadline_after_ms(timeout_ms);
        let mut copied = 0;
        while copied < dst.len() {
            let want = (dst.len() - copied).min(self.inbound.capacity());
            let got = match self.peek_until(want, deadline) {
                Ok(n) => n.min(want),
                Err(TransportError::PeerClosed) if copied > 0 => break,
                Err(e) => return Err(e),
            };
            self.inbound.peek_into(&mut dst[copied..copied + got]);
            self.inbound.consume(got);
            copied += got;
            if got < want {
                break;
            }
        }
        tracing::trace!("{}: read {} of {} bytes", self.peer, copied, dst.len());
        Ok(copied)
    }

    /// Send all of `data`, waiting for writability at most `timeout_ms` overall.
    ///
    /// Returns how many bytes actually went out; fewer than `data.len()`
    /// means the timeout elapsed first.
    pub fn write(&mut self, data: &[u8], timeout_ms: u32) -> TransportResult<usize> {
        let deadline = deadline_after_ms(timeout_ms);
        let mut sent = 0;
        while sent < data.len() {
            let ready = wait_writable(&self.socket, time_left(deadline))
                .map_err(|e| TransportError::fatal("poll", e))?;
            if !ready {
                break;
            }
            match (&self.socket).write(&data[sent..]) {
                Ok(0) => {
                    return Err(TransportError::fatal(
                        "send",
                        io::Error::from(io::ErrorKind::WriteZero),
                    ));
                }
                Ok(n) => {
                    sent += n;
                    if sent < data.len() {
                        tracing::trace!(
                            "{}: sent {} bytes ({} / {})",
                            self.peer,
                            n,
                            sent,
                            data.len()
                        );
                    }
                }
                Err(e) if is_transient(&e) => {
                    if time_left(deadline).is_zero() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("{}: write error: {}", self.peer, e);
                    return Err(TransportError::fatal("send", e));
                }
            }
        }
        if sent < data.len() {
            tracing::warn!(
                "{}: write timed out after {} ms, {} of {} bytes sent",
                self.peer,
                timeout_ms,
                sent,
                data.len()
            );
        }
        Ok(sent)
    }

    /// Close the write half; buffered inbound data stays readable.
    pub fn shutdown(&mut self) -> TransportResult<()> {
        match self.socket.shutdown(Shutdown::Write) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(TransportError::fatal("shutdown", e)),
        }
    }
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("peer", &self.peer)
            .field("inbound", &self.inbound)
            .field("peer_closed", &self.peer_closed)
            .finish()
    }
}

/// Listening socket handing out [`StreamTransport`]s.
#[derive(Debug)]
pub struct StreamListener {
    listener: TcpListener,
    config: StreamConfig,
}

impl StreamListener {
    pub fn bind(host: &str, port: u16, config: &StreamConfig) -> TransportResult<Self> {
        let addr = resolve(host, port)?[0];
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| TransportError::fatal("socket", e))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| TransportError::fatal("setsockopt(SO_REUSEADDR)", e))?;
        socket
            .bind(&SockAddr::from(addr))
            .map_err(|e| TransportError::fatal("bind", e))?;
        socket
            .listen(128)
            .map_err(|e| TransportError::fatal("listen", e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::fatal("set_nonblocking", e))?;
        tracing::debug!("listening on {}", addr);
        Ok(Self {
            listener: socket.into(),
            config: config.clone(),
        })
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| TransportError::fatal("getsockname", e))
    }

    /// Accept one pending connection, waiting at most `timeout_ms`.
    pub fn accept(&self, timeout_ms: u32) -> TransportResult<Option<StreamTransport>> {
        let deadline = deadline_after_ms(timeout_ms);
        loop {
            match self.listener.accept() {
                Ok((socket, peer)) => {
                    tracing::debug!("accepted connection from {}", peer);
                    return StreamTransport::from_stream(socket, &self.config).map(Some);
                }
                Err(e) if is_transient(&e) => {
                    let left = time_left(deadline);
                    if left.is_zero() {
                        return Ok(None);
                    }
                    let ready = wait_readable(&self.listener, left)
                        .map_err(|e| TransportError::fatal("poll", e))?;
                    if !ready {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(TransportError::fatal("accept", e)),
            }
        }
    }
}
