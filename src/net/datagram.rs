// src/net/datagram.rs - One-datagram-at-a-time UDP context with explicit-flush sends
use crate::config::DatagramConfig;
use crate::net::buffer::ConnBuffer;
use crate::net::dispatch::{DatagramDispatcher, ReceiveHandler};
use crate::net::poll::{is_transient, wait_readable};
use crate::net::{TransportError, TransportResult};
use socket2::{Domain, MaybeUninitSlice, Protocol, SockAddr, SockRef, Socket, Type};
use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

// Linux reports the full datagram length alongside the truncation flag.
#[cfg(target_os = "linux")]
const RECV_FLAGS: libc::c_int = libc::MSG_TRUNC;
#[cfg(not(target_os = "linux"))]
const RECV_FLAGS: libc::c_int = 0;

/// Address family of the sender of the held datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    /// Size in bytes of an address of this family.
    pub fn address_size(self) -> usize {
        match self {
            AddressFamily::V4 => 4,
            AddressFamily::V6 => 16,
        }
    }

    fn of(addr: &SocketAddr) -> Self {
        if addr.is_ipv4() {
            AddressFamily::V4
        } else {
            AddressFamily::V6
        }
    }
}

/// State shared by every owner of one [`DatagramContext`].
pub(crate) struct DatagramState {
    socket: Option<UdpSocket>,
    inbound: ConnBuffer,
    read_pos: usize,
    outbound: ConnBuffer,
    remote: Option<SocketAddr>,
    default_dest: Option<SocketAddr>,
    multicast_dest: Option<SocketAddr>,
    multicast_if: Option<Ipv4Addr>,
    ttl: Option<u32>,
    broadcast: bool,
    on_receive: Option<ReceiveHandler>,
    dispatcher: Option<DatagramDispatcher>,
}

impl DatagramState {
    /// The receive handler, if one is set and a datagram is waiting.
    pub(crate) fn readable_handler(&self) -> Option<ReceiveHandler> {
        let handler = self.on_receive.as_ref()?;
        let socket = self.socket.as_ref()?;
        match wait_readable(socket, Duration::ZERO) {
            Ok(true) => Some(handler.clone()),
            Ok(false) => None,
            Err(e) => {
                tracing::error!("poll on datagram socket failed: {}", e);
                None
            }
        }
    }

    fn held(&self) -> &[u8] {
        self.inbound.filled()
    }

    fn remaining(&self) -> usize {
        self.inbound.len().saturating_sub(self.read_pos)
    }

    fn copy_out(&mut self, dst: &mut [u8], advance: bool) -> TransportResult<usize> {
        let available = self.remaining();
        if dst.len() > available {
            return Err(TransportError::NoMoreData {
                requested: dst.len(),
                available,
            });
        }
        let start = self.read_pos;
        dst.copy_from_slice(&self.held()[start..start + dst.len()]);
        if advance {
            self.read_pos += dst.len();
        }
        Ok(dst.len())
    }

    fn apply_options(&self, socket: &UdpSocket) -> TransportResult<()> {
        let is_v4 = socket
            .local_addr()
            .map_err(|e| TransportError::fatal("getsockname", e))?
            .is_ipv4();
        if let Some(ttl) = self.ttl {
            socket
                .set_ttl(ttl)
                .map_err(|e| TransportError::fatal("setsockopt(IP_TTL)", e))?;
            if is_v4 {
                socket
                    .set_multicast_ttl_v4(ttl)
                    .map_err(|e| TransportError::fatal("setsockopt(IP_MULTICAST_TTL)", e))?;
            }
        }
        if is_v4 {
            if let Some(iface) = self.multicast_if {
                SockRef::from(socket)
                    .set_multicast_if_v4(&iface)
                    .map_err(|e| TransportError::fatal("setsockopt(IP_MULTICAST_IF)", e))?;
            }
            socket
                .set_broadcast(self.broadcast)
                .map_err(|e| TransportError::fatal("setsockopt(SO_BROADCAST)", e))?;
        }
        Ok(())
    }

    /// Bind an ephemeral socket if nothing was bound yet.
    fn ensure_socket(&mut self, dest: &SocketAddr) -> TransportResult<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        let any: IpAddr = if dest.is_ipv4() {
            Ipv4Addr::UNSPECIFIED.into()
        } else {
            Ipv6Addr::UNSPECIFIED.into()
        };
        let socket = open_socket(SocketAddr::new(any, 0), false)
            .map_err(|e| TransportError::fatal("bind", e))?;
        self.apply_options(&socket)?;
        self.socket = Some(socket);
        Ok(())
    }

    fn send_outbound(&mut self, dest: Option<SocketAddr>) -> TransportResult<usize> {
        let dest = dest
            .or(self.default_dest)
            .or(self.multicast_dest)
            .ok_or(TransportError::NoDestination)?;
        let len = self.outbound.len();
        self.ensure_socket(&dest)?;
        let Some(socket) = self.socket.as_ref() else {
            return Err(TransportError::NoDestination);
        };
        let sent = match socket.send_to(self.outbound.filled(), dest) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(TransportError::WouldBlock);
            }
            Err(e) => return Err(TransportError::fatal("sendto", e)),
        };
        if sent != len {
            return Err(TransportError::ShortSend { sent, len });
        }
        tracing::trace!("sent {} byte datagram to {}", sent, dest);
        Ok(sent)
    }
}

impl Drop for DatagramState {
    fn drop(&mut self) {
        if let Some(socket) = &self.socket {
            tracing::debug!("datagram context released ({:?})", socket.local_addr().ok());
        }
    }
}

fn open_socket(addr: SocketAddr, reuse: bool) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if reuse {
        socket.set_reuse_address(true)?;
        socket.set_reuse_port(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::from(addr))?;
    Ok(socket.into())
}

/// Reference-counted UDP endpoint.
///
/// Every owner holds its own handle: [`DatagramContext::acquire`] adds one,
/// [`DatagramContext::release`] (or dropping the handle) removes one, and the
/// socket and buffers are freed when the last handle goes.
pub struct DatagramContext {
    inner: Arc<Mutex<DatagramState>>,
}

impl DatagramContext {
    pub fn new(config: &DatagramConfig) -> Self {
        let state = DatagramState {
            socket: None,
            inbound: ConnBuffer::with_capacity(config.buffer_capacity),
            read_pos: 0,
            outbound: ConnBuffer::with_capacity(config.buffer_capacity),
            remote: None,
            default_dest: None,
            multicast_dest: None,
            multicast_if: config.multicast_interface,
            ttl: config.ttl,
            broadcast: false,
            on_receive: None,
            dispatcher: None,
        };
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    /// A context that registers with `dispatcher` when it starts listening.
    pub fn with_dispatcher(config: &DatagramConfig, dispatcher: &DatagramDispatcher) -> Self {
        let ctx = Self::new(config);
        ctx.lock().dispatcher = Some(dispatcher.clone());
        ctx
    }

    fn lock(&self) -> MutexGuard<'_, DatagramState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take another reference.
    pub fn acquire(&self) -> Self {
        let ctx = Self {
            inner: self.inner.clone(),
        };
        tracing::trace!("datagram context acquired ({} refs)", ctx.ref_count());
        ctx
    }

    /// Give up this reference, returning how many remain.
    pub fn release(self) -> usize {
        let remaining = Arc::strong_count(&self.inner) - 1;
        tracing::trace!("datagram context released ({} refs left)", remaining);
        remaining
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Bind to `local:port`, optionally joining an IPv4 multicast group.
    ///
    /// With a group the socket binds the wildcard address so group traffic
    /// is delivered, and `local` selects the interface for the join.
    pub fn listen(&self, local: IpAddr, port: u16, group: Option<Ipv4Addr>) -> TransportResult<()> {
        let bind_ip = match group {
            Some(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            None => local,
        };
        let socket = open_socket(SocketAddr::new(bind_ip, port), true)
            .map_err(|e| TransportError::fatal("bind", e))?;
        let bound = socket
            .local_addr()
            .map_err(|e| TransportError::fatal("getsockname", e))?;

        let mut state = self.lock();
        if let Some(group) = group {
            let iface = match local {
                IpAddr::V4(v4) => v4,
                IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
            };
            socket
                .join_multicast_v4(&group, &iface)
                .map_err(|e| TransportError::fatal("setsockopt(IP_ADD_MEMBERSHIP)", e))?;
            state.multicast_dest = Some(SocketAddr::new(group.into(), bound.port()));
            tracing::debug!("joined multicast group {} on {}", group, iface);
        }
        state.apply_options(&socket)?;
        state.socket = Some(socket);
        state.inbound.clear();
        state.read_pos = 0;
        if let Some(dispatcher) = &state.dispatcher {
            dispatcher.register(Arc::downgrade(&self.inner));
        }
        tracing::debug!("datagram context listening on {}", bound);
        Ok(())
    }

    /// Record the default destination for sends. No packets are exchanged.
    pub fn connect(&self, peer: IpAddr, port: u16) {
        self.lock().default_dest = Some(SocketAddr::new(peer, port));
    }

    pub fn disconnect(&self) {
        self.lock().default_dest = None;
    }

    pub fn default_destination(&self) -> Option<SocketAddr> {
        self.lock().default_dest
    }

    pub fn local_addr(&self) -> TransportResult<Option<SocketAddr>> {
        match &self.lock().socket {
            Some(socket) => socket
                .local_addr()
                .map(Some)
                .map_err(|e| TransportError::fatal("getsockname", e)),
            None => Ok(None),
        }
    }

    /// Interface used for outgoing multicast.
    pub fn set_outbound_interface(&self, iface: Ipv4Addr) -> TransportResult<()> {
        let mut state = self.lock();
        state.multicast_if = Some(iface);
        match &state.socket {
            Some(socket) => state.apply_options(socket),
            None => Ok(()),
        }
    }

    pub fn set_ttl(&self, ttl: u32) -> TransportResult<()> {
        let mut state = self.lock();
        state.ttl = Some(ttl);
        match &state.socket {
            Some(socket) => state.apply_options(socket),
            None => Ok(()),
        }
    }

    pub fn set_broadcast(&self, enabled: bool) -> TransportResult<()> {
        let mut state = self.lock();
        state.broadcast = enabled;
        match &state.socket {
            Some(socket) => state.apply_options(socket),
            None => Ok(()),
        }
    }

    /// Handler the dispatcher calls when a datagram is waiting.
    pub fn on_receive<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.lock().on_receive = Some(Arc::new(handler));
    }

    /// Drop the held datagram and pull the next queued one, if any.
    ///
    /// Never blocks. `Ok(true)` means a new datagram is now held. A datagram
    /// larger than the buffer is discarded and reported as `Overflow`.
    pub fn next(&self) -> TransportResult<bool> {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.inbound.clear();
        state.read_pos = 0;
        let Some(socket) = state.socket.as_ref() else {
            return Ok(false);
        };
        let capacity = state.inbound.capacity();
        let spare = state.inbound.spare_mut();
        // SAFETY: initialized bytes are valid `MaybeUninit<u8>`, and the kernel
        // only ever writes initialized bytes into the slice.
        let spare = unsafe { &mut *(spare as *mut [u8] as *mut [MaybeUninit<u8>]) };
        let mut bufs = [MaybeUninitSlice::new(spare)];
        let received =
            SockRef::from(socket).recv_from_vectored_with_flags(&mut bufs, RECV_FLAGS);
        match received {
            Ok((n, flags, from)) => {
                let from = from.as_socket();
                state.remote = from;
                if flags.is_truncated() {
                    let requested = n.max(capacity + 1);
                    tracing::warn!(
                        "dropped {} byte datagram from {:?}: buffer holds {}",
                        requested,
                        from,
                        capacity
                    );
                    return Err(TransportError::Overflow { capacity, requested });
                }
                state.inbound.advance(n);
                tracing::trace!("received {} byte datagram from {:?}", n, from);
                Ok(true)
            }
            Err(e) if is_transient(&e) => {
                Ok(false)
            }
            Err(e) => {
                tracing::error!("recvfrom failed: {}", e);
                Err(TransportError::fatal("recvfrom", e))
            }
        }
    }

    /// Size of the held datagram.
    pub fn len(&self) -> usize {
        self.lock().inbound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().inbound.is_empty()
    }

    /// Unread bytes left in the held datagram.
    pub fn remaining(&self) -> usize {
        self.lock().remaining()
    }

    pub fn tell(&self) -> usize {
        self.lock().read_pos
    }

    /// Move the read position within the held datagram.
    pub fn seek(&self, pos: usize) -> TransportResult<()> {
        let mut state = self.lock();
        let len = state.inbound.len();
        if pos > len {
            return Err(TransportError::OutOfRange { pos, len });
        }
        state.read_pos = pos;
        Ok(())
    }

    /// Copy exactly `dst.len()` unread bytes without consuming them.
    pub fn peek(&self, dst: &mut [u8]) -> TransportResult<usize> {
        self.lock().copy_out(dst, false)
    }

    /// Copy exactly `dst.len()` unread bytes and advance past them.
    pub fn read(&self, dst: &mut [u8]) -> TransportResult<usize> {
        self.lock().copy_out(dst, true)
    }

    pub fn read_byte(&self) -> TransportResult<u8> {
        let mut byte = [0u8; 1];
        self.read(&mut byte)?;
        Ok(byte[0])
    }

    /// Discard whatever is left of the held datagram.
    pub fn flush(&self) {
        let mut state = self.lock();
        state.inbound.clear();
        state.read_pos = 0;
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.lock().remote
    }

    pub fn remote_port(&self) -> Option<u16> {
        self.lock().remote.map(|addr| addr.port())
    }

    pub fn remote_family(&self) -> Option<AddressFamily> {
        self.lock().remote.as_ref().map(AddressFamily::of)
    }

    /// Add `data` to the outgoing datagram. Overflow is rejected whole.
    pub fn append(&self, data: &[u8]) -> TransportResult<()> {
        let mut state = self.lock();
        state.outbound.append(data).inspect_err(|e| {
            tracing::error!("datagram append rejected: {}", e);
        })
    }

    pub fn outbound_len(&self) -> usize {
        self.lock().outbound.len()
    }

    /// Send the accumulated datagram as one unit.
    ///
    /// Without `dest` it goes to the connected default, then to the joined
    /// multicast group. The outbound buffer is cleared whatever the outcome.
    pub fn send(&self, dest: Option<SocketAddr>) -> TransportResult<usize> {
        let mut state = self.lock();
        let result = state.send_outbound(dest);
        state.outbound.clear();
        if let Err(e) = &result {
            tracing::warn!("datagram send failed: {}", e);
        }
        result
    }
}

impl std::fmt::Debug for DatagramContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("DatagramContext")
            .field("refs", &Arc::strong_count(&self.inner))
            .field("bound", &state.socket.as_ref().and_then(|s| s.local_addr().ok()))
            .field("held", &state.inbound.len())
            .field("outbound", &state.outbound.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(capacity: usize) -> DatagramConfig {
        DatagramConfig {
            buffer_capacity: capacity,
            ..DatagramConfig::default()
        }
    }

    #[test]
    fn next_without_socket_holds_nothing() {
        let ctx = DatagramContext::new(&config(64));
        assert!(!ctx.next().unwrap());
        assert!(ctx.is_empty());
        assert_eq!(ctx.remote_addr(), None);
    }

    #[test]
    fn seek_and_reads_are_bounded_by_the_held_datagram() {
        let ctx = DatagramContext::new(&config(64));
        {
            let mut state = ctx.lock();
            state.inbound.append(b"hello").unwrap();
        }
        let mut two = [0u8; 2];
        assert_eq!(ctx.read(&mut two).unwrap(), 2);
        assert_eq!(&two, b"he");
        assert_eq!(ctx.tell(), 2);
        assert!(ctx.seek(5).is_ok());
        assert!(matches!(ctx.seek(6), Err(TransportError::OutOfRange { pos: 6, len: 5 })));
        assert!(matches!(
            ctx.read_byte(),
            Err(TransportError::NoMoreData { requested: 1, available: 0 })
        ));
        ctx.seek(1).unwrap();
        assert_eq!(ctx.read_byte().unwrap(), b'e');
    }

    #[test]
    fn family_sizes() {
        assert_eq!(AddressFamily::V4.address_size(), 4);
        assert_eq!(AddressFamily::V6.address_size(), 16);
    }
}
