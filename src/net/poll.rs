// src/net/poll.rs - Bounded readiness waits on a single descriptor
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

impl Interest {
    fn events(self) -> libc::c_short {
        match self {
            Interest::Readable => libc::POLLIN,
            Interest::Writable => libc::POLLOUT,
        }
    }
}

/// Wait up to `timeout` for `fd` to become ready. `Ok(false)` on timeout.
///
/// Error and hang-up conditions count as ready so the following read or
/// write reports them. Interrupted waits resume with the time left.
pub fn wait_ready(fd: RawFd, interest: Interest, timeout: Duration) -> io::Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        let mut pfd = libc::pollfd {
            fd,
            events: interest.events(),
            revents: 0,
        };
        let left = deadline.saturating_duration_since(Instant::now());
        let timeout_ms = libc::c_int::try_from(left.as_millis()).unwrap_or(libc::c_int::MAX);
        // SAFETY: `pfd` is a valid pollfd for the duration of the call and nfds is 1.
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        match ret {
            0 => return Ok(false),
            n if n > 0 => return Ok(pfd.revents != 0),
            _ => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
        }
    }
}

pub fn wait_readable<S: AsRawFd>(socket: &S, timeout: Duration) -> io::Result<bool> {
    wait_ready(socket.as_raw_fd(), Interest::Readable, timeout)
}

pub fn wait_writable<S: AsRawFd>(socket: &S, timeout: Duration) -> io::Result<bool> {
    wait_ready(socket.as_raw_fd(), Interest::Writable, timeout)
}

/// Would-block or interrupted: retry later, nothing is wrong with the socket.
pub(crate) fn is_transient(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

/// Remaining time until `deadline`, zero once it has passed.
pub(crate) fn time_left(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

pub(crate) fn deadline_after_ms(timeout_ms: u32) -> Instant {
    Instant::now() + Duration::from_millis(u64::from(timeout_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;

    #[test]
    fn idle_socket_times_out_unreadable() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        assert!(!wait_readable(&socket, Duration::from_millis(5)).unwrap());
    }

    #[test]
    fn fresh_udp_socket_is_writable() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        assert!(wait_writable(&socket, Duration::ZERO).unwrap());
    }

    #[test]
    fn pending_datagram_makes_socket_readable() {
        let rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
        tx.send_to(b"x", rx.local_addr().unwrap()).unwrap();
        assert!(wait_readable(&rx, Duration::from_secs(1)).unwrap());
    }
}
