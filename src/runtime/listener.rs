//! Listening socket.

use mio::net::{TcpListener, TcpStream};
use std::io;
use std::net::SocketAddr;
use tracing::trace;

/// How an `accept` failure bears on the rest of the accept queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptFailure {
    /// The error belongs to one queued connection (it was aborted, or the
    /// network under it went away). The next one may accept fine.
    Connection,
    /// Out of descriptors or memory. Accepting again right now fails too.
    Exhausted,
    /// The listening socket itself is broken.
    Listener,
}

impl AcceptFailure {
    pub fn classify(err: &io::Error) -> Self {
        match err.raw_os_error() {
            Some(
                libc::ECONNABORTED
                | libc::EPROTO
                | libc::EPERM
                | libc::ENETDOWN
                | libc::ENETUNREACH
                | libc::EHOSTDOWN
                | libc::EHOSTUNREACH
                | libc::ENOPROTOOPT
                | libc::EOPNOTSUPP,
            ) => Self::Connection,
            Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM) => Self::Exhausted,
            _ => match err.kind() {
                io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset => {
                    Self::Connection
                }
                _ => Self::Listener,
            },
        }
    }
}

/// The bound, non-blocking server socket.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    /// Bind `addr` and start listening with the given backlog.
    pub fn bind(addr: SocketAddr, backlog: u32) -> io::Result<Self> {
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;

        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

        let listener: std::net::TcpListener = socket.into();
        Ok(Self {
            inner: TcpListener::from_std(listener),
        })
    }

    /// Accept one queued connection.
    ///
    /// Returns `Ok(None)` once the accept queue is empty.
    pub fn accept(&self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        loop {
            match self.inner.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        trace!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    return Ok(Some((stream, peer)));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub(crate) fn source(&mut self) -> &mut TcpListener {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral_port() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), 10).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        // Nothing queued yet
        assert!(listener.accept().unwrap().is_none());
    }

    #[test]
    fn test_accept_queued_connection() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), 10).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();

        let mut accepted = None;
        for _ in 0..100 {
            if let Some(conn) = listener.accept().unwrap() {
                accepted = Some(conn);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        let (_stream, peer) = accepted.expect("connection was not accepted");
        assert_eq!(peer, client.local_addr().unwrap());
    }

    #[test]
    fn test_accept_failure_classification() {
        let classify = |code| AcceptFailure::classify(&io::Error::from_raw_os_error(code));

        assert_eq!(classify(libc::ECONNABORTED), AcceptFailure::Connection);
        assert_eq!(classify(libc::EPROTO), AcceptFailure::Connection);
        assert_eq!(classify(libc::EMFILE), AcceptFailure::Exhausted);
        assert_eq!(classify(libc::ENFILE), AcceptFailure::Exhausted);
        assert_eq!(classify(libc::ENOBUFS), AcceptFailure::Exhausted);
        assert_eq!(classify(libc::EBADF), AcceptFailure::Listener);
        assert_eq!(
            AcceptFailure::classify(&io::ErrorKind::ConnectionAborted.into()),
            AcceptFailure::Connection
        );
    }

    #[test]
    fn test_bind_conflict_fails() {
        let first = Listener::bind("127.0.0.1:0".parse().unwrap(), 10).unwrap();
        let addr = first.local_addr().unwrap();
        assert!(Listener::bind(addr, 10).is_err());
    }
}
