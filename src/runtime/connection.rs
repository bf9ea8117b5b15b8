//! Connection state and the registry of live connections.
//!
//! A connection is identified by its socket descriptor. Descriptors are
//! recycled by the OS after close, so an identity is only meaningful between
//! accept and removal; the registry refuses to hold two entries for the same
//! descriptor.

use crate::runtime::framer::LineFramer;
use crate::runtime::handler::HandlerContext;
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Token};
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Instant;
use thiserror::Error;

/// Socket identity of a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(RawFd);

impl ConnectionId {
    pub fn of(socket: &impl AsRawFd) -> Self {
        Self(socket.as_raw_fd())
    }

    #[cfg(test)]
    pub fn from_raw(fd: RawFd) -> Self {
        Self(fd)
    }

    /// Poll token for this connection. Descriptors are non-negative, so the
    /// token never collides with the listener's `Token(usize::MAX)`.
    pub fn token(self) -> Token {
        Token(self.0 as usize)
    }

    pub fn from_token(token: Token) -> Self {
        Self(token.0 as RawFd)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd:{}", self.0)
    }
}

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Reading lines; nothing queued for the peer.
    Reading,
    /// Reading lines while queued output waits for writable readiness.
    Flushing,
    /// The handler asked to close. No more reads; queued output drains first.
    Closing,
}

/// A single client connection.
pub struct Connection<C: HandlerContext> {
    pub(crate) stream: TcpStream,
    pub(crate) peer: SocketAddr,
    pub(crate) framer: LineFramer,
    /// Output the socket has not accepted yet.
    pub(crate) outbound: BytesMut,
    pub(crate) context: C,
    pub(crate) state: ConnState,
    /// Interest currently registered with the poller.
    pub(crate) registered: Interest,
    pub(crate) last_active: Instant,
}

impl<C: HandlerContext> Connection<C> {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        context: C,
        outbound: BytesMut,
        max_line_size: usize,
    ) -> Self {
        let mut conn = Self {
            stream,
            peer,
            framer: LineFramer::new(max_line_size),
            outbound,
            context,
            state: ConnState::Reading,
            registered: Interest::READABLE,
            last_active: Instant::now(),
        };
        conn.sync_state();
        conn.registered = conn.interest();
        conn
    }

    /// Move between `Reading` and `Flushing` to match the output queue.
    pub fn sync_state(&mut self) {
        self.state = match (self.state, self.outbound.is_empty()) {
            (ConnState::Closing, _) => ConnState::Closing,
            (_, true) => ConnState::Reading,
            (_, false) => ConnState::Flushing,
        };
    }

    /// Readiness this connection currently needs.
    pub fn interest(&self) -> Interest {
        match self.state {
            ConnState::Reading => Interest::READABLE,
            ConnState::Flushing => Interest::READABLE | Interest::WRITABLE,
            ConnState::Closing => Interest::WRITABLE,
        }
    }

    /// Write queued output until the socket stops accepting it. A peer that
    /// is still taking bytes counts as active.
    ///
    /// Returns `true` once the queue is empty.
    pub fn flush(&mut self) -> io::Result<bool> {
        let queued = self.outbound.len();
        let drained = flush_into(&mut self.stream, &mut self.outbound)?;
        if self.outbound.len() < queued {
            self.last_active = Instant::now();
        }
        Ok(drained)
    }
}

impl<C: HandlerContext> Drop for Connection<C> {
    fn drop(&mut self) {
        self.context.on_destroy();
    }
}

fn flush_into(sink: &mut impl Write, outbound: &mut BytesMut) -> io::Result<bool> {
    while !outbound.is_empty() {
        match sink.write(&outbound[..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => outbound.advance(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Registry errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The identity is still registered: a descriptor was reused before its
    /// previous connection was removed.
    #[error("connection {0} is already registered")]
    AlreadyExists(ConnectionId),
    #[error("connection limit of {0} reached")]
    Full(usize),
}

/// Whether `for_each` keeps or removes the visited entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Keep,
    Remove,
}

/// Registry of live connections keyed by socket identity.
///
/// Provides O(1) insert, lookup, and remove operations. Removing an entry
/// drops it, which for a [`Connection`] destroys its handler context.
pub struct ConnectionRegistry<T> {
    entries: HashMap<ConnectionId, T>,
    max_connections: usize,
}

impl<T> ConnectionRegistry<T> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Insert a new entry. An existing entry for `id` is never replaced; on
    /// error `entry` is dropped.
    pub fn add(&mut self, id: ConnectionId, entry: T) -> Result<(), RegistryError> {
        if self.entries.contains_key(&id) {
            return Err(RegistryError::AlreadyExists(id));
        }
        if self.is_full() {
            return Err(RegistryError::Full(self.max_connections));
        }
        self.entries.insert(id, entry);
        Ok(())
    }

    /// Remove and drop the entry for `id`. Returns whether it was present.
    pub fn remove(&mut self, id: ConnectionId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Get a mutable reference to an entry.
    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut T> {
        self.entries.get_mut(&id)
    }

    /// Check if an entry exists.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max_connections
    }

    /// Maximum number of entries allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Visit every entry once. The visitor may ask for the entry it is
    /// looking at to be removed; it is dropped before the next one is visited.
    pub fn for_each<F>(&mut self, mut visitor: F)
    where
        F: FnMut(ConnectionId, &mut T) -> Visit,
    {
        self.entries
            .retain(|id, entry| visitor(*id, entry) == Visit::Keep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Records its own destruction.
    struct Tracked {
        name: &'static str,
        dropped: Rc<RefCell<Vec<&'static str>>>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.dropped.borrow_mut().push(self.name);
        }
    }

    fn tracked(name: &'static str, log: &Rc<RefCell<Vec<&'static str>>>) -> Tracked {
        Tracked {
            name,
            dropped: Rc::clone(log),
        }
    }

    fn id(fd: RawFd) -> ConnectionId {
        ConnectionId::from_raw(fd)
    }

    #[test]
    fn test_add_rejects_existing_identity() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut registry = ConnectionRegistry::new(8);

        registry.add(id(7), tracked("first", &log)).unwrap();
        assert_eq!(
            registry.add(id(7), tracked("second", &log)),
            Err(RegistryError::AlreadyExists(id(7)))
        );

        // The rejected entry is dropped; the original stays.
        assert_eq!(*log.borrow(), vec!["second"]);
        assert_eq!(registry.get_mut(id(7)).unwrap().name, "first");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_capacity_limit() {
        let mut registry = ConnectionRegistry::new(2);

        registry.add(id(10), "a").unwrap();
        registry.add(id(11), "b").unwrap();
        assert!(registry.is_full());
        assert_eq!(registry.add(id(12), "c"), Err(RegistryError::Full(2)));

        assert!(registry.remove(id(10)));
        assert!(!registry.contains(id(10)));
        registry.add(id(12), "c").unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.capacity(), 2);
    }

    #[test]
    fn test_remove_destroys_exactly_once() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut registry = ConnectionRegistry::new(8);

        registry.add(id(3), tracked("conn", &log)).unwrap();
        assert!(registry.remove(id(3)));
        assert_eq!(*log.borrow(), vec!["conn"]);

        assert!(!registry.remove(id(3)));
        assert_eq!(log.borrow().len(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_descriptor_reuse_after_removal() {
        let mut registry = ConnectionRegistry::new(8);

        registry.add(id(5), 1).unwrap();
        assert!(registry.remove(id(5)));
        registry.add(id(5), 2).unwrap();
        assert_eq!(registry.get_mut(id(5)), Some(&mut 2));
    }

    #[test]
    fn test_for_each_removal_visits_everything_once() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut registry = ConnectionRegistry::new(16);
        let names = ["a", "b", "c", "d", "e", "f"];
        for (fd, name) in names.iter().enumerate() {
            registry.add(id(fd as RawFd), tracked(*name, &log)).unwrap();
        }

        let mut visited = Vec::new();
        registry.for_each(|id, entry| {
            visited.push(id);
            if entry.name == "b" || entry.name == "e" {
                Visit::Remove
            } else {
                Visit::Keep
            }
        });

        visited.sort();
        assert_eq!(visited, (0..6).map(id).collect::<Vec<_>>());
        let mut dropped = log.borrow().clone();
        dropped.sort();
        assert_eq!(dropped, vec!["b", "e"]);
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_token_round_trip() {
        let conn = id(42);
        assert_eq!(conn.token(), Token(42));
        assert_eq!(ConnectionId::from_token(conn.token()), conn);
        assert_eq!(conn.to_string(), "fd:42");
    }

    #[test]
    fn test_flush_drains_until_would_block() {
        struct TwoBytes(Vec<u8>, usize);
        impl Write for TwoBytes {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                if self.1 == 0 {
                    return Err(io::ErrorKind::WouldBlock.into());
                }
                self.1 -= 1;
                let n = buf.len().min(2);
                self.0.extend_from_slice(&buf[..n]);
                Ok(n)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut outbound = BytesMut::from(&b"abcdef"[..]);
        let mut sink = TwoBytes(Vec::new(), 2);
        assert!(!flush_into(&mut sink, &mut outbound).unwrap());
        assert_eq!(&outbound[..], b"ef");

        sink.1 = 5;
        assert!(flush_into(&mut sink, &mut outbound).unwrap());
        assert_eq!(sink.0, b"abcdef");
    }
}
