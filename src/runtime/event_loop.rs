//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! One thread drives everything. Each `turn` waits for readiness (`Idle`),
//! then dispatches the ready sockets (`Dispatching`): the listener drains its
//! accept queue, connections read, frame and hand lines to their handler
//! contexts, and queued output is flushed. Connection failures close only the
//! connection they happened on; only a failing poll ends the loop.
//!
//! Handlers run synchronously, so a slow handler delays every other
//! connection. Reads are capped per readiness event; a connection that still
//! has data after its share is carried over to the next turn.

use crate::config::{Config, OverflowPolicy};
use crate::runtime::buffer::{BufferPool, ReadBuf};
use crate::runtime::connection::{ConnState, Connection, ConnectionId, ConnectionRegistry, Visit};
use crate::runtime::framer::Frame;
use crate::runtime::handler::{
    contain, Flow, HandlerContext, HandlerError, HandlerFactory, Outbound,
};
use crate::runtime::listener::{AcceptFailure, Listener};
use crate::runtime::ServerError;
use bytes::BytesMut;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Longest the loop sleeps between idle sweeps.
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Tunables the loop reads from [`Config`].
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_connections: usize,
    pub max_line_size: usize,
    pub read_buffer_size: usize,
    pub overflow_policy: OverflowPolicy,
    pub max_pending_write: usize,
    pub reads_per_event: usize,
    pub idle_timeout: Option<Duration>,
    pub events_capacity: usize,
}

impl From<&Config> for LoopSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_connections: config.max_connections,
            max_line_size: config.max_line_size,
            read_buffer_size: config.read_buffer_size,
            overflow_policy: config.overflow_policy,
            max_pending_write: config.max_pending_write,
            reads_per_event: config.reads_per_event,
            idle_timeout: config.idle_timeout,
            events_capacity: 1024,
        }
    }
}

/// Why a connection was closed.
#[derive(Debug, Error)]
pub enum CloseReason {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("handler requested close")]
    HandlerClosed,
    #[error("line exceeded {limit} bytes")]
    Overflow { limit: usize },
    #[error("idle for more than {0:?}")]
    Idle(Duration),
    #[error(transparent)]
    Handler(#[from] HandlerError),
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of servicing a readable connection.
enum ReadOutcome {
    /// The socket has no more data for now.
    Drained,
    /// Stopped early; more data may be waiting.
    Yielded,
    /// The handler asked to close.
    Closing,
}

/// Readiness captured from one poll, detached from `Events` so the loop can
/// borrow itself mutably while dispatching.
#[derive(Debug, Clone, Copy)]
struct Ready {
    token: Token,
    readable: bool,
    writable: bool,
}

/// Single-threaded readiness loop over one listener and its connections.
pub struct EventLoop<F: HandlerFactory> {
    poll: Poll,
    events: Events,
    ready: Vec<Ready>,
    listener: Listener,
    factory: F,
    connections: ConnectionRegistry<Connection<F::Context>>,
    buffers: BufferPool,
    /// Connections that stopped reading before `WouldBlock`.
    carry_over: Vec<ConnectionId>,
    settings: LoopSettings,
}

impl<F: HandlerFactory> EventLoop<F> {
    pub fn new(mut listener: Listener, factory: F, settings: LoopSettings) -> io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry()
            .register(listener.source(), LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(settings.events_capacity),
            ready: Vec::with_capacity(settings.events_capacity),
            listener,
            factory,
            connections: ConnectionRegistry::new(settings.max_connections),
            buffers: BufferPool::new(1, settings.read_buffer_size),
            carry_over: Vec::new(),
            settings,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Run until a fatal error.
    pub fn run(&mut self) -> Result<(), ServerError> {
        info!(
            addr = %self.local_addr()?,
            max_connections = self.connections.capacity(),
            max_line_size = self.settings.max_line_size,
            overflow_policy = ?self.settings.overflow_policy,
            "Event loop started"
        );

        loop {
            self.turn(None)?;
        }
    }

    /// Wait for readiness at most `max_wait` (forever if `None`) and
    /// dispatch whatever became ready.
    pub fn turn(&mut self, max_wait: Option<Duration>) -> Result<(), ServerError> {
        let timeout = self.poll_timeout(max_wait);
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(ServerError::Poll(e)),
        }

        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();
        ready.extend(self.events.iter().map(|event| Ready {
            token: event.token(),
            readable: event.is_readable() || event.is_read_closed() || event.is_error(),
            writable: event.is_writable() || event.is_write_closed(),
        }));

        for id in std::mem::take(&mut self.carry_over) {
            self.on_readable(id);
        }

        for event in &ready {
            match event.token {
                LISTENER_TOKEN => self.accept_connections(),
                token => {
                    let id = ConnectionId::from_token(token);
                    if event.readable {
                        self.on_readable(id);
                    }
                    if event.writable {
                        self.on_writable(id);
                    }
                }
            }
        }
        self.ready = ready;

        if let Some(limit) = self.settings.idle_timeout {
            self.evict_idle(limit);
        }
        Ok(())
    }

    fn poll_timeout(&self, max_wait: Option<Duration>) -> Option<Duration> {
        if !self.carry_over.is_empty() {
            return Some(Duration::ZERO);
        }
        let sweep = self
            .settings
            .idle_timeout
            .map(|limit| limit.min(IDLE_SWEEP_INTERVAL));
        match (max_wait, sweep) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Drain the accept queue. Readiness is edge-triggered, so anything left
    /// queued here waits until the next incoming connection re-arms the
    /// listener.
    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok(Some((stream, peer))) => self.open_connection(stream, peer),
                Ok(None) => break,
                Err(e) => match AcceptFailure::classify(&e) {
                    AcceptFailure::Connection => {
                        warn!(error = %e, "Accept failed, skipping connection");
                    }
                    AcceptFailure::Exhausted => {
                        warn!(error = %e, "Accept failed, out of resources");
                        break;
                    }
                    AcceptFailure::Listener => {
                        error!(error = %e, "Accept failed");
                        break;
                    }
                },
            }
        }
    }

    fn open_connection(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        let id = ConnectionId::of(&stream);

        if self.connections.contains(id) {
            error!(
                conn = %id,
                peer = %peer,
                "Descriptor reused before its connection was removed"
            );
            return;
        }
        if self.connections.is_full() {
            warn!(peer = %peer, limit = self.connections.capacity(), "Connection limit reached");
            return;
        }

        let mut outbound = BytesMut::new();
        let created = {
            let limit = self.settings.max_pending_write;
            let mut out = Outbound::new(&mut stream, &mut outbound, limit);
            contain(HandlerError::Init, || {
                self.factory.create_context(id, &mut out)
            })
        };
        let context = match created {
            Ok(context) => context,
            Err(e) => {
                warn!(conn = %id, peer = %peer, error = %e, "Handler initialization failed");
                return;
            }
        };

        let max_line_size = self.settings.max_line_size;
        let mut conn = Connection::new(stream, peer, context, outbound, max_line_size);
        let interest = conn.registered;
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut conn.stream, id.token(), interest)
        {
            warn!(conn = %id, peer = %peer, error = %e, "Failed to register connection");
            return;
        }

        match self.connections.add(id, conn) {
            Ok(()) => debug!(conn = %id, peer = %peer, "Accepted connection"),
            Err(e) => error!(conn = %id, peer = %peer, error = %e, "Failed to track connection"),
        }
    }

    fn on_readable(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };
        if conn.state == ConnState::Closing {
            return;
        }

        let mut buf = self.buffers.alloc();
        let outcome = read_connection(conn, &mut buf, &self.settings);
        self.buffers.free(buf);

        match outcome {
            Ok(ReadOutcome::Drained) => self.refresh_interest(id),
            Ok(ReadOutcome::Yielded) => {
                if !self.carry_over.contains(&id) {
                    self.carry_over.push(id);
                }
                self.refresh_interest(id);
            }
            Ok(ReadOutcome::Closing) => self.on_writable(id),
            Err(reason) => self.close_connection(id, reason),
        }
    }

    fn on_writable(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };

        match conn.flush() {
            Ok(true) if conn.state == ConnState::Closing => {
                self.close_connection(id, CloseReason::HandlerClosed)
            }
            Ok(_) => self.refresh_interest(id),
            Err(e) => self.close_connection(id, CloseReason::Io(e)),
        }
    }

    /// Re-register the connection if its output queue changed what it waits for.
    fn refresh_interest(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };

        conn.sync_state();
        let wanted = conn.interest();
        if wanted == conn.registered {
            return;
        }

        trace!(conn = %id, state = ?conn.state, "Updating interest");
        match self
            .poll
            .registry()
            .reregister(&mut conn.stream, id.token(), wanted)
        {
            Ok(()) => conn.registered = wanted,
            Err(e) => self.close_connection(id, CloseReason::Io(e)),
        }
    }

    /// Deregister and remove one connection, dropping its handler context.
    /// Idle eviction removes in bulk through `ConnectionRegistry::for_each`.
    fn close_connection(&mut self, id: ConnectionId, reason: CloseReason) {
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };

        let peer = conn.peer;
        let discarded = conn.framer.buffered();
        if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
            trace!(conn = %id, error = %e, "Deregister failed");
        }
        self.connections.remove(id);
        self.carry_over.retain(|other| *other != id);

        match reason {
            CloseReason::PeerClosed | CloseReason::HandlerClosed => {
                debug!(conn = %id, peer = %peer, reason = %reason, discarded, "Connection closed")
            }
            _ => warn!(conn = %id, peer = %peer, reason = %reason, discarded, "Connection closed"),
        }
    }

    fn evict_idle(&mut self, limit: Duration) {
        if self.connections.is_empty() {
            return;
        }
        let now = Instant::now();
        let poll = &self.poll;
        let mut evicted = Vec::new();

        self.connections.for_each(|id, conn| {
            if now.duration_since(conn.last_active) < limit {
                return Visit::Keep;
            }
            if let Err(e) = poll.registry().deregister(&mut conn.stream) {
                trace!(conn = %id, error = %e, "Deregister failed");
            }
            info!(
                conn = %id,
                peer = %conn.peer,
                reason = %CloseReason::Idle(limit),
                "Evicting idle connection"
            );
            evicted.push(id);
            Visit::Remove
        });

        if !evicted.is_empty() {
            self.carry_over.retain(|id| !evicted.contains(id));
        }
    }
}

/// Read until the socket runs dry, the per-event budget is spent, or the
/// connection has to go. Every complete line reaches the handler in order.
fn read_connection<C: HandlerContext>(
    conn: &mut Connection<C>,
    buf: &mut ReadBuf,
    settings: &LoopSettings,
) -> Result<ReadOutcome, CloseReason> {
    let mut reads = 0;

    while reads < settings.reads_per_event {
        let n = match conn.stream.read(buf) {
            Ok(0) => return Err(CloseReason::PeerClosed),
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadOutcome::Drained),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CloseReason::Io(e)),
        };
        reads += 1;
        conn.last_active = Instant::now();

        let Connection {
            stream,
            framer,
            outbound,
            context,
            state,
            ..
        } = &mut *conn;
        let mut out = Outbound::new(stream, outbound, settings.max_pending_write);
        let mut overflowed = false;

        for frame in framer.feed(&buf[..n]) {
            let flow = match frame {
                Frame::Line(line) => contain(HandlerError::Execution, || {
                    context.on_line(&line, &mut out)
                })?,
                Frame::Overflow(fragment) => {
                    let limit = settings.max_line_size;
                    if settings.overflow_policy == OverflowPolicy::Close {
                        return Err(CloseReason::Overflow { limit });
                    }
                    warn!(limit, "Line exceeded maximum size, delivering fragment");
                    overflowed = true;
                    contain(HandlerError::Execution, || {
                        context.on_fragment(&fragment, &mut out)
                    })?
                }
            };
            if flow == Flow::Close {
                *state = ConnState::Closing;
                return Ok(ReadOutcome::Closing);
            }
        }

        // No further unterminated bytes this turn once the limit was hit.
        if overflowed {
            return Ok(ReadOutcome::Yielded);
        }
    }

    Ok(ReadOutcome::Yielded)
}
