//! Per-connection handler capability.
//!
//! The event loop owns sockets and framing; everything a connection *does*
//! with its lines lives behind these traits. A [`HandlerFactory`] builds one
//! [`HandlerContext`] per accepted connection. The context receives lines
//! synchronously on the loop thread and answers through an [`Outbound`]
//! handle that is only ever lent out for the duration of a callback.
//!
//! Context lifecycle: created by `create_context`, active while lines are
//! delivered, destroyed exactly once when the connection is removed from the
//! registry (`on_destroy`, then drop). A slow handler stalls every other
//! connection; handlers must not block. A callback that panics fails only the
//! connection it was called for.

use crate::runtime::connection::ConnectionId;
use bytes::BytesMut;
use std::any::Any;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;

/// What the event loop should do after a callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading from the connection.
    Continue,
    /// Flush queued output, then close the connection.
    Close,
}

/// Builds a handler context for every accepted connection.
pub trait HandlerFactory {
    type Context: HandlerContext;

    /// Create the context for a freshly accepted connection.
    ///
    /// The context may already write (a greeting, say) through `out`. On
    /// error the connection is closed without ever being registered.
    fn create_context(
        &mut self,
        id: ConnectionId,
        out: &mut Outbound<'_>,
    ) -> Result<Self::Context, HandlerError>;
}

/// Per-connection execution environment.
pub trait HandlerContext {
    /// Called once per complete line, terminator excluded, in stream order.
    fn on_line(&mut self, line: &[u8], out: &mut Outbound<'_>) -> Result<Flow, HandlerError>;

    /// Called with `max_line_size` bytes that arrived without a newline when
    /// the overflow policy is `deliver`.
    fn on_fragment(
        &mut self,
        fragment: &[u8],
        out: &mut Outbound<'_>,
    ) -> Result<Flow, HandlerError> {
        self.on_line(fragment, out)
    }

    /// Release resources. Called exactly once, after the last callback.
    fn on_destroy(&mut self) {}
}

/// Handler failures. Each one closes only the offending connection.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("handler initialization failed: {0}")]
    Init(String),
    #[error("handler failed: {0}")]
    Execution(String),
    #[error(transparent)]
    Send(#[from] SendError),
}

/// Run a handler callback, turning a panic into `failure(message)`.
pub(crate) fn contain<T>(
    failure: fn(String) -> HandlerError,
    callback: impl FnOnce() -> Result<T, HandlerError>,
) -> Result<T, HandlerError> {
    match panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(result) => result,
        Err(payload) => Err(failure(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "panicked".to_string()
    }
}

/// Failures of [`Outbound::send`].
#[derive(Debug, Error)]
pub enum SendError {
    #[error("write failed: {0}")]
    Io(#[from] io::Error),
    #[error("outbound backlog would exceed {limit} bytes")]
    BacklogExceeded { limit: usize },
}

/// Write handle to the connection that owns the running callback.
///
/// Writes go straight to the socket. Whatever the socket does not accept
/// right away is queued and flushed by the event loop on writable readiness;
/// the queue is capped at `limit` bytes.
pub struct Outbound<'a> {
    sink: &'a mut dyn Write,
    pending: &'a mut BytesMut,
    limit: usize,
}

impl<'a> Outbound<'a> {
    pub fn new(sink: &'a mut dyn Write, pending: &'a mut BytesMut, limit: usize) -> Self {
        Self {
            sink,
            pending,
            limit,
        }
    }

    /// Send `data` to the peer. Returns the number of bytes accepted, which
    /// is always `data.len()` on success.
    pub fn send(&mut self, data: &[u8]) -> Result<usize, SendError> {
        let mut written = 0;

        // Queued bytes go first, so only write directly when nothing is queued.
        if self.pending.is_empty() {
            while written < data.len() {
                match self.sink.write(&data[written..]) {
                    Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                    Ok(n) => written += n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }

        let rest = &data[written..];
        if self.pending.len() + rest.len() > self.limit {
            return Err(SendError::BacklogExceeded { limit: self.limit });
        }
        self.pending.extend_from_slice(rest);
        Ok(data.len())
    }

    /// Bytes queued behind the socket.
    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
