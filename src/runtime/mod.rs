//! Single-threaded readiness runtime.
//!
//! Built on mio (epoll on Linux, kqueue on macOS). The pieces, leaves first:
//! - `LineFramer`: byte stream to newline-delimited frames
//! - `ConnectionRegistry`: live connections keyed by socket identity
//! - `HandlerFactory` / `HandlerContext`: what a connection does with its lines
//! - `Listener`: the bound server socket
//! - `EventLoop`: waits for readiness and drives all of the above

mod buffer;
mod connection;
mod event_loop;
mod framer;
mod handler;
mod listener;

pub use connection::ConnectionId;
pub use event_loop::{EventLoop, LoopSettings};
pub use handler::{Flow, HandlerContext, HandlerError, HandlerFactory, Outbound};
pub use listener::Listener;

use crate::config::{Config, ConfigError, HandlerKind};
use crate::protocols::echo::EchoFactory;
use crate::protocols::ping::PingFactory;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use tracing::info;

/// Errors that end the process.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("readiness wait failed: {0}")]
    Poll(#[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Bind the configured address and serve connections with the configured
/// handler until a fatal error.
pub fn run(config: Config) -> Result<(), ServerError> {
    let addr = config.listen_addr()?;
    let listener =
        Listener::bind(addr, config.backlog).map_err(|source| ServerError::Bind { addr, source })?;
    info!(addr = %listener.local_addr()?, backlog = config.backlog, "Listening");

    let settings = LoopSettings::from(&config);
    match config.handler {
        HandlerKind::Echo => EventLoop::new(listener, EchoFactory, settings)?.run(),
        HandlerKind::Ping => EventLoop::new(listener, PingFactory, settings)?.run(),
    }
}
