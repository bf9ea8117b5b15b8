//! Ping protocol implementation.
//!
//! A minimal protocol for health checks and latency measurement:
//! - Client sends: `PING\n` or `PING <message>\n`
//! - Server responds: `PONG\n` or `PONG <message>\n`
//!
//! ## Use Cases
//!
//! 1. **Health checks**: Load balancers and monitoring systems can verify
//!    the server is responsive.
//!
//! 2. **Latency measurement**: Measures pure network + event loop overhead,
//!    useful for establishing baseline latency.
//!
//! 3. **Connection testing**: Verify connectivity, then end the session with
//!    `QUIT`.
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  PING\n
//! Response: PONG\n
//!
//! Request:  PING hello\n
//! Response: PONG hello\n
//!
//! Request:  QUIT\n
//! Response: OK\n      (then the server closes the connection)
//! ```
//!
//! Commands are case-insensitive and a trailing `\r` is ignored, so
//! CRLF-terminated clients work unchanged.

pub mod handler;
pub mod parser;

pub use handler::PingFactory;
