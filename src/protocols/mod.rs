//! Built-in connection handlers.
//!
//! Each protocol implements the runtime's `HandlerFactory`/`HandlerContext`
//! pair and is selected with `handler.kind` in the configuration.
//!
//! - `echo`: sends every line back
//! - `ping`: PING/PONG health checks

pub mod echo;
pub mod ping;
