//! Echo protocol implementation.
//!
//! A line echo service for I/O testing:
//! - Client sends: `<line>\n`
//! - Server echoes: `<line>\n`
//!
//! ## Use Cases
//!
//! 1. **Framing validation**: Whatever comes back is exactly what the framer
//!    produced, so split writes and multi-line chunks can be checked from the
//!    client side.
//!
//! 2. **Overflow behavior**: With the `deliver` overflow policy, oversized
//!    fragments come back without a terminator, making the cut points visible.
//!
//! 3. **Stress testing**: Generate high I/O load to test stability and
//!    resource limits (connections, memory, file descriptors).
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  hello\n
//! Response: hello\n
//! ```

pub mod handler;

pub use handler::EchoFactory;
