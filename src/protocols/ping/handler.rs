//! Ping protocol handler.

use super::parser::{self, Command, ParseResult};
use crate::runtime::{ConnectionId, Flow, HandlerContext, HandlerError, HandlerFactory, Outbound};
use tracing::debug;

/// Creates a [`PingContext`] per connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct PingFactory;

impl HandlerFactory for PingFactory {
    type Context = PingContext;

    fn create_context(
        &mut self,
        id: ConnectionId,
        _out: &mut Outbound<'_>,
    ) -> Result<PingContext, HandlerError> {
        Ok(PingContext { id })
    }
}

/// Per-connection ping state. Stateless apart from its identity.
#[derive(Debug)]
pub struct PingContext {
    id: ConnectionId,
}

impl HandlerContext for PingContext {
    fn on_line(&mut self, line: &[u8], out: &mut Outbound<'_>) -> Result<Flow, HandlerError> {
        match parser::parse(line) {
            ParseResult::Complete(Command::Ping) => {
                out.send(parser::response_pong())?;
            }
            ParseResult::Complete(Command::PingMsg(msg)) => {
                out.send(&parser::response_pong_msg(msg))?;
            }
            ParseResult::Complete(Command::Quit) => {
                out.send(parser::response_ok())?;
                return Ok(Flow::Close);
            }
            ParseResult::Error => {
                debug!(conn = %self.id, "Unknown ping command");
                out.send(parser::response_error())?;
            }
        }
        Ok(Flow::Continue)
    }

    // An oversized fragment is never a valid command.
    fn on_fragment(
        &mut self,
        _fragment: &[u8],
        out: &mut Outbound<'_>,
    ) -> Result<Flow, HandlerError> {
        out.send(parser::response_error())?;
        Ok(Flow::Continue)
    }
}
