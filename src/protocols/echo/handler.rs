//! Echo protocol handler.

use crate::runtime::{ConnectionId, Flow, HandlerContext, HandlerError, HandlerFactory, Outbound};
use tracing::trace;

/// Creates an [`EchoContext`] per connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoFactory;

impl HandlerFactory for EchoFactory {
    type Context = EchoContext;

    fn create_context(
        &mut self,
        id: ConnectionId,
        _out: &mut Outbound<'_>,
    ) -> Result<EchoContext, HandlerError> {
        Ok(EchoContext { id, lines: 0 })
    }
}

/// Per-connection echo state.
#[derive(Debug)]
pub struct EchoContext {
    id: ConnectionId,
    lines: u64,
}

impl HandlerContext for EchoContext {
    fn on_line(&mut self, line: &[u8], out: &mut Outbound<'_>) -> Result<Flow, HandlerError> {
        self.lines += 1;
        out.send(line)?;
        out.send(b"\n")?;
        Ok(Flow::Continue)
    }

    fn on_fragment(
        &mut self,
        fragment: &[u8],
        out: &mut Outbound<'_>,
    ) -> Result<Flow, HandlerError> {
        out.send(fragment)?;
        Ok(Flow::Continue)
    }

    fn on_destroy(&mut self) {
        trace!(conn = %self.id, lines = self.lines, "Echo session ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn context() -> EchoContext {
        let mut sink = Vec::new();
        let mut pending = BytesMut::new();
        let mut out = Outbound::new(&mut sink, &mut pending, 1024);
        EchoFactory
            .create_context(ConnectionId::from_raw(3), &mut out)
            .unwrap()
    }

    #[test]
    fn test_echo_line() {
        let mut ctx = context();
        let mut sink = Vec::new();
        let mut pending = BytesMut::new();
        let mut out = Outbound::new(&mut sink, &mut pending, 1024);

        assert_eq!(ctx.on_line(b"hello", &mut out).unwrap(), Flow::Continue);
        assert_eq!(ctx.on_line(b"", &mut out).unwrap(), Flow::Continue);
        assert_eq!(sink, b"hello\n\n");
        assert_eq!(ctx.lines, 2);
    }

    #[test]
    fn test_echo_fragment_has_no_terminator() {
        let mut ctx = context();
        let mut sink = Vec::new();
        let mut pending = BytesMut::new();
        let mut out = Outbound::new(&mut sink, &mut pending, 1024);

        ctx.on_fragment(b"xxxx", &mut out).unwrap();
        assert_eq!(sink, b"xxxx");
    }
}
