//! Ping protocol parser.

/// Parsed ping command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// Simple ping (no message).
    Ping,
    /// Ping with a message to echo back.
    PingMsg(&'a [u8]),
    /// Quit command.
    Quit,
}

/// Parse result.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult<'a> {
    /// Successfully parsed command.
    Complete(Command<'a>),
    /// Protocol error (unknown command).
    Error,
}

/// Parse one framed line.
pub fn parse(line: &[u8]) -> ParseResult<'_> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);

    // Parse command (case-insensitive)
    if line.eq_ignore_ascii_case(b"PING") {
        ParseResult::Complete(Command::Ping)
    } else if line.eq_ignore_ascii_case(b"QUIT") {
        ParseResult::Complete(Command::Quit)
    } else if line.len() > 5 && line[..5].eq_ignore_ascii_case(b"PING ") {
        ParseResult::Complete(Command::PingMsg(&line[5..]))
    } else {
        ParseResult::Error
    }
}

/// Format a PONG response.
pub fn response_pong() -> &'static [u8] {
    b"PONG\n"
}

/// Format a PONG response with message.
pub fn response_pong_msg(msg: &[u8]) -> Vec<u8> {
    let mut response = Vec::with_capacity(5 + msg.len() + 1); // "PONG " + msg + "\n"
    response.extend_from_slice(b"PONG ");
    response.extend_from_slice(msg);
    response.push(b'\n');
    response
}

/// Reply to QUIT.
pub fn response_ok() -> &'static [u8] {
    b"OK\n"
}

/// Format an error response.
pub fn response_error() -> &'static [u8] {
    b"ERROR unknown command\n"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ping() {
        assert_eq!(parse(b"PING"), ParseResult::Complete(Command::Ping));
        assert_eq!(parse(b"ping"), ParseResult::Complete(Command::Ping));
        assert_eq!(parse(b"PING\r"), ParseResult::Complete(Command::Ping));
    }

    #[test]
    fn test_parse_ping_msg() {
        assert_eq!(
            parse(b"PING hello"),
            ParseResult::Complete(Command::PingMsg(b"hello"))
        );
        assert_eq!(
            parse(b"ping hello world\r"),
            ParseResult::Complete(Command::PingMsg(b"hello world"))
        );
    }

    #[test]
    fn test_parse_quit() {
        assert_eq!(parse(b"QUIT"), ParseResult::Complete(Command::Quit));
        assert_eq!(parse(b"quit\r"), ParseResult::Complete(Command::Quit));
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(parse(b"FOO"), ParseResult::Error);
        assert_eq!(parse(b""), ParseResult::Error);
        assert_eq!(parse(b"PING "), ParseResult::Error);
    }

    #[test]
    fn test_response_pong_msg() {
        assert_eq!(response_pong_msg(b"abc"), b"PONG abc\n");
    }
}
