//! Newline framing for connection byte streams.
//!
//! `LineFramer` turns the chunks produced by successive socket reads into
//! discrete frames. It carries the unterminated tail of the previous read as
//! partial-line state and never performs I/O itself.
//!
//! ## Overflow
//!
//! The partial buffer never holds more than `max_line_size` bytes. Once that
//! many bytes have accumulated without a newline, they are emitted as a
//! [`Frame::Overflow`] and the buffer starts over. Whether the overflow is
//! handed to the handler or ends the connection is the event loop's decision
//! (see `OverflowPolicy`).
//!
//! The trigger depends only on the byte stream, not on how it was split into
//! reads: a line of `L` bytes produces `L / max_line_size` overflow frames of
//! exactly `max_line_size` bytes followed by a `Line` with the remainder.

use bytes::{Bytes, BytesMut};

/// One framing event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Bytes between two newlines, terminator excluded.
    Line(Bytes),
    /// `max_line_size` bytes that arrived without a newline.
    Overflow(Bytes),
}

/// Per-connection partial-line state.
#[derive(Debug)]
pub struct LineFramer {
    partial: BytesMut,
    max_line_size: usize,
}

impl LineFramer {
    pub fn new(max_line_size: usize) -> Self {
        assert!(max_line_size > 0, "max_line_size must be non-zero");
        Self {
            partial: BytesMut::new(),
            max_line_size,
        }
    }

    /// Frame one read's worth of data.
    ///
    /// The returned iterator is lazy; bytes it has not yet reached are not
    /// buffered, so callers must drain it unless the connection is being
    /// torn down.
    pub fn feed<'a>(&'a mut self, chunk: &'a [u8]) -> Frames<'a> {
        Frames {
            framer: self,
            rest: chunk,
        }
    }

    /// Bytes currently held waiting for a terminator.
    pub fn buffered(&self) -> usize {
        self.partial.len()
    }
}

/// Iterator over the frames of a single chunk.
pub struct Frames<'a> {
    framer: &'a mut LineFramer,
    rest: &'a [u8],
}

impl Iterator for Frames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        let max = self.framer.max_line_size;
        let room = max - self.framer.partial.len();

        match self.rest.iter().position(|&b| b == b'\n') {
            Some(pos) if pos < room => {
                let (line, tail) = self.rest.split_at(pos);
                self.rest = &tail[1..];
                let line = if self.framer.partial.is_empty() {
                    Bytes::copy_from_slice(line)
                } else {
                    self.framer.partial.extend_from_slice(line);
                    self.framer.partial.split().freeze()
                };
                Some(Frame::Line(line))
            }
            _ if self.rest.len() >= room => {
                // `max` bytes without a newline between them.
                let (head, tail) = self.rest.split_at(room);
                self.rest = tail;
                self.framer.partial.extend_from_slice(head);
                Some(Frame::Overflow(self.framer.partial.split().freeze()))
            }
            _ => {
                self.framer.partial.extend_from_slice(self.rest);
                self.rest = &[];
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect<C: AsRef<[u8]>>(framer: &mut LineFramer, chunks: &[C]) -> Vec<Frame> {
        chunks
            .iter()
            .flat_map(|chunk| framer.feed(chunk.as_ref()).collect::<Vec<_>>())
            .collect()
    }

    fn line(s: &str) -> Frame {
        Frame::Line(Bytes::copy_from_slice(s.as_bytes()))
    }

    fn overflow(s: &str) -> Frame {
        Frame::Overflow(Bytes::copy_from_slice(s.as_bytes()))
    }

    #[test]
    fn test_single_line() {
        let mut framer = LineFramer::new(64);
        assert_eq!(collect(&mut framer, &[b"hello\n"]), vec![line("hello")]);
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_split_write() {
        let mut framer = LineFramer::new(64);
        assert!(framer.feed(b"he").next().is_none());
        assert_eq!(framer.buffered(), 2);
        assert_eq!(collect(&mut framer, &[b"llo\n"]), vec![line("hello")]);
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_multi_line_chunk_keeps_tail() {
        let mut framer = LineFramer::new(64);
        assert_eq!(
            collect(&mut framer, &[b"a\nb\nc"]),
            vec![line("a"), line("b")]
        );
        assert_eq!(framer.buffered(), 1);
        assert_eq!(collect(&mut framer, &[b"\n"]), vec![line("c")]);
    }

    #[test]
    fn test_empty_lines_and_chunks() {
        let mut framer = LineFramer::new(64);
        assert!(collect(&mut framer, &[b""]).is_empty());
        assert_eq!(collect(&mut framer, &[b"\n\n"]), vec![line(""), line("")]);
    }

    #[test]
    fn test_carriage_return_is_payload() {
        let mut framer = LineFramer::new(64);
        assert_eq!(collect(&mut framer, &[b"hi\r\n"]), vec![line("hi\r")]);
    }

    #[test]
    fn test_rechunking_is_invisible() {
        let stream = b"alpha\nbeta\n\ngamma delta\nepsilon";
        let mut whole = LineFramer::new(8);
        let expected = collect(&mut whole, &[stream]);

        for size in 1..stream.len() {
            let mut framer = LineFramer::new(8);
            let chunks: Vec<&[u8]> = stream.chunks(size).collect();
            assert_eq!(collect(&mut framer, &chunks), expected, "chunk size {size}");
            assert_eq!(framer.buffered(), whole.buffered());
        }
    }

    #[test]
    fn test_overflow_within_one_chunk() {
        let mut framer = LineFramer::new(4);
        assert_eq!(
            collect(&mut framer, &[b"abcdefghij\n"]),
            vec![overflow("abcd"), overflow("efgh"), line("ij")]
        );
    }

    #[test]
    fn test_overflow_across_reads() {
        let mut framer = LineFramer::new(4);
        assert!(collect(&mut framer, &[b"ab"]).is_empty());
        assert_eq!(collect(&mut framer, &[b"cdef"]), vec![overflow("abcd")]);
        assert_eq!(framer.buffered(), 2);
        assert_eq!(collect(&mut framer, &[b"\n"]), vec![line("ef")]);
    }

    #[test]
    fn test_line_of_exact_limit_overflows() {
        let mut framer = LineFramer::new(4);
        assert_eq!(
            collect(&mut framer, &[b"abcd\n"]),
            vec![overflow("abcd"), line("")]
        );
    }

    #[test]
    fn test_buffer_never_exceeds_limit() {
        let mut framer = LineFramer::new(16);
        let junk = [b'x'; 7];
        let mut overflows = 0;
        for _ in 0..100 {
            for frame in framer.feed(&junk) {
                assert_eq!(frame, Frame::Overflow(Bytes::from_static(&[b'x'; 16])));
                overflows += 1;
            }
            assert!(framer.buffered() < 16);
        }
        assert_eq!(overflows, 700 / 16);
    }

    #[test]
    fn test_line_count_matches_newlines() {
        let stream: Vec<u8> = (0..500u32)
            .flat_map(|i| {
                let mut l = format!("{i}").into_bytes();
                l.push(b'\n');
                l
            })
            .collect();
        let mut framer = LineFramer::new(4096);
        let frames: Vec<_> = stream
            .chunks(7)
            .flat_map(|c| framer.feed(c).collect::<Vec<_>>())
            .collect();
        assert_eq!(frames.len(), 500);
        assert_eq!(frames[499], line("499"));
    }
}
