//! Newline framing of decompressed TSV data with a bound on line length

use bytes::{Buf, BytesMut};
use std::io;
use tokio_util::codec::Decoder;

/// Line of a data file, as framed by [`BoundedLinesCodec`]
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RawLine {
    /// Line contents, without the trailing newline
    ///
    /// These bytes are not guaranteed to be valid UTF-8.
    Complete(BytesMut),

    /// Line that exceeded the length limit and whose contents were discarded
    Overlong {
        /// Number of bytes in the line, excluding the trailing newline
        length: usize,
    },
}

/// Splits a byte stream into lines without ever buffering more than one
/// line of bounded length
///
/// Unlike [`tokio_util::codec::LinesCodec`], overlong lines and non-UTF-8
/// contents are not errors: they are handed over to the caller, who decides
/// what to do with them, and framing resumes on the next line.
#[derive(Clone, Debug)]
pub struct BoundedLinesCodec {
    /// Longest line whose contents are kept
    max_length: usize,

    /// Number of buffered bytes that are known not to contain a newline
    next_index: usize,

    /// Length of the overlong line that is being skipped, if any
    discarding: Option<usize>,
}
//
impl BoundedLinesCodec {
    /// Set up a codec with a certain line length limit
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: None,
        }
    }

    /// Turn the contents of a line into a [`RawLine`]
    fn frame(&self, mut line: BytesMut) -> RawLine {
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        if line.len() > self.max_length {
            RawLine::Overlong { length: line.len() }
        } else {
            RawLine::Complete(line)
        }
    }
}
//
impl Decoder for BoundedLinesCodec {
    type Item = RawLine;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<RawLine>> {
        let newline = buf[self.next_index..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|offset| self.next_index + offset);
        match (newline, self.discarding) {
            // End of an overlong line
            (Some(end), Some(discarded)) => {
                buf.advance(end + 1);
                self.next_index = 0;
                self.discarding = None;
                Ok(Some(RawLine::Overlong {
                    length: discarded + end,
                }))
            }

            // End of a regular line
            (Some(end), None) => {
                let mut line = buf.split_to(end + 1);
                line.truncate(end);
                self.next_index = 0;
                Ok(Some(self.frame(line)))
            }

            // More of an overlong line
            (None, Some(discarded)) => {
                self.discarding = Some(discarded + buf.len());
                buf.clear();
                self.next_index = 0;
                Ok(None)
            }

            // Incomplete line, which may turn out to be overlong
            (None, None) => {
                if buf.len() > self.max_length {
                    self.discarding = Some(buf.len());
                    buf.clear();
                    self.next_index = 0;
                } else {
                    self.next_index = buf.len();
                }
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<RawLine>> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }

        // The last line of the input may lack a trailing newline
        self.next_index = 0;
        if let Some(discarded) = self.discarding.take() {
            buf.clear();
            return Ok(Some(RawLine::Overlong { length: discarded }));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let line = buf.split_to(buf.len());
        Ok(Some(self.frame(line)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete(text: &[u8]) -> RawLine {
        RawLine::Complete(BytesMut::from(text))
    }

    /// Feed input to a codec in chunks of a certain size, then signal EOF
    fn frame_all(input: &[u8], chunk_size: usize, max_length: usize) -> Vec<RawLine> {
        let mut codec = BoundedLinesCodec::new(max_length);
        let mut buf = BytesMut::new();
        let mut lines = Vec::new();
        for chunk in input.chunks(chunk_size) {
            buf.extend_from_slice(chunk);
            while let Some(line) = codec.decode(&mut buf).unwrap() {
                lines.push(line);
            }
        }
        while let Some(line) = codec.decode_eof(&mut buf).unwrap() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn lines_survive_any_chunking() {
        let input = b"one\ttwo\r\nthree\n\nfour";
        let expected = vec![complete(b"one\ttwo"), complete(b"three"), complete(b""), complete(b"four")];
        for chunk_size in 1..=input.len() {
            assert_eq!(frame_all(input, chunk_size, 16), expected, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn overlong_lines_are_skipped() {
        let input = b"short\nthis line is way too long\nok\nanother overlong line at eof";
        let expected = vec![
            complete(b"short"),
            RawLine::Overlong { length: 25 },
            complete(b"ok"),
            RawLine::Overlong { length: 28 },
        ];
        for chunk_size in [1, 3, 7, input.len()] {
            assert_eq!(frame_all(input, chunk_size, 10), expected, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn invalid_utf8_is_passed_through() {
        let lines = frame_all(b"ok\n\xff\xfebad\nok\n", 4, 16);
        assert_eq!(lines, vec![complete(b"ok"), complete(b"\xff\xfebad"), complete(b"ok")]);
    }

    #[test]
    fn limit_is_inclusive() {
        let lines = frame_all(b"1234567890\n12345678901\n", 5, 10);
        assert_eq!(lines, vec![complete(b"1234567890"), RawLine::Overlong { length: 11 }]);
    }
}
