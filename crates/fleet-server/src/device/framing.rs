//! Newline-delimited framing for the device socket.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// One unit read from a device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// A complete line, without its `\n` / `\r\n` terminator.
    Line(String),
    /// A line longer than the configured limit. Its bytes were discarded.
    TooLong,
}

/// Reads [`Frame`]s from a buffered byte stream.
///
/// Invalid UTF-8 is replaced rather than rejected. A final line without a
/// trailing newline is still returned before end of stream.
pub struct LineReader<R> {
    inner: R,
    max_line: usize,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    pub fn new(inner: R, max_line: usize) -> Self {
        Self {
            inner,
            max_line,
            buf: Vec::with_capacity(256),
        }
    }

    /// Next frame, or `None` at end of stream.
    ///
    /// The length limit counts line content only; the `\n` or `\r\n`
    /// terminator does not count against it.
    ///
    /// Not cancel safe: drive it from a dedicated task.
    pub async fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        self.buf.clear();
        // Room for the content plus a full CRLF terminator.
        let limit = self.max_line as u64 + 2;
        let n = (&mut self.inner)
            .take(limit)
            .read_until(b'\n', &mut self.buf)
            .await?;
        if n == 0 {
            return Ok(None);
        }

        if self.buf.last() == Some(&b'\n') {
            let _ = self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                let _ = self.buf.pop();
            }
        } else if self.buf.len() as u64 == limit {
            self.discard_rest_of_line().await?;
            return Ok(Some(Frame::TooLong));
        }

        // A terminated line, or the unterminated tail before end of stream.
        if self.buf.len() > self.max_line {
            return Ok(Some(Frame::TooLong));
        }
        Ok(Some(Frame::Line(self.take_line())))
    }

    fn take_line(&mut self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }

    async fn discard_rest_of_line(&mut self) -> io::Result<()> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                return Ok(());
            }
            match available.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    self.inner.consume(pos + 1);
                    return Ok(());
                }
                None => {
                    let len = available.len();
                    self.inner.consume(len);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn frames(input: &[u8], max: usize) -> Vec<Frame> {
        let mut reader = LineReader::new(BufReader::new(input), max);
        let mut out = Vec::new();
        while let Some(frame) = reader.next_frame().await.unwrap() {
            out.push(frame);
        }
        out
    }

    fn line(s: &str) -> Frame {
        Frame::Line(s.to_string())
    }

    #[tokio::test]
    async fn splits_on_newline_and_strips_cr() {
        let got = frames(b"REGISTER|a|b|c\r\nDATA|x\n", 64).await;
        assert_eq!(got, vec![line("REGISTER|a|b|c"), line("DATA|x")]);
    }

    #[tokio::test]
    async fn trailing_line_without_newline() {
        let got = frames(b"HEARTBEAT|a\nPONG|a", 64).await;
        assert_eq!(got, vec![line("HEARTBEAT|a"), line("PONG|a")]);
    }

    #[tokio::test]
    async fn empty_lines_are_frames() {
        let got = frames(b"\n\nX|y\n", 64).await;
        assert_eq!(got, vec![line(""), line(""), line("X|y")]);
    }

    #[tokio::test]
    async fn overlong_line_is_skipped_and_reading_continues() {
        let mut input = vec![b'a'; 40];
        input.extend_from_slice(b"\nDATA|ok\n");
        let got = frames(&input, 16).await;
        assert_eq!(got, vec![Frame::TooLong, line("DATA|ok")]);
    }

    #[tokio::test]
    async fn line_at_exact_limit_is_accepted() {
        let got = frames(b"0123456789\n", 10).await;
        assert_eq!(got, vec![line("0123456789")]);
    }

    #[tokio::test]
    async fn crlf_line_at_exact_limit_is_accepted() {
        let got = frames(b"0123456789\r\nOK\n", 10).await;
        assert_eq!(got, vec![line("0123456789"), line("OK")]);
    }

    #[tokio::test]
    async fn one_byte_over_limit_is_too_long_with_either_terminator() {
        let got = frames(b"01234567890\r\nOK\n", 10).await;
        assert_eq!(got, vec![Frame::TooLong, line("OK")]);

        let got = frames(b"01234567890\nOK\n", 10).await;
        assert_eq!(got, vec![Frame::TooLong, line("OK")]);
    }

    #[tokio::test]
    async fn overlong_tail_at_eof() {
        let got = frames(&[b'z'; 30], 8).await;
        assert_eq!(got, vec![Frame::TooLong]);
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced() {
        let got = frames(b"DATA|\xff\xfe\n", 64).await;
        assert_eq!(got, vec![line("DATA|\u{FFFD}\u{FFFD}")]);
    }

    #[tokio::test]
    async fn fullwidth_text_survives() {
        let got = frames("HEARTBEAT｜dev1\n".as_bytes(), 64).await;
        assert_eq!(got, vec![line("HEARTBEAT｜dev1")]);
    }
}
