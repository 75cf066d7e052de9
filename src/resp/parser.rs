//! # Stream Parser (C2)
//!
//! An incremental RESP decoder. [`FramedReader`] drives it over an
//! [`tokio::io::AsyncRead`] source, tolerating partial I/O the way a real
//! socket delivers it; [`parse_one`] drives the same state machine
//! synchronously over a finite in-memory buffer.
//!
//! Grounded on `original_source/resp/parser/parser.go`'s `parse0`/`readLine`
//! two-mode state machine (line mode vs. bulk mode), reworked as a Rust
//! struct instead of a goroutine writing to a channel — `next_frame` is the
//! pull-based analogue of receiving from that channel.

use crate::errors::{FrameError, RespError};
use crate::resp::reply::Reply;
use bytes::{Bytes, BytesMut};
use memchr::memchr;
use std::panic::{self, AssertUnwindSafe};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// The parser's internal record, reset to zero on every emitted frame or
/// protocol error (spec.md §3, "Parser state").
#[derive(Debug, Default)]
struct ParserState {
    reading_multiline: bool,
    expected_args: usize,
    msg_type: u8,
    args: Vec<Bytes>,
    bulk_len: i64,
}

impl ParserState {
    fn finished(&self) -> bool {
        self.expected_args > 0 && self.args.len() == self.expected_args
    }

    /// `Some(n)` when the next physical read must be exactly `n` bytes
    /// (bulk mode); `None` when it should read up to and including `\n`
    /// (line mode).
    fn next_read_len(&self) -> Option<usize> {
        if self.bulk_len > 0 {
            Some(self.bulk_len as usize + 2)
        } else {
            None
        }
    }
}

/// Outcome of feeding one physical line into the state machine.
enum Step {
    /// Nothing to emit yet; keep reading.
    Continue,
    /// A complete frame is ready.
    Emit(Reply),
    /// A protocol error; caller resets state and continues.
    Error(RespError),
}

/// Parses the decimal length embedded in `*<N>\r\n` / `$<N>\r\n` headers.
/// `line` is the full physical line including its terminating `\r\n` but
/// excluding the leading type byte.
fn parse_decimal(digits: &[u8]) -> Result<i64, RespError> {
    if digits.is_empty() {
        return Err(RespError::IntegerParse(String::new()));
    }
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| RespError::IntegerParse(String::from_utf8_lossy(digits).into_owned()))
}

/// Strips the trailing `\r\n` from a physical line, validating it is
/// present (spec.md §4.2 Algorithm, steps 1/2).
fn strip_crlf(line: &[u8]) -> Result<&[u8], RespError> {
    if line.len() < 2 || line[line.len() - 1] != b'\n' || line[line.len() - 2] != b'\r' {
        return Err(RespError::CrlfNotAtEnd);
    }
    Ok(&line[..line.len() - 2])
}

fn parse_multi_bulk_header(state: &mut ParserState, body: &[u8]) -> Result<Step, RespError> {
    let count = parse_decimal(&body[1..])?;
    if count < 0 {
        return Err(RespError::NegativeLength);
    }
    if count == 0 {
        return Ok(Step::Emit(Reply::multi_bulk(Vec::new())));
    }
    state.reading_multiline = true;
    state.msg_type = b'*';
    state.expected_args = count as usize;
    state.args = Vec::with_capacity(count as usize);
    Ok(Step::Continue)
}

fn parse_bulk_header(state: &mut ParserState, body: &[u8]) -> Result<Step, RespError> {
    let len = parse_decimal(&body[1..])?;
    if len < -1 {
        return Err(RespError::NegativeLength);
    }
    if len == -1 {
        return Ok(Step::Emit(Reply::NullBulk));
    }
    if len == 0 {
        // Open question resolved per spec.md §9: record an empty element
        // and let the natural blank-line skip below consume the payload
        // line that follows `$0\r\n`.
        return Ok(Step::Emit(Reply::bulk(Bytes::new())));
    }
    state.reading_multiline = true;
    state.msg_type = b'$';
    state.expected_args = 1;
    state.args = Vec::with_capacity(1);
    state.bulk_len = len;
    Ok(Step::Continue)
}

/// `original_source`'s `parseSingleLineReply`: `+`/`-`/`:` lines outside a
/// multi-bulk array. Unknown first bytes are treated as protocol errors
/// per the Open Question resolution in spec.md §9.
fn parse_single_line(body: &[u8]) -> Result<Reply, RespError> {
    let content = &body[1..];
    match body[0] {
        b'+' => Ok(Reply::status(Bytes::copy_from_slice(content))),
        b'-' => {
            let text = String::from_utf8_lossy(content);
            let trimmed = text.strip_prefix("ERR ").unwrap_or(&text);
            Ok(Reply::Error(crate::resp::reply::ErrorReply::Normal(
                Bytes::copy_from_slice(trimmed.as_bytes()),
            )))
        }
        b':' => {
            let n = parse_decimal(content)
                .map_err(|_| RespError::IntegerParse(String::from_utf8_lossy(content).into_owned()))?;
            Ok(Reply::Integer(n))
        }
        other => Err(RespError::UnsupportedType(other)),
    }
}

fn read_body_line(state: &mut ParserState, body: &[u8]) -> Step {
    if body.first() == Some(&b'$') {
        match parse_decimal(&body[1..]) {
            Ok(n) if n <= 0 => {
                state.args.push(Bytes::new());
                state.bulk_len = 0;
            }
            Ok(n) => state.bulk_len = n,
            Err(e) => return Step::Error(e),
        }
    } else {
        state.args.push(Bytes::copy_from_slice(body));
    }

    if state.finished() {
        let reply = match state.msg_type {
            b'*' => Reply::multi_bulk(std::mem::take(&mut state.args)),
            b'$' => Reply::Bulk(state.args.remove(0)),
            _ => unreachable!("msg_type is only ever set to '*' or '$'"),
        };
        Step::Emit(reply)
    } else {
        Step::Continue
    }
}

/// Feeds one physical line (including its trailing CRLF) into the state
/// machine, mutating `state` as needed. This is the pure, I/O-free core
/// shared by [`FramedReader`] and [`parse_one`].
fn feed_line(state: &mut ParserState, line: &[u8]) -> Step {
    if line.is_empty() || line[0] == b'\n' || line[0] == b'\r' {
        return Step::Continue;
    }

    let body = match strip_crlf(line) {
        Ok(b) => b,
        Err(e) => return Step::Error(e),
    };

    if !state.reading_multiline {
        match body.first() {
            Some(b'*') => match parse_multi_bulk_header(state, body) {
                Ok(step) => step,
                Err(e) => Step::Error(e),
            },
            Some(b'$') => match parse_bulk_header(state, body) {
                Ok(step) => step,
                Err(e) => Step::Error(e),
            },
            Some(b'+') | Some(b'-') | Some(b':') => match parse_single_line(body) {
                Ok(r) => Step::Emit(r),
                Err(e) => Step::Error(e),
            },
            Some(other) => Step::Error(RespError::UnsupportedType(*other)),
            None => Step::Continue,
        }
    } else {
        read_body_line(state, body)
    }
}

/// One call to `feed_line`, shielded against panics per spec.md §4.2's
/// hard invariant: a panic must not propagate out of the decode loop.
fn feed_line_guarded(state: &mut ParserState, line: &[u8]) -> Step {
    let result = panic::catch_unwind(AssertUnwindSafe(|| feed_line(state, line)));
    match result {
        Ok(step) => step,
        Err(_) => {
            log::error!("RESP decode step panicked; treating as a protocol error");
            Step::Error(RespError::DecodePanic)
        }
    }
}

/// Runs the decoder on a finite buffer, returning the first emitted frame.
///
/// Direct analogue of `original_source/resp/parser/one.go`'s `ParseOne`.
/// Returns `Err(None)` ("no protocol") if the buffer was empty and no frame
/// could be produced.
pub fn parse_one(data: &[u8]) -> Result<Result<Reply, RespError>, ()> {
    let mut state = ParserState::default();
    let mut cursor = data;

    loop {
        let read_len = state.next_read_len();
        let (line, rest) = match read_len {
            Some(n) => {
                if cursor.len() < n {
                    return Err(());
                }
                cursor.split_at(n)
            }
            None => match memchr(b'\n', cursor) {
                Some(pos) => cursor.split_at(pos + 1),
                // No complete line available yet: insufficient data, not a
                // protocol error.
                None => return Err(()),
            },
        };
        cursor = rest;

        match feed_line_guarded(&mut state, line) {
            Step::Continue => {}
            Step::Emit(reply) => return Ok(Ok(reply)),
            Step::Error(e) => return Ok(Err(e)),
        }
    }
}

/// Drives [`ParserState`] over an [`AsyncRead`] source, yielding one
/// [`Reply`]/[`FrameError`] per call to [`FramedReader::next_frame`].
///
/// Single-producer, not reentrant across frames of the same stream, per
/// spec.md §5.
pub struct FramedReader<R> {
    reader: BufReader<R>,
    state: ParserState,
    terminated: bool,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            state: ParserState::default(),
            terminated: false,
        }
    }

    /// Reads the next physical line or bulk block per spec.md §4.2
    /// Algorithm steps 1/2.
    async fn read_physical(&mut self) -> Result<Bytes, FrameError> {
        match self.state.next_read_len() {
            Some(n) => {
                let mut buf = BytesMut::zeroed(n);
                self.reader.read_exact(&mut buf).await?;
                self.state.bulk_len = 0;
                if buf[n - 2] != b'\r' || buf[n - 1] != b'\n' {
                    return Err(FrameError::Protocol(RespError::CrlfNotAtEnd));
                }
                Ok(buf.freeze())
            }
            None => {
                let mut buf = Vec::new();
                let n = self.reader.read_until(b'\n', &mut buf).await?;
                // `read_until` also returns on EOF without having found the
                // delimiter; discard any partial line the same way
                // `original_source`'s `readLine` discards it on `io.EOF`.
                if n == 0 || buf.last() != Some(&b'\n') {
                    return Err(FrameError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed",
                    )));
                }
                Ok(Bytes::from(buf))
            }
        }
    }

    /// Yields the next frame, or `None` once the stream has been fully
    /// consumed (after the single terminal I/O-error frame has already
    /// been returned).
    pub async fn next_frame(&mut self) -> Option<Result<Reply, FrameError>> {
        if self.terminated {
            return None;
        }

        loop {
            let line = match self.read_physical().await {
                Ok(line) => line,
                Err(FrameError::Io(e)) => {
                    self.terminated = true;
                    return Some(Err(FrameError::Io(e)));
                }
                Err(FrameError::Protocol(e)) => {
                    self.state = ParserState::default();
                    return Some(Err(FrameError::Protocol(e)));
                }
            };

            match feed_line_guarded(&mut self.state, &line) {
                Step::Continue => continue,
                Step::Emit(reply) => {
                    self.state = ParserState::default();
                    return Some(Ok(reply));
                }
                Step::Error(e) => {
                    self.state = ParserState::default();
                    return Some(Err(FrameError::Protocol(e)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resp::reply::ErrorReply;

    async fn frames_of(input: &[u8]) -> Vec<Result<Reply, String>> {
        let mut reader = FramedReader::new(input);
        let mut out = Vec::new();
        while let Some(frame) = reader.next_frame().await {
            match frame {
                Ok(r) => out.push(Ok(r)),
                Err(FrameError::Protocol(e)) => out.push(Err(format!("protocol:{e}"))),
                Err(FrameError::Io(_)) => break,
            }
        }
        out
    }

    #[tokio::test]
    async fn s1_ping_array() {
        let frames = frames_of(b"*1\r\n$4\r\nPING\r\n").await;
        assert_eq!(frames, vec![Ok(Reply::multi_bulk(vec![Bytes::from_static(b"PING")]))]);
    }

    #[tokio::test]
    async fn s4_empty_array() {
        let frames = frames_of(b"*0\r\n").await;
        assert_eq!(frames, vec![Ok(Reply::multi_bulk(vec![]))]);
    }

    #[tokio::test]
    async fn s5_null_bulk() {
        let frames = frames_of(b"$-1\r\n").await;
        assert_eq!(frames, vec![Ok(Reply::NullBulk)]);
    }

    #[tokio::test]
    async fn set_get_roundtrip_shape() {
        let frames = frames_of(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n").await;
        assert_eq!(
            frames,
            vec![Ok(Reply::multi_bulk(vec![
                Bytes::from_static(b"SET"),
                Bytes::from_static(b"k"),
                Bytes::from_static(b"v"),
            ]))]
        );
    }

    /// Invariant 8.2: k well-formed frames, then malformed bytes, then m
    /// more well-formed frames yields exactly k+m+1 elements, with the
    /// malformed region producing exactly one error frame.
    #[tokio::test]
    async fn malformed_region_yields_one_error_and_resumes() {
        let mut input = Vec::new();
        input.extend_from_slice(b"*1\r\n$4\r\nPING\r\n"); // k=1
        input.extend_from_slice(b"*2\r\n$3\r\nFOO\r\n$z\r\n"); // malformed: bad length digits on 2nd element's bulk header
        input.extend_from_slice(b"*1\r\n$4\r\nPING\r\n"); // m=1
        input.extend_from_slice(b"*1\r\n$4\r\nPING\r\n"); // m=2

        let frames = frames_of(&input).await;
        assert_eq!(frames.len(), 4);
        assert!(frames[0].is_ok());
        assert!(frames[1].is_err());
        assert!(frames[2].is_ok());
        assert!(frames[3].is_ok());
    }

    #[tokio::test]
    async fn bulk_zero_records_empty_element_and_skips_payload_line() {
        let frames = frames_of(b"*2\r\n$0\r\n\r\n$4\r\nPING\r\n").await;
        assert_eq!(
            frames,
            vec![Ok(Reply::multi_bulk(vec![Bytes::new(), Bytes::from_static(b"PING")]))]
        );
    }

    #[tokio::test]
    async fn negative_multi_bulk_count_is_protocol_error() {
        let frames = frames_of(b"*-5\r\n").await;
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_err());
    }

    #[tokio::test]
    async fn single_line_status_and_integer() {
        let frames = frames_of(b"+OK\r\n:42\r\n").await;
        assert_eq!(frames, vec![Ok(Reply::status("OK")), Ok(Reply::Integer(42))]);
    }

    #[tokio::test]
    async fn single_line_error_strips_err_prefix() {
        let frames = frames_of(b"-ERR boom\r\n").await;
        match &frames[0] {
            Ok(Reply::Error(ErrorReply::Normal(s))) => assert_eq!(s.as_ref(), b"boom"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn parse_one_on_empty_buffer_is_no_protocol() {
        assert_eq!(parse_one(b""), Err(()));
    }

    #[test]
    fn parse_one_matches_stream_decode() {
        let result = parse_one(b"*1\r\n$4\r\nPING\r\n").unwrap().unwrap();
        assert_eq!(result, Reply::multi_bulk(vec![Bytes::from_static(b"PING")]));
    }

    /// Invariant 8.1: every reply built from typed constructors round-trips
    /// through `parse_one(serialize())` to bytes identical to the original.
    #[test]
    fn invariant_roundtrip() {
        let samples = vec![
            Reply::status("OK"),
            Reply::Integer(-42),
            Reply::bulk(Bytes::from_static(b"hello")),
            Reply::NullBulk,
            Reply::multi_bulk(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]),
            Reply::multi_bulk(vec![]),
        ];
        for reply in samples {
            let bytes = reply.serialize();
            let decoded = parse_one(&bytes).unwrap().unwrap();
            assert_eq!(decoded.serialize(), bytes);
        }
    }
}
