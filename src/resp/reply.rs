//! # Reply Model
//!
//! Typed, serializable RESP reply values. Every variant exposes
//! [`Reply::serialize`], which produces a RESP-compliant payload; error
//! variants additionally expose [`Reply::message`], the error text with the
//! leading `-` and trailing CRLF stripped.
//!
//! [RESP protocol specification](https://redis.io/docs/latest/develop/reference/protocol-spec/)

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Line terminator used throughout RESP.
pub const CRLF: &[u8] = b"\r\n";

/// Wire bytes for the null bulk string / null array token.
const NULL_BULK: &[u8] = b"$-1\r\n";
/// Wire bytes for an empty multi-bulk array.
const EMPTY_MULTI_BULK: &[u8] = b"*0\r\n";
const PONG_BYTES: &[u8] = b"+PONG\r\n";
const OK_BYTES: &[u8] = b"+OK\r\n";
const QUEUED_BYTES: &[u8] = b"+QUEUED\r\n";

/// A value that can be serialized to a byte sequence per the RESP grammar.
///
/// Singleton replies ([`Reply::Pong`], [`Reply::Ok`], [`Reply::Queued`],
/// [`Reply::NoReply`]) compare equal by their (interned, constant)
/// serialized bytes rather than by identity, since Rust has no cheap notion
/// of shared singleton identity across an owned enum — the constant byte
/// literals play the role the teacher's `init()`-time singletons play.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Simple status: `+<s>\r\n`.
    Status(Bytes),
    /// A typed error. See [`ErrorReply`].
    Error(ErrorReply),
    /// `:<decimal>\r\n`.
    Integer(i64),
    /// Bulk string. A zero-length payload serializes as the null-bulk token,
    /// same as [`Reply::NullBulk`] — see spec invariant 8.6.
    Bulk(Bytes),
    /// Distinct from an empty bulk only in how it is constructed; same wire
    /// form (`$-1\r\n`).
    NullBulk,
    /// Ordered sequence of bulk arguments. An empty element renders as the
    /// null-bulk token; an empty sequence renders as `*0\r\n`.
    MultiBulk(Vec<Bytes>),
    /// Heterogeneous reply array: each element serializes with its own
    /// rules rather than being coerced to a bulk string.
    MultiRaw(Vec<Reply>),
    /// `+PONG\r\n`.
    Pong,
    /// `+OK\r\n`.
    Ok,
    /// `+QUEUED\r\n`.
    Queued,
    /// The empty byte sequence. Never has a trailing CRLF; see spec
    /// invariant 8.1's exemption clause.
    NoReply,
}

impl Reply {
    /// Serializes this reply to its RESP wire form.
    pub fn serialize(&self) -> Bytes {
        match self {
            Reply::Status(s) => simple_line(b'+', s),
            Reply::Error(e) => e.serialize(),
            Reply::Integer(n) => Bytes::from(format!(":{n}\r\n")),
            Reply::Bulk(b) => serialize_bulk(b),
            Reply::NullBulk => Bytes::from_static(NULL_BULK),
            Reply::MultiBulk(args) => serialize_multi_bulk(args),
            Reply::MultiRaw(replies) => serialize_multi_raw(replies),
            Reply::Pong => Bytes::from_static(PONG_BYTES),
            Reply::Ok => Bytes::from_static(OK_BYTES),
            Reply::Queued => Bytes::from_static(QUEUED_BYTES),
            Reply::NoReply => Bytes::new(),
        }
    }

    /// True for [`Reply::Error`]; used by the dispatcher to route into the
    /// transaction-error accumulator.
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Convenience constructor for a bulk reply that renders empty bytes as
    /// a bulk reply rather than forcing the caller through [`Reply::Bulk`]
    /// directly.
    pub fn bulk(data: impl Into<Bytes>) -> Reply {
        Reply::Bulk(data.into())
    }

    /// Convenience constructor for a status reply.
    pub fn status(s: impl Into<Bytes>) -> Reply {
        Reply::Status(s.into())
    }

    /// Convenience constructor for a multi-bulk reply from owned args.
    pub fn multi_bulk(args: Vec<Bytes>) -> Reply {
        Reply::MultiBulk(args)
    }
}

fn simple_line(tag: u8, body: &Bytes) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + body.len());
    buf.put_u8(tag);
    buf.extend_from_slice(body);
    buf.extend_from_slice(CRLF);
    buf.freeze()
}

fn serialize_bulk(b: &Bytes) -> Bytes {
    if b.is_empty() {
        return Bytes::from_static(NULL_BULK);
    }
    let mut buf = BytesMut::with_capacity(1 + 20 + 2 + b.len() + 2);
    buf.put_u8(b'$');
    buf.extend_from_slice(b.len().to_string().as_bytes());
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(b);
    buf.extend_from_slice(CRLF);
    buf.freeze()
}

fn serialize_multi_bulk(args: &[Bytes]) -> Bytes {
    if args.is_empty() {
        return Bytes::from_static(EMPTY_MULTI_BULK);
    }
    let mut buf = BytesMut::new();
    buf.put_u8(b'*');
    buf.extend_from_slice(args.len().to_string().as_bytes());
    buf.extend_from_slice(CRLF);
    for arg in args {
        buf.extend_from_slice(&serialize_bulk(arg));
    }
    buf.freeze()
}

fn serialize_multi_raw(replies: &[Reply]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'*');
    buf.extend_from_slice(replies.len().to_string().as_bytes());
    buf.extend_from_slice(CRLF);
    for reply in replies {
        buf.extend_from_slice(&reply.serialize());
    }
    buf.freeze()
}

/// Typed error replies, per the error catalogue in spec.md §4.1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorReply {
    /// `-ERR %s\r\n`.
    Standard(Bytes),
    /// Writes `-<status>\r\n` verbatim, with no `ERR` prefix injected.
    Normal(Bytes),
    /// `-ERR syntax error\r\n`.
    Syntax,
    /// `-WRONGTYPE Operation against a key holding the wrong kind of value\r\n`.
    WrongType,
    /// `-ERR Protocol error: '%s'\r\n`.
    Protocol(Bytes),
    /// `-ERR wrong number of arguments for '%s' command\r\n`.
    ArgCount(Bytes),
    /// `-ERR unknown command '%s'\r\n`.
    UnknownCommand(Bytes),
    /// `-ERR value is not an integer or out of range\r\n`.
    IntegerOutOfRange,
    /// `-ERR no such key\r\n`.
    NoSuchKey,
    /// `-ERR value is not a valid float\r\n`.
    NotValidFloat,
    /// `-Err unknown\r\n`.
    Unknown,
}

impl ErrorReply {
    pub fn serialize(&self) -> Bytes {
        match self {
            ErrorReply::Standard(s) => Bytes::from(format!("-ERR {}\r\n", to_str(s))),
            ErrorReply::Normal(s) => Bytes::from(format!("-{}\r\n", to_str(s))),
            ErrorReply::Syntax => Bytes::from_static(b"-ERR syntax error\r\n"),
            ErrorReply::WrongType => Bytes::from_static(
                b"-WRONGTYPE Operation against a key holding the wrong kind of value\r\n",
            ),
            ErrorReply::Protocol(s) => Bytes::from(format!("-ERR Protocol error: '{}'\r\n", to_str(s))),
            ErrorReply::ArgCount(cmd) => Bytes::from(format!(
                "-ERR wrong number of arguments for '{}' command\r\n",
                to_str(cmd)
            )),
            ErrorReply::UnknownCommand(cmd) => {
                Bytes::from(format!("-ERR unknown command '{}'\r\n", to_str(cmd)))
            }
            ErrorReply::IntegerOutOfRange => {
                Bytes::from_static(b"-ERR value is not an integer or out of range\r\n")
            }
            ErrorReply::NoSuchKey => Bytes::from_static(b"-ERR no such key\r\n"),
            ErrorReply::NotValidFloat => Bytes::from_static(b"-ERR value is not a valid float\r\n"),
            ErrorReply::Unknown => Bytes::from_static(b"-Err unknown\r\n"),
        }
    }

    /// The error text with the leading `-` and trailing CRLF stripped.
    ///
    /// Follows `original_source`'s `bytes2Error`: trims any of `-`, `\r`,
    /// `\n` from both ends, rather than assuming a fixed prefix/suffix
    /// length.
    pub fn message(&self) -> String {
        let bytes = self.serialize();
        let trimmed = trim_dashes_and_crlf(&bytes);
        String::from_utf8_lossy(trimmed).into_owned()
    }
}

fn trim_dashes_and_crlf(b: &[u8]) -> &[u8] {
    fn is_cut(c: u8) -> bool {
        c == b'-' || c == b'\r' || c == b'\n'
    }
    let mut start = 0;
    while start < b.len() && is_cut(b[start]) {
        start += 1;
    }
    let mut end = b.len();
    while end > start && is_cut(b[end - 1]) {
        end -= 1;
    }
    &b[start..end]
}

fn to_str(b: &Bytes) -> std::borrow::Cow<'_, str> {
    String::from_utf8_lossy(b)
}

impl fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for ErrorReply {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes() {
        assert_eq!(Reply::status("OK").serialize(), Bytes::from_static(b"+OK\r\n"));
    }

    #[test]
    fn integer_serializes() {
        assert_eq!(Reply::Integer(1000).serialize(), Bytes::from_static(b":1000\r\n"));
        assert_eq!(Reply::Integer(-7).serialize(), Bytes::from_static(b":-7\r\n"));
    }

    #[test]
    fn empty_bulk_is_null_bulk_token() {
        assert_eq!(
            Reply::bulk(Bytes::new()).serialize(),
            Bytes::from_static(b"$-1\r\n")
        );
        assert_eq!(Reply::NullBulk.serialize(), Bytes::from_static(b"$-1\r\n"));
    }

    #[test]
    fn nonempty_bulk_serializes() {
        assert_eq!(
            Reply::bulk(Bytes::from_static(b"hello")).serialize(),
            Bytes::from_static(b"$5\r\nhello\r\n")
        );
    }

    #[test]
    fn empty_multi_bulk_is_star_zero() {
        assert_eq!(Reply::multi_bulk(vec![]).serialize(), Bytes::from_static(b"*0\r\n"));
    }

    #[test]
    fn multi_bulk_with_null_element() {
        let args = vec![
            Bytes::from_static(b"hello"),
            Bytes::new(),
            Bytes::from_static(b"world"),
        ];
        assert_eq!(
            Reply::multi_bulk(args).serialize(),
            Bytes::from_static(b"*3\r\n$5\r\nhello\r\n$-1\r\n$5\r\nworld\r\n")
        );
    }

    #[test]
    fn multi_raw_serializes_children_verbatim() {
        let replies = vec![Reply::Ok, Reply::Integer(2), Reply::status("hi")];
        assert_eq!(
            Reply::MultiRaw(replies).serialize(),
            Bytes::from_static(b"*3\r\n+OK\r\n:2\r\n+hi\r\n")
        );
    }

    #[test]
    fn singletons() {
        assert_eq!(Reply::Pong.serialize(), Bytes::from_static(b"+PONG\r\n"));
        assert_eq!(Reply::Ok.serialize(), Bytes::from_static(b"+OK\r\n"));
        assert_eq!(Reply::Queued.serialize(), Bytes::from_static(b"+QUEUED\r\n"));
        assert_eq!(Reply::NoReply.serialize(), Bytes::new());
    }

    #[test]
    fn error_catalogue() {
        assert_eq!(
            ErrorReply::Standard(Bytes::from_static(b"boom")).serialize(),
            Bytes::from_static(b"-ERR boom\r\n")
        );
        assert_eq!(
            ErrorReply::Normal(Bytes::from_static(b"boom")).serialize(),
            Bytes::from_static(b"-boom\r\n")
        );
        assert_eq!(
            ErrorReply::ArgCount(Bytes::from_static(b"SET")).serialize(),
            Bytes::from_static(b"-ERR wrong number of arguments for 'SET' command\r\n")
        );
        assert_eq!(
            ErrorReply::UnknownCommand(Bytes::from_static(b"FOO")).serialize(),
            Bytes::from_static(b"-ERR unknown command 'FOO'\r\n")
        );
        assert_eq!(
            ErrorReply::Protocol(Bytes::from_static(b"bad")).serialize(),
            Bytes::from_static(b"-ERR Protocol error: 'bad'\r\n")
        );
        assert_eq!(ErrorReply::Syntax.serialize(), Bytes::from_static(b"-ERR syntax error\r\n"));
        assert_eq!(
            ErrorReply::WrongType.serialize(),
            Bytes::from_static(b"-WRONGTYPE Operation against a key holding the wrong kind of value\r\n")
        );
        assert_eq!(
            ErrorReply::IntegerOutOfRange.serialize(),
            Bytes::from_static(b"-ERR value is not an integer or out of range\r\n")
        );
        assert_eq!(ErrorReply::NoSuchKey.serialize(), Bytes::from_static(b"-ERR no such key\r\n"));
        assert_eq!(
            ErrorReply::NotValidFloat.serialize(),
            Bytes::from_static(b"-ERR value is not a valid float\r\n")
        );
        assert_eq!(ErrorReply::Unknown.serialize(), Bytes::from_static(b"-Err unknown\r\n"));
    }

    #[test]
    fn message_strips_prefix_and_terminator() {
        let e = ErrorReply::Standard(Bytes::from_static(b"boom"));
        assert_eq!(e.message(), "ERR boom");
        let e = ErrorReply::Syntax;
        assert_eq!(e.message(), "ERR syntax error");
    }

    #[test]
    fn is_error_discriminates() {
        assert!(Reply::Error(ErrorReply::Syntax).is_error());
        assert!(!Reply::Ok.is_error());
        assert!(!Reply::Integer(0).is_error());
    }

    /// Invariant 8.6: for any bulk `b`, empty serializes to the null-bulk
    /// token; non-empty serializes with its exact length prefix.
    #[test]
    fn invariant_bulk_length_prefix() {
        for n in [1usize, 2, 10, 255, 1000] {
            let data = Bytes::from(vec![b'x'; n]);
            let serialized = Reply::bulk(data.clone()).serialize();
            let expected = Bytes::from(format!("${n}\r\n{}\r\n", String::from_utf8(data.to_vec()).unwrap()));
            assert_eq!(serialized, expected);
        }
    }

    /// Invariant 8.5: for all `arg_count >= 0`, serializing a multi-bulk of
    /// that many args starts with `*<arg_count>\r\n`.
    #[test]
    fn invariant_multi_bulk_header() {
        for n in 0usize..8 {
            let args: Vec<Bytes> = (0..n).map(|i| Bytes::from(format!("a{i}"))).collect();
            let serialized = Reply::multi_bulk(args).serialize();
            let expected_header = format!("*{n}\r\n");
            assert!(serialized.starts_with(expected_header.as_bytes()));
        }
    }
}
