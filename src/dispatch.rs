//! # Command Dispatcher (C4)
//!
//! Routes one decoded frame to an engine operation, honoring the
//! Multi/EXEC/DISCARD/WATCH transaction state machine, then serializes and
//! writes the reply through the connection.
//!
//! Grounded on `original_source/resp/connection/conn.go`'s transaction
//! fields and `interface/resp/conn.go`'s `Connection` interface for what the
//! dispatcher is allowed to ask of a connection; the transaction state
//! machine itself follows the Multi/EXEC/DISCARD/WATCH contract laid out
//! directly in the specification this crate implements.

use crate::connection::{CmdLine, ConnState};
use crate::engine::Engine;
use crate::errors::{ConnError, RespError};
use crate::resp::reply::{ErrorReply, Reply};
use bytes::Bytes;
use tokio::io::AsyncWrite;

/// One decoded unit fed to [`dispatch`]: either a successfully parsed reply
/// or a protocol error from the frame that produced it.
pub type DispatchInput = Result<Reply, RespError>;

/// Dispatches one frame against `engine` on behalf of `conn`, then writes
/// the resulting reply (unless it is [`Reply::NoReply`]).
pub async fn dispatch<W: AsyncWrite + Unpin>(
    conn: &mut ConnState<W>,
    engine: &dyn Engine,
    frame: DispatchInput,
) -> Result<(), ConnError> {
    let reply = match frame {
        Err(e) => {
            let err = Reply::Error(ErrorReply::Protocol(Bytes::from(e.to_string())));
            return write_reply(conn, &err).await;
        }
        Ok(r) => r,
    };

    // Only a MultiBulk carrying [cmd, arg1, ..., argN] is a command
    // request; anything else (a status/integer/error sent by a client) is
    // outside the server contract and is silently ignored.
    let cmd_line = match reply {
        Reply::MultiBulk(args) => args,
        _ => return Ok(()),
    };

    if cmd_line.is_empty() {
        return Ok(());
    }

    let out = run(conn, engine, cmd_line);
    if !matches!(out, Reply::NoReply) {
        write_reply(conn, &out).await?;
    }
    Ok(())
}

fn run<W: AsyncWrite + Unpin>(conn: &mut ConnState<W>, engine: &dyn Engine, cmd_line: CmdLine) -> Reply {
    let name = ascii_upper(&cmd_line[0]);

    if conn.in_multi() {
        return run_in_multi(conn, engine, &name, cmd_line);
    }

    if name.as_slice() == b"MULTI" {
        conn.set_multi(true);
        conn.clear_tx_errors();
        return Reply::Ok;
    }

    engine.exec(conn, &cmd_line)
}

fn run_in_multi<W: AsyncWrite + Unpin>(
    conn: &mut ConnState<W>,
    engine: &dyn Engine,
    name: &[u8],
    cmd_line: CmdLine,
) -> Reply {
    match name {
        b"EXEC" => {
            let reply = if !conn.tx_errors().is_empty() {
                Reply::Error(ErrorReply::Normal(Bytes::from_static(
                    b"EXECABORT Transaction discarded because of previous errors.",
                )))
            } else {
                let queued = conn.queued().to_vec();
                engine.exec_multi(conn, &queued)
            };
            conn.set_multi(false);
            reply
        }
        b"DISCARD" => {
            conn.set_multi(false);
            Reply::Ok
        }
        b"MULTI" => Reply::Error(ErrorReply::Standard(Bytes::from_static(
            b"MULTI calls can not be nested",
        ))),
        b"WATCH" => {
            if !conn.queued().is_empty() {
                Reply::Error(ErrorReply::Standard(Bytes::from_static(
                    b"WATCH inside MULTI is not allowed",
                )))
            } else {
                engine.exec_without_lock(conn, &cmd_line)
            }
        }
        _ => {
            if !engine.is_known_command(name) {
                conn.add_tx_error(ErrorReply::UnknownCommand(Bytes::copy_from_slice(
                    &cmd_line[0],
                )));
            }
            conn.enqueue(cmd_line);
            Reply::Queued
        }
    }
}

async fn write_reply<W: AsyncWrite + Unpin>(
    conn: &mut ConnState<W>,
    reply: &Reply,
) -> Result<(), ConnError> {
    let bytes = reply.serialize();
    conn.write(&bytes).await?;
    Ok(())
}

fn ascii_upper(name: &[u8]) -> Vec<u8> {
    name.iter().map(u8::to_ascii_uppercase).collect()
}

/// Invokes `engine.after_client_close(conn)` exactly once; callers run this
/// after the connection's parser loop exits, regardless of why it exited.
pub fn notify_client_closed<W>(conn: &mut ConnState<W>, engine: &dyn Engine) {
    engine.after_client_close(conn);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnContext;
    use std::sync::Mutex;
    use std::time::SystemTime;
    use tokio::io::duplex;

    /// A fake engine recording calls and returning canned replies, enough
    /// to exercise the dispatcher's state machine without a real keyspace.
    struct FakeEngine {
        known: Vec<&'static [u8]>,
        exec_multi_calls: Mutex<Vec<Vec<CmdLine>>>,
    }

    impl FakeEngine {
        fn new() -> Self {
            Self {
                known: vec![b"PING", b"SET", b"GET", b"WATCH"],
                exec_multi_calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl Engine for FakeEngine {
        fn exec(&self, _conn: &mut dyn ConnContext, cmd_line: &CmdLine) -> Reply {
            if cmd_line[0].eq_ignore_ascii_case(b"PING") {
                Reply::Pong
            } else {
                Reply::Ok
            }
        }

        fn exec_without_lock(&self, conn: &mut dyn ConnContext, cmd_line: &CmdLine) -> Reply {
            if cmd_line[0].eq_ignore_ascii_case(b"WATCH") {
                for key in &cmd_line[1..] {
                    conn.watching().insert(key.clone(), 0);
                }
                return Reply::Ok;
            }
            Reply::Ok
        }

        fn exec_multi(&self, _conn: &mut dyn ConnContext, cmd_lines: &[CmdLine]) -> Reply {
            self.exec_multi_calls.lock().unwrap().push(cmd_lines.to_vec());
            Reply::MultiRaw(cmd_lines.iter().map(|_| Reply::Ok).collect())
        }

        fn undo_logs(&self, _db_index: usize, _cmd_line: &CmdLine) -> Vec<CmdLine> {
            Vec::new()
        }

        fn for_each(&self, _db_index: usize, _callback: &mut crate::engine::ForEachFn<'_>) {}

        fn rw_lock<'a>(
            &'a self,
            _db_index: usize,
            _write_keys: &[Bytes],
            _read_keys: &[Bytes],
        ) -> Box<dyn crate::engine::Locked + 'a> {
            Box::new(())
        }

        fn db_size(&self, _db_index: usize) -> (usize, usize) {
            (0, 0)
        }

        fn get_entity(&self, _db_index: usize, _key: &Bytes) -> Option<Bytes> {
            None
        }

        fn get_expiration(&self, _db_index: usize, _key: &Bytes) -> Option<SystemTime> {
            None
        }

        fn is_known_command(&self, name: &[u8]) -> bool {
            self.known.iter().any(|k| k.eq_ignore_ascii_case(name))
        }

        fn after_client_close(&self, _conn: &mut dyn ConnContext) {}

        fn close(&self) {}
    }

    fn bulk(s: &[u8]) -> Bytes {
        Bytes::copy_from_slice(s)
    }

    fn cmd(parts: &[&[u8]]) -> CmdLine {
        parts.iter().map(|p| bulk(p)).collect()
    }

    async fn read_some(b: &mut tokio::io::DuplexStream) -> Vec<u8> {
        let mut buf = [0u8; 256];
        let n = tokio::io::AsyncReadExt::read(b, &mut buf).await.unwrap();
        buf[..n].to_vec()
    }

    #[tokio::test]
    async fn ping_outside_multi_goes_to_engine() {
        let (a, mut b) = duplex(4096);
        let mut conn = ConnState::new(a, "addr".into());
        let engine = FakeEngine::new();
        dispatch(&mut conn, &engine, Ok(Reply::MultiBulk(cmd(&[b"PING"]))))
            .await
            .unwrap();
        assert_eq!(read_some(&mut b).await, b"+PONG\r\n");
    }

    /// Scenario S7: MULTI, SET k v, EXEC -> +OK\r\n +QUEUED\r\n *1\r\n+OK\r\n
    #[tokio::test]
    async fn s7_multi_queue_exec() {
        let (a, mut b) = duplex(4096);
        let mut conn = ConnState::new(a, "addr".into());
        let engine = FakeEngine::new();

        dispatch(&mut conn, &engine, Ok(Reply::MultiBulk(cmd(&[b"MULTI"]))))
            .await
            .unwrap();
        assert_eq!(read_some(&mut b).await, b"+OK\r\n");
        assert!(conn.in_multi());

        dispatch(
            &mut conn,
            &engine,
            Ok(Reply::MultiBulk(cmd(&[b"SET", b"k", b"v"]))),
        )
        .await
        .unwrap();
        assert_eq!(read_some(&mut b).await, b"+QUEUED\r\n");
        assert_eq!(conn.queued().len(), 1);

        dispatch(&mut conn, &engine, Ok(Reply::MultiBulk(cmd(&[b"EXEC"]))))
            .await
            .unwrap();
        assert_eq!(read_some(&mut b).await, b"*1\r\n+OK\r\n");
        assert!(!conn.in_multi());
        assert_eq!(engine.exec_multi_calls.lock().unwrap().len(), 1);
    }

    /// Scenario S8: WATCH during Multi with a non-empty queue is rejected.
    #[tokio::test]
    async fn s8_watch_inside_multi_with_queue_is_rejected() {
        let (a, mut b) = duplex(4096);
        let mut conn = ConnState::new(a, "addr".into());
        let engine = FakeEngine::new();

        dispatch(&mut conn, &engine, Ok(Reply::MultiBulk(cmd(&[b"MULTI"]))))
            .await
            .unwrap();
        read_some(&mut b).await;
        dispatch(&mut conn, &engine, Ok(Reply::MultiBulk(cmd(&[b"SET", b"k", b"v"]))))
            .await
            .unwrap();
        read_some(&mut b).await;

        dispatch(&mut conn, &engine, Ok(Reply::MultiBulk(cmd(&[b"WATCH", b"k"]))))
            .await
            .unwrap();
        let out = read_some(&mut b).await;
        assert_eq!(&out, b"-ERR WATCH inside MULTI is not allowed\r\n");
    }

    #[tokio::test]
    async fn multi_nested_is_rejected() {
        let (a, mut b) = duplex(4096);
        let mut conn = ConnState::new(a, "addr".into());
        let engine = FakeEngine::new();

        dispatch(&mut conn, &engine, Ok(Reply::MultiBulk(cmd(&[b"MULTI"]))))
            .await
            .unwrap();
        read_some(&mut b).await;

        dispatch(&mut conn, &engine, Ok(Reply::MultiBulk(cmd(&[b"MULTI"]))))
            .await
            .unwrap();
        let out = read_some(&mut b).await;
        assert_eq!(&out, b"-ERR MULTI calls can not be nested\r\n");
    }

    #[tokio::test]
    async fn unknown_command_in_multi_sets_sticky_abort() {
        let (a, mut b) = duplex(4096);
        let mut conn = ConnState::new(a, "addr".into());
        let engine = FakeEngine::new();

        dispatch(&mut conn, &engine, Ok(Reply::MultiBulk(cmd(&[b"MULTI"]))))
            .await
            .unwrap();
        read_some(&mut b).await;

        dispatch(&mut conn, &engine, Ok(Reply::MultiBulk(cmd(&[b"BOGUS"]))))
            .await
            .unwrap();
        read_some(&mut b).await; // still enqueued, still +QUEUED\r\n
        assert_eq!(conn.tx_errors().len(), 1);
        assert_eq!(conn.queued().len(), 1);

        dispatch(&mut conn, &engine, Ok(Reply::MultiBulk(cmd(&[b"EXEC"]))))
            .await
            .unwrap();
        let out = read_some(&mut b).await;
        assert_eq!(
            &out,
            b"-EXECABORT Transaction discarded because of previous errors.\r\n"
        );
        assert!(engine.exec_multi_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn discard_clears_multi_state() {
        let (a, mut b) = duplex(4096);
        let mut conn = ConnState::new(a, "addr".into());
        let engine = FakeEngine::new();

        dispatch(&mut conn, &engine, Ok(Reply::MultiBulk(cmd(&[b"MULTI"]))))
            .await
            .unwrap();
        read_some(&mut b).await;
        dispatch(&mut conn, &engine, Ok(Reply::MultiBulk(cmd(&[b"SET", b"k", b"v"]))))
            .await
            .unwrap();
        read_some(&mut b).await;

        dispatch(&mut conn, &engine, Ok(Reply::MultiBulk(cmd(&[b"DISCARD"]))))
            .await
            .unwrap();
        assert_eq!(read_some(&mut b).await, b"+OK\r\n");
        assert!(!conn.in_multi());
        assert!(conn.queued().is_empty());
    }

    #[tokio::test]
    async fn protocol_error_frame_is_translated_to_error_reply() {
        let (a, mut b) = duplex(4096);
        let mut conn = ConnState::new(a, "addr".into());
        let engine = FakeEngine::new();

        dispatch(&mut conn, &engine, Err(RespError::CrlfNotAtEnd))
            .await
            .unwrap();
        let out = read_some(&mut b).await;
        assert!(out.starts_with(b"-ERR Protocol error: '"));
        assert!(String::from_utf8_lossy(&out).contains("CRLF"));
    }

    #[tokio::test]
    async fn non_multi_bulk_reply_is_ignored() {
        let (a, _b) = duplex(4096);
        let mut conn = ConnState::new(a, "addr".into());
        let engine = FakeEngine::new();
        dispatch(&mut conn, &engine, Ok(Reply::status("OK"))).await.unwrap();
    }
}
