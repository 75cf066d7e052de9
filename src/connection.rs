//! # Connection State (C3)
//!
//! Per-client state: selected DB, password, transaction queue, watch set,
//! transaction errors, and the write path's mutex/in-flight counter.
//!
//! Grounded on `original_source/resp/connection/conn.go`'s `RespConnection`
//! (flag bitset, `queue`/`watching`/`transactionErrors` fields, `Write`'s
//! lock-increment-write-decrement-unlock order, `Close`'s 10s drain wait)
//! and on the teacher's `conn.rs` for the async I/O idiom (`AsyncWriteExt`,
//! `tokio::net::TcpStream`).

use crate::errors::ConnError;
use crate::resp::reply::ErrorReply;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};

/// One decoded command: command name plus arguments, in wire order.
pub type CmdLine = Vec<Bytes>;

const FLAG_SLAVE: u8 = 1 << 0;
const FLAG_MASTER: u8 = 1 << 1;
const FLAG_MULTI: u8 = 1 << 2;

/// How long [`ConnState::close`] waits for in-flight writes to drain.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The subset of connection state the engine contract (C5) and the
/// dispatcher (C4) need, independent of the transport type parameter.
/// Lets `Engine` be object-safe (`&mut dyn ConnContext`) without being
/// generic over every `ConnState<W>` instantiation.
pub trait ConnContext {
    fn db_index(&self) -> usize;
    fn select_db(&mut self, index: usize);
    fn watching(&mut self) -> &mut HashMap<Bytes, u32>;
    fn clear_watching(&mut self);
    fn remote_addr(&self) -> &str;
}

impl<W> ConnContext for ConnState<W> {
    fn db_index(&self) -> usize {
        self.selected_db
    }

    fn select_db(&mut self, index: usize) {
        self.selected_db = index;
    }

    fn watching(&mut self) -> &mut HashMap<Bytes, u32> {
        self.watching.get_or_insert_with(HashMap::new)
    }

    fn clear_watching(&mut self) {
        self.watching = None;
    }

    fn remote_addr(&self) -> &str {
        &self.remote_addr
    }
}

/// Per-client connection state.
///
/// Exclusively owned by its connection's task: every field except the
/// writer half is touched only by the single reader/decode loop driving
/// this connection, so no internal synchronization is needed for them. The
/// writer half is split out into [`WriteHalf`] because spec.md §4.3
/// requires `write`'s mutex to guard the full duration of one reply's
/// byte-emission even if a future caller writes from a second task (e.g. a
/// server-initiated push).
pub struct ConnState<W> {
    selected_db: usize,
    password: String,
    flags: u8,
    queue: Vec<CmdLine>,
    watching: Option<HashMap<Bytes, u32>>,
    tx_errors: Vec<ErrorReply>,
    remote_addr: String,
    writer: WriteHalf<W>,
}

impl<W: AsyncWrite + Unpin> ConnState<W> {
    pub fn new(writer: W, remote_addr: String) -> Self {
        Self {
            selected_db: 0,
            password: String::new(),
            flags: 0,
            queue: Vec::new(),
            watching: None,
            tx_errors: Vec::new(),
            remote_addr,
            writer: WriteHalf::new(writer),
        }
    }

    pub fn db_index(&self) -> usize {
        self.selected_db
    }

    pub fn select_db(&mut self, index: usize) {
        self.selected_db = index;
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn set_password(&mut self, password: String) {
        self.password = password;
    }

    pub fn in_multi(&self) -> bool {
        self.flags & FLAG_MULTI != 0
    }

    /// Setting to `false` clears `watching` and `queue` as well as the
    /// Multi flag; setting to `true` only sets the flag (spec.md §4.3).
    pub fn set_multi(&mut self, state: bool) {
        if !state {
            self.watching = None;
            self.queue.clear();
            self.flags &= !FLAG_MULTI;
            return;
        }
        self.flags |= FLAG_MULTI;
    }

    pub fn is_slave(&self) -> bool {
        self.flags & FLAG_SLAVE != 0
    }

    pub fn set_slave(&mut self, slave: bool) {
        if slave {
            self.flags |= FLAG_SLAVE;
        } else {
            self.flags &= !FLAG_SLAVE;
        }
    }

    pub fn is_master(&self) -> bool {
        self.flags & FLAG_MASTER != 0
    }

    pub fn set_master(&mut self, master: bool) {
        if master {
            self.flags |= FLAG_MASTER;
        } else {
            self.flags &= !FLAG_MASTER;
        }
    }

    pub fn enqueue(&mut self, cmd_line: CmdLine) {
        self.queue.push(cmd_line);
    }

    pub fn queued(&self) -> &[CmdLine] {
        &self.queue
    }

    pub fn clear_queue(&mut self) {
        self.queue.clear();
    }

    /// Watch set, lazily allocated on first access.
    pub fn watching(&mut self) -> &mut HashMap<Bytes, u32> {
        self.watching.get_or_insert_with(HashMap::new)
    }

    pub fn clear_watching(&mut self) {
        self.watching = None;
    }

    pub fn add_tx_error(&mut self, err: ErrorReply) {
        self.tx_errors.push(err);
    }

    pub fn tx_errors(&self) -> &[ErrorReply] {
        &self.tx_errors
    }

    pub fn clear_tx_errors(&mut self) {
        self.tx_errors.clear();
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Writes `bytes` to the connection. A zero-length input returns `(0,
    /// Ok)` without touching the socket.
    pub async fn write(&self, bytes: &[u8]) -> Result<usize, ConnError> {
        self.writer.write(bytes).await
    }

    /// Waits up to 10s for in-flight writes to drain, then closes the
    /// transport. Transport-close errors are suppressed (spec.md §4.3).
    pub async fn close(&self) {
        self.writer.close().await;
    }
}

/// The write side of a connection: a mutex-guarded transport plus an
/// in-flight write counter supporting [`ConnState::close`]'s bounded drain.
struct WriteHalf<W> {
    inner: Arc<Mutex<W>>,
    in_flight: Arc<AtomicI64>,
    drained: Arc<Notify>,
}

impl<W> Clone for WriteHalf<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            in_flight: Arc::clone(&self.in_flight),
            drained: Arc::clone(&self.drained),
        }
    }
}

impl<W: AsyncWrite + Unpin> WriteHalf<W> {
    fn new(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
            in_flight: Arc::new(AtomicI64::new(0)),
            drained: Arc::new(Notify::new()),
        }
    }

    async fn write(&self, bytes: &[u8]) -> Result<usize, ConnError> {
        if bytes.is_empty() {
            return Ok(0);
        }

        let mut guard = self.inner.lock().await;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = guard.write_all(bytes).await;
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
        result.map_err(ConnError::from)?;
        Ok(bytes.len())
    }

    async fn close(&self) {
        let deadline = tokio::time::Instant::now() + CLOSE_DRAIN_TIMEOUT;
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            let _ = tokio::time::timeout_at(deadline, self.drained.notified()).await;
        }
        let mut guard = self.inner.lock().await;
        let _ = guard.shutdown().await;
    }
}
