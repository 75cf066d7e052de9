//! # Engine Contract (C5)
//!
//! The interface the dispatcher (C4) requires of a keyspace: multi-DB
//! execution, striped locking, undo-log generation for `exec_multi`
//! rollback, and snapshot iteration.
//!
//! Grounded on `original_source/interface/db/db.go`'s `Database`/`DBEngine`
//! interfaces (`Exec`, `ExecWithLock`, `ExecMulti`, `GetUndoLogs`, `ForEach`,
//! `RWLocks`/`RWUnLocks`, `GetDBSize`, `GetEntity`, `GetExpiration`,
//! `AfterClientClose`, `Close`) and `DataEntity`/`CmdLine`/`Params`.

use crate::connection::{CmdLine, ConnContext};
use crate::resp::reply::Reply;
use bytes::Bytes;
use std::time::SystemTime;

/// A snapshot iteration callback: `(key, value, expiration) -> continue?`.
/// Returning `false` stops [`Engine::for_each`] early.
pub type ForEachFn<'a> = dyn FnMut(&Bytes, &Bytes, Option<SystemTime>) -> bool + 'a;

/// Marker trait implemented by every lock guard [`Engine::rw_lock`]
/// returns. Carries no methods; its only role is giving `Box<dyn Locked>`
/// a single, dyn-safe return type while still running the concrete guard's
/// destructor (and therefore releasing the underlying lock) on drop.
pub trait Locked {}

impl<T> Locked for T {}

/// The keyspace contract a dispatcher drives. Implementors own whatever
/// locking and storage strategy they like; the dispatcher only ever calls
/// through this interface.
pub trait Engine: Send + Sync {
    /// Executes one command line under the engine's own locking.
    fn exec(&self, conn: &mut dyn ConnContext, cmd_line: &CmdLine) -> Reply;

    /// Executes one command line assuming the caller already holds the
    /// necessary locks (used internally by `exec_multi`).
    fn exec_without_lock(&self, conn: &mut dyn ConnContext, cmd_line: &CmdLine) -> Reply;

    /// Atomically executes all queued command lines. Honors
    /// `conn.watching()` versions: if any watched key changed, returns
    /// [`Reply::NullBulk`] and executes nothing. On success returns
    /// [`Reply::MultiRaw`] whose i-th element is the i-th command's reply.
    fn exec_multi(&self, conn: &mut dyn ConnContext, cmd_lines: &[CmdLine]) -> Reply;

    /// Inverse command lines for rolling back `cmd_line`, for `exec_multi`
    /// failure recovery.
    fn undo_logs(&self, db_index: usize, cmd_line: &CmdLine) -> Vec<CmdLine>;

    /// Iterates a snapshot of one database, stopping early if `callback`
    /// returns `false`.
    fn for_each(&self, db_index: usize, callback: &mut ForEachFn<'_>);

    /// Acquires striped locks for `write_keys` and `read_keys`, in
    /// canonical (sorted-by-shard) order to avoid deadlock across
    /// concurrent multi-key commands, and returns a guard holding them.
    ///
    /// The original contract names this and [`Engine::rw_unlock`] as two
    /// separate calls bracketing a critical section. Rust's ownership model
    /// makes a borrowed lock token that outlives the call that produced it
    /// awkward to hand across a `dyn Engine` boundary safely; returning an
    /// RAII guard expresses the same acquire/release pairing while making
    /// "forgot to unlock" and "unlocked twice" unrepresentable. `rw_unlock`
    /// is kept as an explicit early-release for callers that want one.
    fn rw_lock<'a>(
        &'a self,
        db_index: usize,
        write_keys: &[Bytes],
        read_keys: &[Bytes],
    ) -> Box<dyn Locked + 'a>;

    /// Explicitly releases a guard returned by [`Engine::rw_lock`] before it
    /// would otherwise go out of scope.
    fn rw_unlock(&self, guard: Box<dyn Locked + '_>) {
        drop(guard);
    }

    /// `(key_count, keys_with_ttl_count)` for one database.
    fn db_size(&self, db_index: usize) -> (usize, usize);

    fn get_entity(&self, db_index: usize, key: &Bytes) -> Option<Bytes>;

    fn get_expiration(&self, db_index: usize, key: &Bytes) -> Option<SystemTime>;

    /// Reports whether `name` names a command this engine implements.
    ///
    /// Not part of the original Go `Database`/`DBEngine` interfaces, which
    /// leave command-table lookups inside the (out-of-scope) command
    /// handlers. The dispatcher's Multi-state handling needs to tell a
    /// genuinely unknown command from a known one before it can decide
    /// whether to record an unknown-command transaction error, so that
    /// check is exposed here instead (see DESIGN.md).
    fn is_known_command(&self, name: &[u8]) -> bool;

    /// Drops watches and any connection-scoped engine state. Invoked by the
    /// dispatcher exactly once per connection, after its parser loop exits.
    fn after_client_close(&self, conn: &mut dyn ConnContext);

    /// Unblocks any in-flight operations and releases engine-wide
    /// resources. Called on server shutdown.
    fn close(&self);
}
