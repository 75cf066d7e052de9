//! # Server Shell (component S, SPEC_FULL §2)
//!
//! A thin TCP accept loop: bounded by a connection-count semaphore, spawning
//! one task per accepted socket. Everything interesting — decoding,
//! dispatch, the keyspace — lives in [`crate::resp`], [`crate::connection`],
//! [`crate::dispatch`] and [`crate::engine`]; this module only wires them
//! together, the way spec.md §1 treats "the TCP accept loop and
//! per-connection goroutine/task scheduler" as a thin external collaborator.
//!
//! Grounded on the teacher's `src/server.rs` for the accept-loop/semaphore
//! shape (`acquire_socket_permit`, `CONNECTION_PERMIT_TIMEOUT_MS`), adapted
//! to drive [`crate::dispatch::dispatch`] over a [`crate::resp::FramedReader`]
//! instead of the teacher's fixed-buffer `handle_connection`.

use crate::cli::Args;
use crate::connection::ConnState;
use crate::constants::{ExitCode, CONNECTION_PERMIT_TIMEOUT_MS, LOCAL_SOCKET_ADDR_STR};
use crate::dispatch::{dispatch, notify_client_closed};
use crate::engine::Engine;
use crate::errors::ServerError;
use crate::log_and_stderr;
use crate::resp::FramedReader;
use log::{debug, error, info, trace, warn};
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

/// Redis-compatible protocol server: accepts connections and drives each
/// one's decode/dispatch loop against a shared [`Engine`].
pub struct Server {
    listener: TcpListener,
    max_conn: Arc<Semaphore>,
    engine: Arc<dyn Engine>,
}

impl Server {
    /// Binds the listener and prepares the connection-count semaphore.
    pub async fn new(args: &Args, engine: Arc<dyn Engine>) -> Result<Self, ServerError> {
        let listener =
            TcpListener::bind(format!("{LOCAL_SOCKET_ADDR_STR}:{}", args.port)).await?;
        let addr = listener.local_addr()?;
        log_and_stderr!(info, "Listening on", addr);

        Ok(Self {
            listener,
            max_conn: Arc::new(Semaphore::new(args.max_conn)),
            engine,
        })
    }

    /// Runs the accept loop until the process is interrupted.
    pub async fn start(&self) -> Result<(), ServerError> {
        self.core_loop().await
    }

    /// Accepts connections and spawns a per-connection task for each.
    ///
    /// Supports multiple concurrent clients as well as pipelined requests
    /// from the same connection (each connection's [`FramedReader`] yields
    /// as many frames as the client sends before waiting for replies).
    async fn core_loop(&self) -> Result<(), ServerError> {
        debug!("Starting the core loop...");
        info!("Waiting for connections...");

        loop {
            match self.acquire_socket_permit().await {
                Ok((socket, permit)) => {
                    let engine = Arc::clone(&self.engine);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(socket, engine).await {
                            warn!("connection error: {e}");
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    }

    /// Accepts a socket and waits (with a bounded timeout) for a free
    /// connection-count permit.
    ///
    /// # Errors
    /// - [`ServerError::Io`] if accepting the socket failed.
    /// - [`ServerError::Elapsed`] if no permit became free in time.
    /// - [`ServerError::AcquireError`] if the semaphore was closed.
    async fn acquire_socket_permit(&self) -> Result<(TcpStream, OwnedSemaphorePermit), ServerError> {
        let (socket, _) = self.listener.accept().await?;
        match timeout(
            Duration::from_millis(CONNECTION_PERMIT_TIMEOUT_MS),
            self.max_conn.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => Ok((socket, permit)),
            Ok(Err(_)) => Err(ServerError::AcquireError),
            Err(_) => Err(ServerError::Elapsed(format!(
                "{CONNECTION_PERMIT_TIMEOUT_MS}ms"
            ))),
        }
    }

    /// Installs a Ctrl+C handler that exits the process, mirroring the
    /// teacher's `Self::shutdown`.
    pub fn install_shutdown_handler() {
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("CTRL+C received. Shutting down...");
                    exit(ExitCode::Ok as i32);
                }
                Err(err) => {
                    error!("Unable to listen for the shutdown signal: {err}");
                    error!("Terminating the app ({})...", ExitCode::Shutdown as i32);
                    exit(ExitCode::Shutdown as i32);
                }
            }
        });
    }
}

/// Drives one connection's full lifecycle: decode frames, dispatch each one
/// against `engine`, and notify the engine once the client disconnects
/// (spec.md §4.4 "After client close", §5 "Cancellation and timeouts").
async fn handle_connection(stream: TcpStream, engine: Arc<dyn Engine>) -> Result<(), ServerError> {
    let remote_addr = stream.peer_addr()?.to_string();
    trace!("accepted connection from {remote_addr}");

    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FramedReader::new(read_half);
    let mut conn = ConnState::new(write_half, remote_addr.clone());

    while let Some(frame) = reader.next_frame().await {
        let dispatch_input = match frame {
            Ok(reply) => Ok(reply),
            Err(crate::errors::FrameError::Protocol(e)) => Err(e),
            Err(crate::errors::FrameError::Io(io)) => {
                // Transport errors are never surfaced as replies (spec.md
                // §7); the connection is simply torn down.
                trace!("io error on {remote_addr}: {io}");
                break;
            }
        };
        if let Err(e) = dispatch(&mut conn, engine.as_ref(), dispatch_input).await {
            warn!("write error on {remote_addr}: {e}");
            break;
        }
    }

    conn.close().await;
    notify_client_closed(&mut conn, engine.as_ref());
    trace!("closed connection from {remote_addr}");
    Ok(())
}
