//! The event loop: owns the single [`Engine`], multiplexes the listener,
//! per-connection request channels, the scheduler's next wake-up, and the
//! shutdown/drain signals.
//!
//! Every connection is its own `tokio::spawn`ed task, but that task only
//! parses/encodes bytes — it forwards fully-decoded requests to this
//! module's owning task over an mpsc channel and waits for a reply on a
//! channel of its own. All `Engine`/`Wal` mutation happens on the single
//! task running [`Server::run`], so there is never a lock to take.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use bytes::Bytes;
use futures::SinkExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Level};

use crate::config::Config;
use crate::engine::{Engine, JobKind, Outcome, Request};
use crate::types::job::ConnId;
use crate::wal::{Falloc, Wal};
use crate::wire::protocol::{Command, Response};
use crate::wire::{self, decoder, events::BeanstalkClientEvent};

#[derive(Debug, Error)]
pub enum OpenError {
    #[error(transparent)]
    Wal(#[from] crate::wal::Error),
    #[error("failed to bind listener: {0}")]
    Bind(io::Error),
}

/// Sent by a connection task to the owning server task.
enum ToServer {
    /// First message a connection task sends: hands over the sender half of
    /// its reply channel and gets back the [`ConnId`] the engine assigned.
    Register { reply_tx: mpsc::Sender<ToConn>, assign: oneshot::Sender<ConnId> },
    Request { conn: ConnId, req: Request },
    Closed { conn: ConnId },
}

/// Sent by the owning server task to a connection task, to be written out in
/// the order it was produced — this is what keeps replies strictly ordered
/// per connection even when a `reserve` resolves later, from `tick`, rather
/// than immediately.
enum ToConn {
    Outcome(Outcome),
}

pub struct Server {
    engine: Engine,
    reply_tx: HashMap<ConnId, mpsc::Sender<ToConn>>,
    wal: Option<PathBuf>,
}

impl Server {
    /// Opens the WAL (if configured) and binds the listener. Kept as one
    /// fallible step so `main` can map failures to the documented exit
    /// codes without threading partial state around.
    pub async fn open(config: &Config) -> Result<(Self, TcpListener), OpenError> {
        let now = Instant::now();

        let (wal, recovered) = match &config.wal_dir {
            Some(dir) => {
                let falloc = Falloc::real();
                let (wal, recovered) =
                    Wal::open(dir, config.binlog_segment_size, config.fsync_policy(), falloc)?;
                (Some(wal), recovered)
            },
            None => (None, Vec::new()),
        };

        let engine = Engine::new(config.max_job_size, wal, recovered, now);

        let listener = TcpListener::bind((config.listen, config.port))
            .await
            .map_err(OpenError::Bind)?;

        Ok((
            Server { engine, reply_tx: HashMap::new(), wal: config.wal_dir.clone() },
            listener,
        ))
    }

    /// Runs the event loop until `shutdown` is cancelled or the listener
    /// fails irrecoverably. `drain` stops accepting new connections without
    /// otherwise disturbing the server (the `SIGUSR1` case). Returns once
    /// every connection has been told to close and the WAL (if any) has
    /// been flushed.
    pub async fn run(
        mut self,
        listener: TcpListener,
        shutdown: CancellationToken,
        drain: CancellationToken,
    ) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, wal = ?self.wal, "listening");

        let (to_server_tx, mut to_server_rx) = mpsc::channel::<ToServer>(1024);

        let mut accepting = true;

        loop {
            let wake = self.engine.next_wake();
            let sleep = match wake {
                Some(deadline) => tokio::time::sleep_until(deadline),
                None => tokio::time::sleep(std::time::Duration::from_secs(3600)),
            };
            tokio::pin!(sleep);

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("shutting down: releasing reservations and flushing write-ahead log");
                    break;
                },

                _ = drain.cancelled(), if accepting => {
                    info!("draining: no longer accepting new connections");
                    accepting = false;
                    self.engine.set_draining(true);
                },

                accept = listener.accept(), if accepting => {
                    match accept {
                        Ok((stream, peer)) => {
                            debug!(%peer, "accepted connection");
                            spawn_connection(stream, to_server_tx.clone());
                        },
                        Err(error) => warn!(%error, "failed to accept connection"),
                    }
                },

                msg = to_server_rx.recv() => {
                    let Some(msg) = msg else { break };
                    self.handle(msg, Instant::now()).await;
                },

                () = &mut sleep, if wake.is_some() => {
                    self.tick(Instant::now()).await;
                },
            }
        }

        for conn_id in self.reply_tx.keys().copied().collect::<Vec<_>>() {
            self.engine.drop_conn(conn_id, Instant::now());
        }
        if let Some(wal) = self.engine_wal_mut() {
            if let Err(error) = wal.flush() {
                error!(%error, "failed to flush write-ahead log during shutdown");
            }
        }

        Ok(())
    }

    async fn handle(&mut self, msg: ToServer, now: Instant) {
        match msg {
            ToServer::Register { reply_tx, assign } => {
                let conn_id = self.engine.register_conn();
                self.reply_tx.insert(conn_id, reply_tx);
                let _ = assign.send(conn_id);
            },
            ToServer::Request { conn, req } => {
                let outcome = self.engine.dispatch(conn, req, now);
                if !matches!(outcome, Outcome::Deferred) {
                    self.send(conn, outcome).await;
                }
                self.tick(now).await;
            },
            ToServer::Closed { conn } => {
                self.engine.drop_conn(conn, now);
                self.reply_tx.remove(&conn);
                self.tick(now).await;
            },
        }
    }

    /// Runs the scheduler and delivers whatever it produces. Called after
    /// every handled request (not just from the sleep branch in `run`) so a
    /// `put`/`release`/`kick`/connection-close that hands a job to a
    /// connection blocked in `reserve` wakes it immediately instead of
    /// waiting for the next timer deadline.
    async fn tick(&mut self, now: Instant) {
        for (conn_id, outcome) in self.engine.tick(now) {
            self.send(conn_id, outcome).await;
        }
    }

    async fn send(&mut self, conn_id: ConnId, outcome: Outcome) {
        if let Some(tx) = self.reply_tx.get(&conn_id) {
            if tx.send(ToConn::Outcome(outcome)).await.is_err() {
                self.reply_tx.remove(&conn_id);
            }
        }
    }

    /// Exposes the WAL for the final flush on shutdown without exposing it
    /// more broadly — `Engine` otherwise keeps it private.
    fn engine_wal_mut(&mut self) -> Option<&mut Wal> {
        self.engine.wal_mut()
    }
}

/// Installs the `SIGTERM`/`SIGINT`/`SIGUSR1` handlers and spawns the task
/// that watches them, returning the tokens [`Server::run`] watches.
/// `SIGTERM`/`SIGINT` trigger a full shutdown; `SIGUSR1` only stops
/// accepting new connections (see `Engine::set_draining`).
///
/// Fails only if the underlying `signalfd`/`sigaction` setup fails, which in
/// practice means the process is out of file descriptors or running
/// somewhere signals can't be installed.
pub fn install_signal_handlers() -> io::Result<(CancellationToken, CancellationToken)> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;

    let shutdown = CancellationToken::new();
    let drain = CancellationToken::new();

    let task_shutdown = shutdown.clone();
    let task_drain = drain.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => { task_shutdown.cancel(); return; },
                _ = sigint.recv() => { task_shutdown.cancel(); return; },
                _ = sigusr1.recv() => { task_drain.cancel(); },
            }
        }
    });

    Ok((shutdown, drain))
}

/// Runs one client connection: decodes the wire protocol, stitches `put`
/// bodies together with their preceding command, forwards completed
/// requests to the owning server task, and writes back whatever comes out
/// of its own reply channel — in the order it arrives, which is the order
/// the server task produced it, so replies never overtake one another.
#[instrument(name = "client", err(level = Level::WARN), fields(peer = %conn.peer_addr()?), skip_all)]
async fn handle_connection(conn: TcpStream, to_server: mpsc::Sender<ToServer>) -> anyhow::Result<()> {
    conn.set_nodelay(true)?;
    let mut framed = wire::framed(conn);

    let (reply_tx, mut reply_rx) = mpsc::channel::<ToConn>(8);
    let (assign_tx, assign_rx) = oneshot::channel();
    if to_server.send(ToServer::Register { reply_tx, assign: assign_tx }).await.is_err() {
        return Ok(());
    }
    let Ok(conn_id) = assign_rx.await else { return Ok(()) };

    let mut pending_put: Option<(u32, u32, u32, bytes::BytesMut)> = None;

    let result: anyhow::Result<()> = 'outer: loop {
        let evt = match framed.next().await {
            None => break 'outer Ok(()),
            Some(Ok(evt)) => evt,
            Some(Err(decoder::Error::Client(resp))) => {
                framed.send(resp).await?;
                break 'outer Ok(());
            },
            Some(Err(decoder::Error::IO(error))) => break 'outer Err(error.into()),
        };

        let req = match evt {
            BeanstalkClientEvent::Discarded => continue,
            BeanstalkClientEvent::PutChunk(chunk) => {
                if let Some((.., buf)) = pending_put.as_mut() {
                    buf.extend_from_slice(&chunk);
                }
                continue;
            },
            BeanstalkClientEvent::PutEnd => {
                let Some((pri, delay, ttr, buf)) = pending_put.take() else { continue };
                Request::Put { pri, delay, ttr, body: Bytes::from(buf) }
            },
            BeanstalkClientEvent::Command(Command::Put { pri, delay, ttr, n_bytes }) => {
                pending_put = Some((pri, delay, ttr, bytes::BytesMut::with_capacity(n_bytes as usize)));
                continue;
            },
            BeanstalkClientEvent::Command(cmd) => to_request(cmd),
        };

        let is_quit = matches!(req, Request::Quit);
        if to_server.send(ToServer::Request { conn: conn_id, req }).await.is_err() {
            break 'outer Ok(());
        }
        if is_quit {
            break 'outer Ok(());
        }

        match reply_rx.recv().await {
            Some(ToConn::Outcome(outcome)) => {
                if write_outcome(&mut framed, outcome).await?.is_close() {
                    break 'outer Ok(());
                }
            },
            None => break 'outer Ok(()),
        }
    };

    let _ = to_server.send(ToServer::Closed { conn: conn_id }).await;
    if let Err(error) = framed.into_inner().shutdown().await {
        debug!(%error, "error shutting down connection socket");
    }
    result
}

fn spawn_connection(conn: TcpStream, to_server: mpsc::Sender<ToServer>) {
    tokio::spawn(async move {
        if let Err(error) = handle_connection(conn, to_server).await {
            warn!(%error, "connection ended with an error");
        }
    });
}

enum WriteResult {
    Continue,
    Close,
}

impl WriteResult {
    fn is_close(&self) -> bool {
        matches!(self, WriteResult::Close)
    }
}

async fn write_outcome<T>(
    framed: &mut tokio_util::codec::Framed<T, wire::Codec>,
    outcome: Outcome,
) -> anyhow::Result<WriteResult>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    match outcome {
        Outcome::Reply(resp) => {
            framed.send(resp).await?;
            Ok(WriteResult::Continue)
        },
        Outcome::Job { id, body, kind } => {
            let header = match kind {
                JobKind::Reserved => Response::Reserved { id, bytes: body.len() as u32 },
                JobKind::Found => Response::Found { id, bytes: body.len() as u32 },
            };
            framed.send(header).await?;
            framed.send(Response::JobChunk(body)).await?;
            framed.send(Response::JobEnd).await?;
            Ok(WriteResult::Continue)
        },
        Outcome::Deferred => Ok(WriteResult::Continue),
        Outcome::Close => Ok(WriteResult::Close),
    }
}

fn to_request(cmd: Command) -> Request {
    match cmd {
        Command::Put { .. } => unreachable!("put is assembled by the connection task"),
        Command::Use { tube } => Request::Use { tube },
        Command::Reserve => Request::Reserve,
        Command::ReserveWithTimeout { timeout } => Request::ReserveWithTimeout { timeout },
        Command::ReserveJob { id } => Request::ReserveJob { id },
        Command::Delete { id } => Request::Delete { id },
        Command::Release { id, pri, delay } => Request::Release { id, pri, delay },
        Command::Bury { id, pri } => Request::Bury { id, pri },
        Command::Touch { id } => Request::Touch { id },
        Command::Watch { tube } => Request::Watch { tube },
        Command::Ignore { tube } => Request::Ignore { tube },
        Command::Peek { id } => Request::Peek { id },
        Command::PeekReady => Request::PeekReady,
        Command::PeekDelayed => Request::PeekDelayed,
        Command::PeekBuried => Request::PeekBuried,
        Command::Kick { bound } => Request::Kick { bound },
        Command::KickJob { id } => Request::KickJob { id },
        Command::StatsJob { id } => Request::StatsJob { id },
        Command::StatsTube { tube } => Request::StatsTube { tube },
        Command::StatsServer => Request::StatsServer,
        Command::ListTubes => Request::ListTubes,
        Command::ListTubeUsed => Request::ListTubeUsed,
        Command::ListTubesWatched => Request::ListTubesWatched,
        Command::PauseTube { tube, delay } => Request::PauseTube { tube, delay },
        Command::Quit => Request::Quit,
    }
}
