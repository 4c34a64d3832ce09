//! Per-connection driver.
//!
//! Spawns the shell session, greets the client, then loops reading one
//! command line at a time and relaying it to the session until the client
//! says `exit`, disconnects, or the server shuts down.

use crate::session::{
    ChannelFactory, Delivery, DeliveryMode, Interpreter, OutputTap, SessionOptions, ShellSession,
    StreamingSession, SyncSession,
};
use crate::streamer;
use crate::transport::{CommandReader, ReadLine, ResponseWriter};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use rterm_core::{timestamp_prefix, CommandLine, Marker};

pub const GOODBYE_MESSAGE: &str = "Goodbye!";
pub const SPAWN_FAILED_MESSAGE: &str = "Error: Failed to initialize shell session";
pub const SERVER_BUSY_MESSAGE: &str = "Error: Server busy";
pub const SHUTDOWN_MESSAGE: &str = "Server shutting down";

/// Everything a handler needs to build its session.
#[derive(Clone)]
pub struct HandlerContext {
    pub factory: Arc<dyn ChannelFactory>,
    pub interpreter: Interpreter,
    pub working_dir: String,
    pub options: SessionOptions,
    pub mode: DeliveryMode,
    pub marker: Marker,
    pub buffer_size: usize,
}

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Greeting,
    AwaitingCommand,
    Executing,
    Closing,
    Closed,
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client sent `exit` or `quit`.
    Exit,
    /// Client disconnected or the read failed.
    PeerClosed,
    /// Writing to the client failed.
    SendFailed,
    /// Server is shutting down.
    Shutdown,
    /// The shell could not be started.
    SpawnFailed,
    /// The shell went away.
    ShellExited,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::Exit => "exit",
            CloseReason::PeerClosed => "peer closed",
            CloseReason::SendFailed => "send failed",
            CloseReason::Shutdown => "server shutdown",
            CloseReason::SpawnFailed => "spawn failed",
            CloseReason::ShellExited => "shell exited",
        };
        f.write_str(s)
    }
}

/// What the read loop produced.
enum Next {
    Command(String),
    Exit,
    /// The stop token fired (streamer gave up).
    Cancelled,
    Stop(CloseReason),
}

/// Framed greeting sent as soon as the shell has been spawned.
pub fn welcome_message() -> String {
    format!(
        "{ts}Welcome to Remote Terminal Server!\n{ts}Shell session initialized.",
        ts = timestamp_prefix()
    )
}

pub struct ConnectionHandler<R, W> {
    peer: SocketAddr,
    reader: CommandReader<R>,
    writer: Arc<ResponseWriter<W>>,
    ctx: Arc<HandlerContext>,
    shutdown: broadcast::Receiver<()>,
    stop: CancellationToken,
    state: ConnectionState,
}

impl<R, W> ConnectionHandler<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        reader: R,
        writer: W,
        peer: SocketAddr,
        ctx: Arc<HandlerContext>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            peer,
            reader: CommandReader::new(reader, ctx.buffer_size),
            writer: Arc::new(ResponseWriter::new(writer, ctx.marker)),
            ctx,
            shutdown,
            stop: CancellationToken::new(),
            state: ConnectionState::Greeting,
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!(peer = %self.peer, from = ?self.state, to = ?next, "connection state");
            self.state = next;
        }
    }

    /// Drive the connection to completion.
    pub async fn run(mut self) -> CloseReason {
        let ctx = self.ctx.clone();
        let session = match ShellSession::open(
            ctx.factory.as_ref(),
            ctx.interpreter.clone(),
            ctx.working_dir.clone(),
            ctx.options.clone(),
        ) {
            Ok(session) => session,
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "failed to create shell session");
                if let Err(e) = self.writer.send_response(SPAWN_FAILED_MESSAGE).await {
                    debug!(peer = %self.peer, error = %e, "could not report spawn failure");
                }
                return self.finish(CloseReason::SpawnFailed).await;
            }
        };

        if let Err(reason) = self.greet().await {
            self.transition(ConnectionState::Closing);
            session.close().await;
            return self.finish(reason).await;
        }

        let reason = match session.into_delivery(ctx.mode).await {
            Delivery::RequestResponse(sync) => self.run_request_response(sync).await,
            Delivery::Streaming(stream, tap) => self.run_streaming(stream, tap).await,
        };
        self.finish(reason).await
    }

    async fn finish(&mut self, reason: CloseReason) -> CloseReason {
        self.writer.shutdown().await;
        self.transition(ConnectionState::Closed);
        info!(peer = %self.peer, %reason, "connection closed");
        reason
    }

    async fn greet(&self) -> Result<(), CloseReason> {
        self.reply(&welcome_message()).await
    }

    async fn run_request_response(&mut self, mut sync: SyncSession) -> CloseReason {
        let reason = loop {
            let command = match self.next_command().await {
                Next::Command(command) => command,
                Next::Exit => break self.say_goodbye().await,
                Next::Cancelled => break CloseReason::Shutdown,
                Next::Stop(reason) => break reason,
            };

            self.transition(ConnectionState::Executing);
            debug!(peer = %self.peer, command = %command, cwd = %sync.working_directory(), "executing");
            let reply = match sync.execute(&command).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "command failed");
                    format!("Error: Failed to send command to shell ({e})")
                }
            };
            if let Err(reason) = self.reply(&reply).await {
                break reason;
            }
            if !sync.is_active() {
                break CloseReason::ShellExited;
            }
        };

        self.transition(ConnectionState::Closing);
        sync.close().await;
        reason
    }

    async fn run_streaming(&mut self, mut stream: StreamingSession, tap: OutputTap) -> CloseReason {
        let mut streamer = Some(streamer::spawn(tap, self.writer.clone(), self.stop.clone()));

        let reason = loop {
            match self.next_command().await {
                Next::Command(command) => {
                    self.transition(ConnectionState::Executing);
                    debug!(peer = %self.peer, command = %command, cwd = %stream.working_directory(), "forwarding");
                    match stream.send_only(&command).await {
                        Ok(Some(reply)) => {
                            if let Err(reason) = self.reply(&reply).await {
                                break reason;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(peer = %self.peer, error = %e, "command failed");
                            let reply = format!("Error: Failed to send command to shell ({e})");
                            if let Err(reason) = self.reply(&reply).await {
                                break reason;
                            }
                            if !stream.is_active() {
                                break CloseReason::ShellExited;
                            }
                        }
                    }
                }
                Next::Exit => {
                    // nothing may be streamed after the goodbye frame
                    self.stop_streamer(&mut streamer).await;
                    break self.say_goodbye().await;
                }
                Next::Cancelled if stream.is_active() => break CloseReason::SendFailed,
                Next::Cancelled => break CloseReason::ShellExited,
                Next::Stop(reason) => break reason,
            }
        };

        self.transition(ConnectionState::Closing);
        self.stop_streamer(&mut streamer).await;
        stream.close().await;
        reason
    }

    async fn reply(&self, body: &str) -> Result<(), CloseReason> {
        self.writer.send_response(body).await.map_err(|e| {
            if e.is_peer_closed() {
                debug!(peer = %self.peer, error = %e, "client went away");
            } else {
                warn!(peer = %self.peer, error = %e, "failed to send response");
            }
            CloseReason::SendFailed
        })
    }

    async fn stop_streamer(&mut self, streamer: &mut Option<JoinHandle<()>>) {
        self.stop.cancel();
        if let Some(handle) = streamer.take() {
            if let Err(e) = handle.await {
                warn!(peer = %self.peer, error = %e, "streamer task failed");
            }
        }
    }

    async fn say_goodbye(&mut self) -> CloseReason {
        self.transition(ConnectionState::Closing);
        info!(peer = %self.peer, "client requested exit");
        if self.writer.send_response(GOODBYE_MESSAGE).await.is_err() {
            return CloseReason::SendFailed;
        }
        CloseReason::Exit
    }

    /// Wait for the next non-empty command line.
    async fn next_command(&mut self) -> Next {
        loop {
            self.transition(ConnectionState::AwaitingCommand);
            let read = tokio::select! {
                read = self.reader.next_line() => read,
                _ = self.shutdown.recv() => {
                    info!(peer = %self.peer, "server shutting down, closing connection");
                    let _ = self.writer.send_response(SHUTDOWN_MESSAGE).await;
                    return Next::Stop(CloseReason::Shutdown);
                }
                _ = self.stop.cancelled() => return Next::Cancelled,
            };

            match read {
                Ok(ReadLine::Line(line)) => match CommandLine::parse(&line) {
                    CommandLine::Empty => continue,
                    CommandLine::Exit => return Next::Exit,
                    _ => return Next::Command(line),
                },
                Ok(ReadLine::TooLong) => {
                    warn!(peer = %self.peer, max = self.ctx.buffer_size, "command line too long");
                    let reply = format!(
                        "Error: Command exceeds the maximum length of {} bytes",
                        self.ctx.buffer_size
                    );
                    if self.writer.send_response(&reply).await.is_err() {
                        return Next::Stop(CloseReason::SendFailed);
                    }
                }
                Ok(ReadLine::Closed) => return Next::Stop(CloseReason::PeerClosed),
                Err(e) => {
                    if e.is_peer_closed() {
                        debug!(peer = %self.peer, error = %e, "client went away");
                    } else {
                        warn!(peer = %self.peer, error = %e, "read failed");
                    }
                    return Next::Stop(CloseReason::PeerClosed);
                }
            }
        }
    }
}

/// Reject a connection over the session limit.
pub async fn reject_busy<W>(writer: W, marker: Marker, peer: SocketAddr)
where
    W: AsyncWrite + Unpin + Send,
{
    let writer = ResponseWriter::new(writer, marker);
    if let Err(e) = writer.send_response(SERVER_BUSY_MESSAGE).await {
        debug!(peer = %peer, error = %e, "could not send busy message");
    }
    writer.shutdown().await;
}
