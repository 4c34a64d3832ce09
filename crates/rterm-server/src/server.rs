//! Core server: accepts connections and hands each one to a
//! [`ConnectionHandler`].
//!
//! Owns the session registry and the shutdown broadcast. Coordinates the
//! lifecycle of all incoming connections.

use crate::config::ServerConfig;
use crate::handler::{self, CloseReason, ConnectionHandler, HandlerContext};
use crate::registry::SessionRegistry;
use crate::session::{ChannelFactory, PipeChannelFactory};
use crate::transport::{self, TcpConnection};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use rterm_core::RtermResult;

/// The rterm server instance.
pub struct RtermServer {
    /// Server configuration.
    config: ServerConfig,
    /// Live connections.
    registry: SessionRegistry,
    /// Shared per-connection settings.
    ctx: Arc<HandlerContext>,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl RtermServer {
    /// Create a server that spawns real shells.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_factory(config, Arc::new(PipeChannelFactory))
    }

    /// Create a server with a custom shell factory.
    pub fn with_factory(config: ServerConfig, factory: Arc<dyn ChannelFactory>) -> Self {
        let ctx = Arc::new(HandlerContext {
            factory,
            interpreter: config.interpreter.clone(),
            working_dir: config.working_dir.clone(),
            options: config.session.clone(),
            mode: config.mode,
            marker: config.marker,
            buffer_size: config.buffer_size,
        });
        Self {
            registry: SessionRegistry::new(config.max_sessions),
            ctx,
            shutdown_tx: broadcast::channel(1).0,
            config,
        }
    }

    /// Listen on the configured address until `shutdown` completes.
    pub async fn run<F>(self, shutdown: F) -> RtermResult<()>
    where
        F: Future<Output = ()>,
    {
        let (_local_addr, rx) = transport::start_listener(self.config.listen_addr).await?;
        self.serve(rx, shutdown).await
    }

    /// Serve connections from `incoming` until it closes or `shutdown`
    /// completes, then tell every handler to close and wait for them.
    pub async fn serve<F>(
        self,
        mut incoming: mpsc::Receiver<TcpConnection>,
        shutdown: F,
    ) -> RtermResult<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            addr = %self.config.listen_addr,
            mode = %self.config.mode,
            shell = %self.config.interpreter.program,
            cwd = %self.config.working_dir,
            max_sessions = self.config.max_sessions,
            "rterm-server ready"
        );

        tokio::pin!(shutdown);
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                conn = incoming.recv() => match conn {
                    Some(conn) => self.accept(conn, &mut tasks),
                    None => {
                        info!("listener closed, shutting down");
                        break;
                    }
                },
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "connection task failed");
                    }
                }
            }
        }

        // Broadcast shutdown to all connected clients
        let live = self.registry.count();
        info!(live, "broadcasting shutdown to connected clients");
        let _ = self.shutdown_tx.send(());

        let grace = self.config.session.terminate_timeout + Duration::from_secs(1);
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), "connections still open after grace period, aborting");
            tasks.abort_all();
        }
        Ok(())
    }

    fn accept(&self, conn: TcpConnection, tasks: &mut JoinSet<()>) {
        let peer = conn.remote_addr;
        let guard = match self.registry.register(peer, self.ctx.mode) {
            Ok(guard) => guard,
            Err(e) => {
                warn!(peer = %peer, error = %e, "rejecting connection");
                tasks.spawn(handler::reject_busy(conn.stream, self.ctx.marker, peer));
                return;
            }
        };

        info!(peer = %peer, session_id = %guard.id(), "client connected");
        for session in self.registry.list() {
            debug!(session_id = %session.id, peer = %session.peer, mode = %session.mode, age_secs = session.age_secs, "live session");
        }

        let (read, write) = conn.stream.into_split();
        let handler = ConnectionHandler::new(
            read,
            write,
            peer,
            self.ctx.clone(),
            self.shutdown_tx.subscribe(),
        );
        tasks.spawn(async move {
            let reason = handler.run().await;
            if reason == CloseReason::SpawnFailed {
                warn!(session_id = %guard.id(), "session never started");
            }
            drop(guard);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CliOverrides, ConfigFile};
    use crate::handler::{GOODBYE_MESSAGE, SERVER_BUSY_MESSAGE, SHUTDOWN_MESSAGE};
    use crate::session::channel::scripted::{ScriptedChannel, ScriptedFactory};
    use crate::session::interpreter::DEFAULT_POSIX_PROMPT;
    use crate::session::OutputStream;
    use rterm_core::ResponseDecoder;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    struct Client {
        stream: TcpStream,
        decoder: ResponseDecoder,
        frames: Vec<String>,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            Self {
                stream: TcpStream::connect(addr).await.unwrap(),
                decoder: ResponseDecoder::default(),
                frames: Vec::new(),
            }
        }

        async fn frame(&mut self) -> String {
            let mut buf = [0u8; 4096];
            while self.frames.is_empty() {
                let n = self.stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "server closed the connection");
                self.frames.extend(self.decoder.feed(&buf[..n]));
            }
            self.frames.remove(0)
        }

        async fn send(&mut self, line: &str) {
            self.stream.write_all(line.as_bytes()).await.unwrap();
        }

        async fn closed(&mut self) -> bool {
            let mut buf = [0u8; 64];
            matches!(self.stream.read(&mut buf).await, Ok(0))
        }
    }

    fn config(cli: CliOverrides) -> ServerConfig {
        let cli = CliOverrides {
            command_timeout_ms: Some(2000),
            ..cli
        };
        ServerConfig::resolve(ConfigFile::default(), cli).unwrap()
    }

    fn scripted_factory() -> Arc<dyn ChannelFactory> {
        let channel = Arc::new(ScriptedChannel::new(|line| {
            let mut out = Vec::new();
            if line == "pwd" {
                out.push((OutputStream::Stdout, "/srv/app\n".to_string()));
            }
            out.push((OutputStream::Stderr, DEFAULT_POSIX_PROMPT.to_string()));
            out
        }));
        channel.emit(OutputStream::Stderr, DEFAULT_POSIX_PROMPT);
        Arc::new(ScriptedFactory { channel })
    }

    async fn start(
        server: RtermServer,
    ) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<RtermResult<()>>) {
        let (addr, rx) = transport::start_listener("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.serve(rx, async {
            let _ = stop_rx.await;
        }));
        (addr, stop_tx, task)
    }

    #[tokio::test]
    async fn pwd_and_exit_over_tcp() {
        let server = RtermServer::with_factory(config(CliOverrides::default()), scripted_factory());
        let (addr, stop, task) = start(server).await;

        let mut client = Client::connect(addr).await;
        let welcome = client.frame().await;
        assert!(welcome.contains("Welcome to Remote Terminal Server!"));

        client.send("pwd\n").await;
        assert_eq!(client.frame().await, "/srv/app");

        client.send("exit\n").await;
        assert_eq!(client.frame().await, GOODBYE_MESSAGE);
        assert!(client.closed().await);

        stop.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn excess_connections_are_busy() {
        let cli = CliOverrides {
            max_sessions: Some(1),
            ..CliOverrides::default()
        };
        let server = RtermServer::with_factory(config(cli), scripted_factory());
        let (addr, stop, task) = start(server).await;

        let mut first = Client::connect(addr).await;
        first.frame().await;

        let mut second = Client::connect(addr).await;
        assert_eq!(second.frame().await, SERVER_BUSY_MESSAGE);
        assert!(second.closed().await);

        stop.send(()).unwrap();
        assert_eq!(first.frame().await, SHUTDOWN_MESSAGE);
        task.await.unwrap().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn real_shell_over_tcp() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("work")).unwrap();
        let cli = CliOverrides {
            working_dir: Some(dir.path().to_string_lossy().into_owned()),
            shell: Some("/bin/sh".into()),
            ..CliOverrides::default()
        };
        let server = RtermServer::new(config(cli));
        let (addr, stop, task) = start(server).await;

        let mut client = Client::connect(addr).await;
        client.frame().await;

        client.send("echo hello\n").await;
        assert_eq!(client.frame().await, "hello");

        client.send("cd work\n").await;
        let work = client.frame().await;
        assert!(work.ends_with("work"));

        client.send("pwd\n").await;
        assert_eq!(client.frame().await, work);

        client.send("cd nowhere\n").await;
        assert_eq!(
            client.frame().await,
            crate::session::directory::PATH_NOT_FOUND_MESSAGE
        );

        client.send("quit\n").await;
        assert_eq!(client.frame().await, GOODBYE_MESSAGE);

        stop.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
