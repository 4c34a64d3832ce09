//! The rterm client.
//!
//! `RtermClient` owns the TCP connection. A background receive task feeds
//! every byte from the server through a [`ResponseDecoder`] and turns it into
//! [`ServerEvent`]s; commands are written directly, one line each.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time;

use rterm_core::{Marker, ResponseDecoder, RtermError, RtermResult};

/// Configuration for connecting to an rterm server.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Marker the server frames responses with.
    pub marker: Marker,
    /// Connect and response timeout in seconds.
    pub timeout_secs: u64,
    /// Size of each socket read.
    pub buffer_size: usize,
    /// Surface unframed (streamed) text as `ServerEvent::Output` once the
    /// server has been quiet for `stream_flush_ms`.
    pub stream_output: bool,
    pub stream_flush_ms: u64,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            marker: Marker::Standard,
            timeout_secs: 10,
            buffer_size: rterm_core::DEFAULT_BUFFER_SIZE,
            stream_output: false,
            stream_flush_ms: 100,
        }
    }
}

/// Something the server sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// One complete marker-terminated response.
    Response(String),
    /// Streamed shell output not (yet) followed by a marker.
    Output(String),
    /// The server closed the connection.
    Closed,
}

/// The rterm client.
pub struct RtermClient {
    /// Write half of the connection, shared with nothing but serialized anyway.
    writer: Mutex<OwnedWriteHalf>,
    /// Decoded events from the receive task.
    events: mpsc::Receiver<ServerEvent>,
    /// Whether the connection is still open.
    connected: Arc<AtomicBool>,
    /// Handle for the receive task.
    receive_handle: Option<JoinHandle<()>>,
    /// Response timeout.
    timeout: Duration,
    peer: SocketAddr,
}

impl RtermClient {
    /// Connect to `addr` (`host:port`).
    pub async fn connect(addr: &str, config: ConnectConfig) -> RtermResult<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let stream = time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RtermError::Timeout)??;
        let peer = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay failed: {}", e);
        }
        tracing::info!("connected to {}", peer);

        let (reader, writer) = stream.into_split();
        let (event_tx, events) = mpsc::channel::<ServerEvent>(256);
        let connected = Arc::new(AtomicBool::new(true));

        let flush = config
            .stream_output
            .then(|| Duration::from_millis(config.stream_flush_ms));
        let receive_handle = tokio::spawn(receive_loop(
            reader,
            ResponseDecoder::new(config.marker),
            event_tx,
            connected.clone(),
            config.buffer_size.max(1),
            flush,
        ));

        Ok(Self {
            writer: Mutex::new(writer),
            events,
            connected,
            receive_handle: Some(receive_handle),
            timeout,
            peer,
        })
    }

    /// Address of the server.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the server has not closed the connection.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send one command line.
    pub async fn send_command(&self, command: &str) -> RtermResult<()> {
        if command.contains('\n') {
            return Err(RtermError::Protocol(
                "commands must be a single line".into(),
            ));
        }
        if !self.is_connected() {
            return Err(RtermError::PeerClosed);
        }
        let line = format!("{command}\n");
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Next event from the server; `None` once the receive task has ended
    /// and every event was consumed.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    /// Wait for the next framed response, skipping streamed output.
    pub async fn next_response(&mut self) -> RtermResult<String> {
        let timeout = self.timeout;
        self.next_response_within(timeout).await
    }

    /// [`next_response`](Self::next_response) with an explicit timeout.
    pub async fn next_response_within(&mut self, timeout: Duration) -> RtermResult<String> {
        let wait = async {
            loop {
                match self.events.recv().await {
                    Some(ServerEvent::Response(text)) => return Ok(text),
                    Some(ServerEvent::Output(_)) => continue,
                    Some(ServerEvent::Closed) | None => return Err(RtermError::PeerClosed),
                }
            }
        };
        time::timeout(timeout, wait)
            .await
            .map_err(|_| RtermError::Timeout)?
    }

    /// Close the connection.
    pub async fn disconnect(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                tracing::debug!("shutdown failed: {}", e);
            }
        }
        if let Some(handle) = self.receive_handle.take() {
            handle.abort();
        }
    }
}

impl Drop for RtermClient {
    fn drop(&mut self) {
        if let Some(handle) = self.receive_handle.take() {
            handle.abort();
        }
    }
}

async fn receive_loop(
    mut reader: OwnedReadHalf,
    mut decoder: ResponseDecoder,
    events: mpsc::Sender<ServerEvent>,
    connected: Arc<AtomicBool>,
    buffer_size: usize,
    flush: Option<Duration>,
) {
    let mut buf = vec![0u8; buffer_size];
    loop {
        let read = match flush {
            Some(quiet) if decoder.pending() > 0 => {
                match time::timeout(quiet, reader.read(&mut buf)).await {
                    Ok(read) => read,
                    Err(_) => {
                        if let Some(text) = decoder.take_pending() {
                            if events.send(ServerEvent::Output(text)).await.is_err() {
                                break;
                            }
                        }
                        continue;
                    }
                }
            }
            _ => reader.read(&mut buf).await,
        };

        match read {
            Ok(0) => {
                tracing::debug!("server closed the connection");
                break;
            }
            Ok(n) => {
                for message in decoder.feed(&buf[..n]) {
                    if events.send(ServerEvent::Response(message)).await.is_err() {
                        connected.store(false, Ordering::SeqCst);
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::debug!("receive failed: {}", e);
                break;
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    if let Some(text) = decoder.take_pending() {
        let _ = events.send(ServerEvent::Output(text)).await;
    }
    let _ = events.send(ServerEvent::Closed).await;
    tracing::debug!("receive loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    async fn fake_server() -> (String, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (addr, listener)
    }

    #[tokio::test]
    async fn decodes_responses_split_across_writes() {
        let (addr, listener) = fake_server().await;
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"Welcome\n\n<<END_OF").await.unwrap();
            socket.flush().await.unwrap();
            time::sleep(Duration::from_millis(20)).await;
            socket
                .write_all(b"_RESPONSE>>\nhello\n\n<<END_OF_RESPONSE>>\n")
                .await
                .unwrap();
        });

        let mut client = RtermClient::connect(&addr, ConnectConfig::default())
            .await
            .unwrap();
        assert_eq!(client.next_response().await.unwrap(), "Welcome");
        assert_eq!(client.next_response().await.unwrap(), "hello");

        server.await.unwrap();
        assert_eq!(client.next_event().await, Some(ServerEvent::Closed));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn sends_one_line_per_command() {
        let (addr, listener) = fake_server().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut lines = tokio::io::BufReader::new(socket).lines();
            let first = lines.next_line().await.unwrap();
            let second = lines.next_line().await.unwrap();
            (first, second)
        });

        let client = RtermClient::connect(&addr, ConnectConfig::default())
            .await
            .unwrap();
        client.send_command("dir").await.unwrap();
        client.send_command("exit").await.unwrap();
        assert!(matches!(
            client.send_command("a\nb").await,
            Err(RtermError::Protocol(_))
        ));

        let (first, second) = server.await.unwrap();
        assert_eq!(first.as_deref(), Some("dir"));
        assert_eq!(second.as_deref(), Some("exit"));
    }

    #[tokio::test]
    async fn streamed_output_surfaces_after_quiet_period() {
        let (addr, listener) = fake_server().await;
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"[10:00:00] hello\n").await.unwrap();
            socket.flush().await.unwrap();
            let _ = done_rx.await;
        });

        let config = ConnectConfig {
            stream_output: true,
            stream_flush_ms: 20,
            ..ConnectConfig::default()
        };
        let mut client = RtermClient::connect(&addr, config).await.unwrap();
        assert_eq!(
            client.next_event().await,
            Some(ServerEvent::Output("[10:00:00] hello\n".into()))
        );

        done_tx.send(()).unwrap();
        server.await.unwrap();
        assert_eq!(client.next_event().await, Some(ServerEvent::Closed));
    }

    #[tokio::test]
    async fn legacy_marker() {
        let (addr, listener) = fake_server().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"Goodbye!\n\n<<EOF>>\n").await.unwrap();
        });

        let config = ConnectConfig {
            marker: Marker::Legacy,
            ..ConnectConfig::default()
        };
        let mut client = RtermClient::connect(&addr, config).await.unwrap();
        assert_eq!(client.next_response().await.unwrap(), "Goodbye!");
    }

    #[tokio::test]
    async fn response_timeout() {
        let (addr, listener) = fake_server().await;
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            let _ = done_rx.await;
        });

        let mut client = RtermClient::connect(&addr, ConnectConfig::default())
            .await
            .unwrap();
        assert!(matches!(
            client.next_response_within(Duration::from_millis(50)).await,
            Err(RtermError::Timeout)
        ));
        done_tx.send(()).unwrap();
        client.disconnect().await;
        assert!(!client.is_connected());
    }
}
