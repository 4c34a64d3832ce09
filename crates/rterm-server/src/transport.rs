//! TCP listener and the line-oriented text transport on top of it.
//!
//! Inbound: one command per `\n`-terminated line, bounded by the configured
//! buffer size. Outbound: marker-framed responses and timestamped stream
//! chunks, serialized through one lock so concurrent writers never
//! interleave.

use std::net::SocketAddr;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use rterm_core::{frame_response, strip_line_ending, timestamp_prefix, Marker, RtermResult};

/// An accepted TCP connection.
pub struct TcpConnection {
    pub stream: TcpStream,
    pub remote_addr: SocketAddr,
}

/// Start the TCP listener.
///
/// Returns the bound address (useful with port 0) and a receiver that
/// yields accepted connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> RtermResult<(SocketAddr, mpsc::Receiver<TcpConnection>)> {
    let listener = TcpListener::bind(bind_addr).await?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "TCP listener started");

    let (tx, rx) = mpsc::channel::<TcpConnection>(64);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(remote = %addr, "TCP connection accepted");
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(remote = %addr, error = %e, "set_nodelay failed");
                    }
                    let conn = TcpConnection {
                        stream,
                        remote_addr: addr,
                    };
                    if tx.send(conn).await.is_err() {
                        warn!("connection channel closed, stopping listener");
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}

/// Result of reading one command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadLine {
    /// A complete line with `\n` / `\r\n` removed.
    Line(String),
    /// The line exceeded the limit and was discarded up to its `\n`.
    TooLong,
    /// The peer closed its side.
    Closed,
}

/// Reads `\n`-delimited command lines of bounded length.
pub struct CommandReader<R> {
    reader: BufReader<R>,
    max_line: usize,
}

impl<R: AsyncRead + Unpin> CommandReader<R> {
    pub fn new(inner: R, max_line: usize) -> Self {
        Self {
            reader: BufReader::new(inner),
            max_line,
        }
    }

    /// Read the next line. A final line without `\n` before EOF is still
    /// returned; the following call reports `Closed`.
    pub async fn next_line(&mut self) -> RtermResult<ReadLine> {
        let mut buf = Vec::new();
        let limit = self.max_line as u64 + 1;
        let n = (&mut self.reader)
            .take(limit)
            .read_until(b'\n', &mut buf)
            .await?;
        if n == 0 {
            return Ok(ReadLine::Closed);
        }
        if buf.last() != Some(&b'\n') && buf.len() > self.max_line {
            self.discard_rest_of_line().await?;
            return Ok(ReadLine::TooLong);
        }

        let text = String::from_utf8_lossy(&buf);
        Ok(ReadLine::Line(strip_line_ending(&text).to_string()))
    }

    async fn discard_rest_of_line(&mut self) -> RtermResult<()> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(());
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(idx) => {
                    self.reader.consume(idx + 1);
                    return Ok(());
                }
                None => {
                    let len = available.len();
                    self.reader.consume(len);
                }
            }
        }
    }
}

/// The single write path to a client socket.
pub struct ResponseWriter<W> {
    inner: Mutex<W>,
    marker: Marker,
}

impl<W: AsyncWrite + Unpin + Send> ResponseWriter<W> {
    pub fn new(inner: W, marker: Marker) -> Self {
        Self {
            inner: Mutex::new(inner),
            marker,
        }
    }

    /// Send `body` as one marker-terminated response.
    pub async fn send_response(&self, body: &str) -> RtermResult<()> {
        let mut inner = self.inner.lock().await;
        let frame = frame_response(body, self.marker);
        inner.write_all(frame.as_bytes()).await?;
        inner.flush().await?;
        Ok(())
    }

    /// Send streamed shell output with a timestamp prefix and no marker.
    pub async fn send_stream(&self, text: &str) -> RtermResult<()> {
        let mut inner = self.inner.lock().await;
        let chunk = format!("{}{text}", timestamp_prefix());
        inner.write_all(chunk.as_bytes()).await?;
        inner.flush().await?;
        Ok(())
    }

    /// Close the write side. Errors are ignored; the peer may be gone.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        if let Err(e) = inner.shutdown().await {
            debug!(error = %e, "socket shutdown failed");
        }
    }
}
