//! Background forwarder for streaming-mode sessions.

use crate::session::OutputTap;
use crate::transport::ResponseWriter;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Spawn the streamer. It owns the tap and runs until `stop` is cancelled.
/// A failed socket write or a dead session cancels `stop` itself so the
/// command loop notices.
pub fn spawn<W>(
    mut tap: OutputTap,
    writer: Arc<ResponseWriter<W>>,
    stop: CancellationToken,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let interval = tap.poll_interval();
        loop {
            if stop.is_cancelled() {
                break;
            }
            let chunk = tap.drain_available();
            if !chunk.is_empty() {
                debug!(bytes = chunk.len(), "streaming output");
                if let Err(e) = writer.send_stream(&chunk).await {
                    debug!(error = %e, "stream write failed");
                    stop.cancel();
                    break;
                }
            }
            if !tap.is_active() {
                debug!("session inactive, streamer stopping");
                stop.cancel();
                break;
            }
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!("streamer stopped");
    })
}
