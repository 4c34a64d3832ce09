//! `rterm host command...`: one-off remote command execution.
//!
//! Connects, waits for the welcome, sends the command followed by `exit`,
//! prints everything up to the farewell and disconnects.

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use rterm_client::{ConnectConfig, RtermClient, ServerEvent};
use rterm_core::is_exit;
use tokio::time;
use tracing::{debug, info};

use super::GOODBYE_MESSAGE;

/// Execute `command` on the server at `addr` and print its output.
///
/// With streamed output the server sends no marker after a command, so the
/// output is collected until the connection has been quiet for `settle`
/// before `exit` is sent.
pub async fn run(addr: &str, config: ConnectConfig, command: &str, settle: Option<Duration>) -> Result<()> {
    info!(addr, command, "exec");
    let mut client = RtermClient::connect(addr, config)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    let result = execute(&mut client, command, settle, &mut std::io::stdout()).await;
    client.disconnect().await;
    result
}

/// Run one command on an open connection.
pub async fn execute<W: Write>(
    client: &mut RtermClient,
    command: &str,
    settle: Option<Duration>,
    out: &mut W,
) -> Result<()> {
    let welcome = client
        .next_response()
        .await
        .context("server did not send a welcome")?;
    if welcome.starts_with("Error:") {
        anyhow::bail!("{welcome}");
    }
    debug!(welcome = %welcome, "session ready");

    client.send_command(command).await?;

    if let Some(quiet) = settle {
        while let Ok(event) = time::timeout(quiet, client.next_event()).await {
            match event {
                Some(ServerEvent::Response(text)) => writeln!(out, "{text}")?,
                Some(ServerEvent::Output(text)) => write!(out, "{text}")?,
                Some(ServerEvent::Closed) | None => {
                    out.flush()?;
                    return Ok(());
                }
            }
        }
    }

    if !is_exit(command) {
        client.send_command("exit").await?;
    }

    loop {
        match client.next_event().await {
            Some(ServerEvent::Response(text)) => {
                if let Some(rest) = text.strip_suffix(GOODBYE_MESSAGE) {
                    let rest = rest.trim_end();
                    if !rest.is_empty() {
                        writeln!(out, "{rest}")?;
                    }
                    break;
                }
                writeln!(out, "{text}")?;
            }
            Some(ServerEvent::Output(text)) => write!(out, "{text}")?,
            Some(ServerEvent::Closed) | None => break,
        }
    }
    out.flush()?;
    Ok(())
}
