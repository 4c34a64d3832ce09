//! `rterm [host]`: interactive remote shell.
//!
//! Reads command lines from stdin and sends them to the server while a
//! separate branch prints responses as they arrive, so output from slow or
//! streaming commands shows up without waiting for the next input line.

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use rterm_client::{ConnectConfig, RtermClient, ServerEvent};
use rterm_core::is_exit;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::time::{self, Instant};
use tracing::{info, warn};

use super::GOODBYE_MESSAGE;

/// Local input prompt.
pub const PROMPT: &str = "remote> ";

/// How long to wait for the farewell after sending exit.
const EXIT_GRACE: Duration = Duration::from_millis(500);

/// Connect to `addr` and run the interactive loop on stdin/stdout.
pub async fn run(addr: &str, config: ConnectConfig) -> Result<()> {
    info!(addr, "connecting");
    let client = RtermClient::connect(addr, config)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    let stdin = BufReader::new(tokio::io::stdin());
    interact(client, stdin, std::io::stdout()).await
}

/// Drive one interactive session over `input` and `out`.
pub async fn interact<R, W>(mut client: RtermClient, input: R, mut out: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    writeln!(out, "Remote Terminal Client (Async Mode)")?;
    writeln!(out, "Type commands to execute on the remote server.")?;
    writeln!(out, "Responses will appear automatically as they arrive.")?;
    writeln!(out, "Type 'exit' or 'quit' to disconnect.")?;
    writeln!(out)?;
    write!(out, "{PROMPT}")?;
    out.flush()?;

    let mut lines = input.lines();
    loop {
        tokio::select! {
            event = client.next_event() => match event {
                Some(ServerEvent::Response(text)) => {
                    write!(out, "\r{text}\n{PROMPT}")?;
                    out.flush()?;
                }
                Some(ServerEvent::Output(text)) => {
                    print_output(&mut out, &text)?;
                    write!(out, "{PROMPT}")?;
                    out.flush()?;
                }
                Some(ServerEvent::Closed) | None => {
                    writeln!(out, "\rConnection closed by server")?;
                    break;
                }
            },
            line = lines.next_line() => {
                let command = match line.context("failed to read input")? {
                    Some(line) => line,
                    // End of input behaves like typing exit.
                    None => "exit".to_string(),
                };
                let command = command.trim();
                if command.is_empty() {
                    write!(out, "{PROMPT}")?;
                    out.flush()?;
                    continue;
                }
                if let Err(e) = client.send_command(command).await {
                    warn!(error = %e, "send failed");
                    writeln!(out, "\rFailed to send command: {e}")?;
                    break;
                }
                if is_exit(command) {
                    await_goodbye(&mut client, &mut out).await?;
                    break;
                }
            }
        }
    }

    out.flush()?;
    client.disconnect().await;
    Ok(())
}

/// Print whatever arrives within [`EXIT_GRACE`], stopping at the farewell.
async fn await_goodbye<W: Write>(client: &mut RtermClient, out: &mut W) -> Result<()> {
    let deadline = Instant::now() + EXIT_GRACE;
    loop {
        match time::timeout_at(deadline, client.next_event()).await {
            Ok(Some(ServerEvent::Response(text))) => {
                writeln!(out, "\r{text}")?;
                if text.ends_with(GOODBYE_MESSAGE) {
                    break;
                }
            }
            Ok(Some(ServerEvent::Output(text))) => print_output(out, &text)?,
            Ok(Some(ServerEvent::Closed)) | Ok(None) | Err(_) => break,
        }
    }
    out.flush()?;
    Ok(())
}

fn print_output<W: Write>(out: &mut W, text: &str) -> Result<()> {
    write!(out, "\r{text}")?;
    if !text.ends_with('\n') {
        writeln!(out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn frame(body: &str) -> Vec<u8> {
        rterm_core::frame_response(body, rterm_core::Marker::Standard).into_bytes()
    }

    #[tokio::test]
    async fn runs_commands_until_exit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            write.write_all(&frame("Welcome")).await.unwrap();
            let mut lines = tokio::io::BufReader::new(read).lines();
            let mut seen = Vec::new();
            while let Some(line) = lines.next_line().await.unwrap() {
                if line == "exit" {
                    write.write_all(&frame(GOODBYE_MESSAGE)).await.unwrap();
                    seen.push(line);
                    break;
                }
                write.write_all(&frame(&format!("ran {line}"))).await.unwrap();
                seen.push(line);
            }
            seen
        });

        let client = RtermClient::connect(&addr, ConnectConfig::default())
            .await
            .unwrap();
        let input: &[u8] = b"echo hi\n\n   \nexit\n";
        let mut out = Vec::new();
        interact(client, input, &mut out).await.unwrap();

        let seen = server.await.unwrap();
        assert_eq!(seen, vec!["echo hi".to_string(), "exit".to_string()]);

        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with("Remote Terminal Client (Async Mode)\n"));
        let ran = out.find("ran echo hi").unwrap();
        let goodbye = out.find(GOODBYE_MESSAGE).unwrap();
        assert!(ran < goodbye);
    }

    #[tokio::test]
    async fn reports_server_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&frame("Error: Server busy")).await.unwrap();
        });

        let client = RtermClient::connect(&addr, ConnectConfig::default())
            .await
            .unwrap();
        // Input that never produces a line.
        let (idle, _keep_open) = tokio::io::duplex(64);
        let mut out = Vec::new();
        interact(client, BufReader::new(idle), &mut out).await.unwrap();

        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("\rError: Server busy\n"));
        assert!(out.ends_with("Connection closed by server\n"));
    }

    #[tokio::test]
    async fn end_of_input_sends_exit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = String::new();
            socket.read_to_string(&mut received).await.unwrap();
            received
        });

        let client = RtermClient::connect(&addr, ConnectConfig::default())
            .await
            .unwrap();
        let input: &[u8] = b"";
        interact(client, input, Vec::new()).await.unwrap();

        assert_eq!(server.await.unwrap(), "exit\n");
    }
}
