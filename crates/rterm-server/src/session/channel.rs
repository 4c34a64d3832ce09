//! Child process channel: a spawned shell plus its three standard pipes.
//!
//! `ShellChannel` is the capability the session layer depends on. The
//! pipe-backed implementation spawns the interpreter with tokio's process
//! support; background pump tasks move bytes from the OS pipes into
//! per-stream buffers so that `poll_read` never blocks.

use super::interpreter::Interpreter;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use rterm_core::{RtermError, RtermResult};

/// Pump read size.
const PUMP_CHUNK_SIZE: usize = 4096;

/// Buffered bytes per stream before the pump stops reading and lets the
/// OS pipe apply back-pressure to the child.
const MAX_BUFFERED_BYTES: usize = 1024 * 1024;

/// Which of the child's output pipes to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A spawned interpreter with redirected standard streams.
pub trait ShellChannel: Send + Sync {
    /// Write all bytes to the child's stdin.
    fn write<'a>(
        &'a self,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = RtermResult<()>> + Send + 'a>>;

    /// Take up to `max_bytes` already-buffered bytes from `stream`.
    ///
    /// Returns an empty vector when nothing is buffered. Never blocks.
    fn poll_read(&self, stream: OutputStream, max_bytes: usize) -> Vec<u8>;

    /// Ask the child to exit and release everything, taking at most `timeout`
    /// before the child is killed.
    fn terminate(&self, timeout: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Whether the child has not been observed to exit.
    fn is_alive(&self) -> bool;
}

/// Creates channels; the seam that lets tests substitute scripted shells.
pub trait ChannelFactory: Send + Sync {
    fn spawn(
        &self,
        interpreter: &Interpreter,
        working_directory: &str,
    ) -> RtermResult<Arc<dyn ShellChannel>>;
}

/// Factory for real OS processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct PipeChannelFactory;

impl ChannelFactory for PipeChannelFactory {
    fn spawn(
        &self,
        interpreter: &Interpreter,
        working_directory: &str,
    ) -> RtermResult<Arc<dyn ShellChannel>> {
        Ok(Arc::new(PipeChannel::spawn(interpreter, working_directory)?))
    }
}

/// Bytes pumped out of one child pipe.
#[derive(Debug, Default)]
struct PipeBuffer {
    bytes: Mutex<Vec<u8>>,
    eof: AtomicBool,
}

impl PipeBuffer {
    fn len(&self) -> usize {
        self.bytes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn push(&self, data: &[u8]) {
        self.bytes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(data);
    }

    fn take(&self, max_bytes: usize) -> Vec<u8> {
        let mut bytes = self.bytes.lock().unwrap_or_else(|e| e.into_inner());
        let n = bytes.len().min(max_bytes);
        bytes.drain(..n).collect()
    }

    fn clear(&self) {
        self.bytes.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Pipe-backed channel to a real child process.
///
/// Parent-side pipe ends are created close-on-exec by the standard library,
/// and the child's ends are closed in the parent as soon as the process is
/// spawned, so no handle leaks into grandchildren of this server.
pub struct PipeChannel {
    program: String,
    pid: Option<u32>,
    child: tokio::sync::Mutex<Option<Child>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    stdout: Arc<PipeBuffer>,
    stderr: Arc<PipeBuffer>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    exit_line: String,
    terminated: AtomicBool,
}

impl PipeChannel {
    /// Spawn `interpreter` in `working_directory` with all three standard
    /// streams piped. Must be called from within a tokio runtime.
    pub fn spawn(interpreter: &Interpreter, working_directory: &str) -> RtermResult<Self> {
        let mut cmd = Command::new(&interpreter.program);
        cmd.args(&interpreter.args)
            .envs(interpreter.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(working_directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // On any early return below the partially built child is dropped,
        // which kills it and closes every pipe end created so far.
        let mut child = cmd
            .spawn()
            .map_err(|e| RtermError::Spawn(format!("{}: {e}", interpreter.program)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RtermError::Spawn("failed to capture shell stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RtermError::Spawn("failed to capture shell stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RtermError::Spawn("failed to capture shell stderr".into()))?;

        let pid = child.id();
        info!(
            program = %interpreter.program,
            pid = ?pid,
            cwd = %working_directory,
            "shell spawned"
        );

        let stdout_buf = Arc::new(PipeBuffer::default());
        let stderr_buf = Arc::new(PipeBuffer::default());
        let pumps = vec![
            spawn_pump(stdout, stdout_buf.clone(), OutputStream::Stdout),
            spawn_pump(stderr, stderr_buf.clone(), OutputStream::Stderr),
        ];

        Ok(Self {
            program: interpreter.program.clone(),
            pid,
            child: tokio::sync::Mutex::new(Some(child)),
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            stdout: stdout_buf,
            stderr: stderr_buf,
            pumps: Mutex::new(pumps),
            exit_line: interpreter.exit_line(),
            terminated: AtomicBool::new(false),
        })
    }

    fn buffer(&self, stream: OutputStream) -> &PipeBuffer {
        match stream {
            OutputStream::Stdout => &self.stdout,
            OutputStream::Stderr => &self.stderr,
        }
    }

    async fn write_inner(&self, data: &[u8]) -> RtermResult<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| {
            RtermError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "shell stdin is closed",
            ))
        })?;
        stdin.write_all(data).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn terminate_inner(&self, timeout: Duration) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let deadline = tokio::time::Instant::now() + timeout;

        // Cooperative phase: ask the shell to exit, then close its stdin.
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let exit_line = self.exit_line.as_bytes();
            let asked = tokio::time::timeout_at(deadline, async {
                stdin.write_all(exit_line).await?;
                stdin.flush().await
            })
            .await;
            if !matches!(asked, Ok(Ok(()))) {
                debug!(program = %self.program, "could not deliver exit instruction");
            }
        }

        // Forced phase: whatever happened above, nothing survives this block.
        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout_at(deadline, child.wait()).await {
                Ok(Ok(status)) => info!(pid = ?self.pid, %status, "shell exited"),
                Ok(Err(e)) => warn!(pid = ?self.pid, error = %e, "failed to wait for shell"),
                Err(_) => {
                    warn!(pid = ?self.pid, ?timeout, "shell ignored exit, killing");
                    if let Err(e) = child.kill().await {
                        warn!(pid = ?self.pid, error = %e, "kill failed");
                    }
                }
            }
        }

        let pumps: Vec<_> = self
            .pumps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for pump in pumps {
            pump.abort();
        }
        self.stdout.clear();
        self.stderr.clear();
        debug!(pid = ?self.pid, "shell channel released");
    }
}

impl ShellChannel for PipeChannel {
    fn write<'a>(
        &'a self,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = RtermResult<()>> + Send + 'a>> {
        Box::pin(self.write_inner(data))
    }

    fn poll_read(&self, stream: OutputStream, max_bytes: usize) -> Vec<u8> {
        self.buffer(stream).take(max_bytes)
    }

    fn terminate(&self, timeout: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.terminate_inner(timeout))
    }

    fn is_alive(&self) -> bool {
        if self.terminated.load(Ordering::SeqCst) {
            return false;
        }
        // Both pipes reaching EOF means the shell has gone away.
        !(self.stdout.eof.load(Ordering::SeqCst) && self.stderr.eof.load(Ordering::SeqCst))
    }
}

/// Copy one child pipe into `buffer` until EOF.
fn spawn_pump<R>(mut reader: R, buffer: Arc<PipeBuffer>, stream: OutputStream) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = vec![0u8; PUMP_CHUNK_SIZE];
        loop {
            while buffer.len() >= MAX_BUFFERED_BYTES {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => buffer.push(&chunk[..n]),
                Err(e) => {
                    debug!(?stream, error = %e, "pipe read failed");
                    break;
                }
            }
        }
        buffer.eof.store(true, Ordering::SeqCst);
        debug!(?stream, "pipe reached EOF");
    })
}


#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::session::interpreter::DEFAULT_POSIX_PROMPT;
    use std::time::Instant;

    async fn read_until(channel: &PipeChannel, needle: &str, within: Duration) -> String {
        let deadline = Instant::now() + within;
        let mut seen = String::new();
        while Instant::now() < deadline {
            for stream in [OutputStream::Stdout, OutputStream::Stderr] {
                seen.push_str(&String::from_utf8_lossy(&channel.poll_read(stream, 4096)));
            }
            if seen.contains(needle) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        seen
    }

    #[tokio::test]
    async fn poll_read_is_empty_before_output() {
        let sh = Interpreter::posix("/bin/sh", Some(vec![]), DEFAULT_POSIX_PROMPT);
        let channel = PipeChannel::spawn(&sh, "/").unwrap();
        // non-interactive sh prints nothing until spoken to
        assert!(channel.poll_read(OutputStream::Stdout, 512).is_empty());
        channel.terminate(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn write_then_poll_stdout_and_stderr() {
        let sh = Interpreter::posix("/bin/sh", Some(vec![]), DEFAULT_POSIX_PROMPT);
        let channel = PipeChannel::spawn(&sh, "/").unwrap();

        channel
            .write(b"echo out-marker; echo err-marker 1>&2\n")
            .await
            .unwrap();
        let seen = read_until(&channel, "err-marker", Duration::from_secs(5)).await;
        let seen = seen + &read_until(&channel, "out-marker", Duration::from_millis(200)).await;
        assert!(seen.contains("out-marker"));
        assert!(seen.contains("err-marker"));

        channel.terminate(Duration::from_secs(2)).await;
        assert!(!channel.is_alive());
    }

    #[tokio::test]
    async fn poll_read_respects_max_bytes() {
        let sh = Interpreter::posix("/bin/sh", Some(vec![]), DEFAULT_POSIX_PROMPT);
        let channel = PipeChannel::spawn(&sh, "/").unwrap();
        channel.write(b"echo 0123456789\n").await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut first = Vec::new();
        while first.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
            first = channel.poll_read(OutputStream::Stdout, 4);
        }
        assert!(!first.is_empty() && first.len() <= 4);
        channel.terminate(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn terminate_kills_a_shell_that_ignores_exit() {
        // a shell blocked in a foreground command never reads `exit`
        let sh = Interpreter::posix("/bin/sh", Some(vec![]), DEFAULT_POSIX_PROMPT);
        let channel = PipeChannel::spawn(&sh, "/").unwrap();
        channel.write(b"sleep 30\n").await.unwrap();

        let started = Instant::now();
        channel.terminate(Duration::from_millis(200)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!channel.is_alive());
        assert!(channel.write(b"echo late\n").await.is_err());
    }

    #[tokio::test]
    async fn terminate_shares_one_deadline() {
        // a busy shell stops reading stdin, so a large exit line blocks
        let mut sh = Interpreter::posix("/bin/sh", Some(vec![]), DEFAULT_POSIX_PROMPT);
        sh.exit_instruction = Box::leak("#".repeat(1 << 20).into_boxed_str());
        let channel = PipeChannel::spawn(&sh, "/").unwrap();
        channel.write(b"sleep 30\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        channel.terminate(Duration::from_millis(300)).await;
        assert!(started.elapsed() < Duration::from_millis(550));
        assert!(!channel.is_alive());
    }

    #[tokio::test]
    async fn spawn_failure_is_spawn_error() {
        let missing = Interpreter::posix("/definitely/not/a/shell", None, DEFAULT_POSIX_PROMPT);
        match PipeChannel::spawn(&missing, "/") {
            Err(RtermError::Spawn(msg)) => assert!(msg.contains("/definitely/not/a/shell")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("spawn should fail"),
        }
    }

    #[tokio::test]
    async fn terminate_twice_is_harmless() {
        let sh = Interpreter::posix("/bin/sh", Some(vec![]), DEFAULT_POSIX_PROMPT);
        let channel = PipeChannel::spawn(&sh, "/").unwrap();
        channel.terminate(Duration::from_secs(2)).await;
        channel.terminate(Duration::from_secs(2)).await;
        assert!(!channel.is_alive());
    }
}
