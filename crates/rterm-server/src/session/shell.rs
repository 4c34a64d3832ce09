//! Persistent shell session.
//!
//! A `ShellSession` owns one child interpreter for the lifetime of a client
//! connection and tracks its working directory. Before use it is turned into
//! one of two delivery handles:
//!
//! - [`SyncSession`]: request/response. Each command is written to the
//!   shell and its output is collected until the shell prints its prompt
//!   again.
//! - [`StreamingSession`] + [`OutputTap`]: commands are only written; the
//!   tap hands out whatever the shell printed, with no completion detection.
//!
//! Completion detection in request/response mode is a heuristic: the
//! response ends when the accumulated output ends in the interpreter's
//! prompt terminator. Output that legitimately ends in that character, or a
//! command that never returns to the prompt, truncates or times out.

use super::channel::{ChannelFactory, OutputStream, ShellChannel};
use super::directory::{self, PATH_NOT_FOUND_MESSAGE};
use super::interpreter::{Interpreter, InterpreterKind};
use rterm_core::{CommandLine, RtermError, RtermResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Response for a command that completed without printing anything.
pub const NO_OUTPUT_MESSAGE: &str = "Command executed successfully (no output)";

/// How command output reaches the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryMode {
    /// One framed response per command.
    #[default]
    RequestResponse,
    /// Output forwarded as it appears, independent of commands.
    Streaming,
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryMode::RequestResponse => f.write_str("request-response"),
            DeliveryMode::Streaming => f.write_str("streaming"),
        }
    }
}

/// Timing knobs for a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Upper bound for one request/response cycle.
    pub command_timeout: Duration,
    /// Sleep between polls of the output buffers.
    pub poll_interval: Duration,
    /// How long the shell gets to exit on its own at teardown.
    pub terminate_timeout: Duration,
    /// Maximum bytes taken per poll of one stream.
    pub read_chunk: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_millis(5000),
            poll_interval: Duration::from_millis(50),
            terminate_timeout: Duration::from_millis(2000),
            read_chunk: rterm_core::DEFAULT_BUFFER_SIZE,
        }
    }
}

/// State shared between the command side and the output tap.
struct SessionCore {
    channel: Arc<dyn ShellChannel>,
    interpreter: Interpreter,
    options: SessionOptions,
    active: AtomicBool,
}

impl SessionCore {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && self.channel.is_alive()
    }

    /// Take everything currently buffered on `stream`.
    fn drain(&self, stream: OutputStream) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let chunk = self.channel.poll_read(stream, self.options.read_chunk);
            if chunk.is_empty() {
                return out;
            }
            out.extend_from_slice(&chunk);
        }
    }

    async fn shutdown(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.channel.terminate(self.options.terminate_timeout).await;
            info!(program = %self.interpreter.program, "shell session closed");
        }
    }
}

/// A live shell plus its tracked working directory.
pub struct ShellSession {
    core: Arc<SessionCore>,
    working_directory: String,
    home: Option<PathBuf>,
}

/// A session turned into its delivery-mode handles.
pub enum Delivery {
    RequestResponse(SyncSession),
    Streaming(StreamingSession, OutputTap),
}

impl ShellSession {
    /// Spawn the interpreter through `factory` in `working_directory`.
    pub fn open(
        factory: &dyn ChannelFactory,
        interpreter: Interpreter,
        working_directory: String,
        options: SessionOptions,
    ) -> RtermResult<Self> {
        let channel = factory.spawn(&interpreter, &working_directory)?;
        Ok(Self::with_channel(channel, interpreter, working_directory, options))
    }

    /// Wrap an already spawned channel.
    pub fn with_channel(
        channel: Arc<dyn ShellChannel>,
        interpreter: Interpreter,
        working_directory: String,
        options: SessionOptions,
    ) -> Self {
        Self {
            core: Arc::new(SessionCore {
                channel,
                interpreter,
                options,
                active: AtomicBool::new(true),
            }),
            working_directory,
            home: dirs::home_dir(),
        }
    }

    pub fn working_directory(&self) -> &str {
        &self.working_directory
    }

    pub fn is_active(&self) -> bool {
        self.core.is_active()
    }

    /// Enter `mode`. Request/response sessions first consume the shell's
    /// banner and initial prompt.
    pub async fn into_delivery(self, mode: DeliveryMode) -> Delivery {
        match mode {
            DeliveryMode::RequestResponse => {
                let mut sync = SyncSession {
                    session: self,
                    stdout: Utf8Carry::default(),
                    stderr: Utf8Carry::default(),
                    prompt_owed: false,
                };
                sync.settle().await;
                Delivery::RequestResponse(sync)
            }
            DeliveryMode::Streaming => {
                let tap = OutputTap {
                    core: self.core.clone(),
                    stdout: Utf8Carry::default(),
                    stderr: Utf8Carry::default(),
                };
                Delivery::Streaming(StreamingSession { session: self }, tap)
            }
        }
    }

    async fn write_command(&self, command: &str) -> RtermResult<()> {
        if !self.core.is_active() {
            return Err(RtermError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "shell session is not active",
            )));
        }
        debug!(command = %command, "writing to shell");
        let line = self.core.interpreter.command_line(command);
        self.core.channel.write(line.as_bytes()).await
    }

    /// Resolve a `cd` argument; `None` when the target is not a directory.
    fn directory_target(&self, arg: &str) -> Option<String> {
        let target = directory::resolve(&self.working_directory, arg, self.home.as_deref());
        if directory::is_directory(&target) {
            Some(target)
        } else {
            debug!(target = %target, "cd target not found");
            None
        }
    }

    /// Tell the shell to move and record the new directory.
    async fn move_to(&mut self, target: &str) -> RtermResult<()> {
        let instruction = self.core.interpreter.change_directory_instruction(target);
        self.write_command(&instruction).await?;
        self.working_directory = target.to_string();
        Ok(())
    }

    /// Terminate the shell.
    pub async fn close(&self) {
        self.core.shutdown().await;
    }
}

/// Request/response handle: one collected result per command.
pub struct SyncSession {
    session: ShellSession,
    stdout: Utf8Carry,
    stderr: Utf8Carry,
    /// A timed-out command has not printed its prompt yet.
    prompt_owed: bool,
}

impl SyncSession {
    pub fn working_directory(&self) -> &str {
        self.session.working_directory()
    }

    pub fn is_active(&self) -> bool {
        self.session.is_active()
    }

    /// Run `command` with the configured command timeout.
    pub async fn execute(&mut self, command: &str) -> RtermResult<String> {
        let timeout = self.session.core.options.command_timeout;
        self.execute_with_timeout(command, timeout).await
    }

    /// Run `command` and return its output with the echo and trailing prompt
    /// removed. Timing out is reported as text and leaves the session usable.
    ///
    /// Fails only when the shell cannot be written to or has exited.
    pub async fn execute_with_timeout(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> RtermResult<String> {
        let deadline = Instant::now() + timeout;
        if !self.prompt_owed {
            self.discard_stale();
        }

        let command = match CommandLine::parse(command) {
            CommandLine::ChangeDirectory(arg) => {
                return self.change_directory(arg, deadline, timeout).await
            }
            CommandLine::PrintDirectory => self.session.core.interpreter.print_directory,
            _ => command,
        };

        if !self.catch_up(deadline).await? {
            warn!(command = %command, ?timeout, "shell still busy with an earlier command");
            return Ok(timed_out(timeout));
        }
        self.session.write_command(command).await?;
        match self.wait_for_prompt(remaining(deadline)).await? {
            Some(raw) => Ok(self.clean(raw)),
            None => {
                warn!(command = %command, ?timeout, "command timed out");
                self.prompt_owed = true;
                Ok(timed_out(timeout))
            }
        }
    }

    async fn change_directory(
        &mut self,
        arg: &str,
        deadline: Instant,
        timeout: Duration,
    ) -> RtermResult<String> {
        let Some(target) = self.session.directory_target(arg) else {
            return Ok(PATH_NOT_FOUND_MESSAGE.to_string());
        };
        if !self.catch_up(deadline).await? {
            warn!(target = %target, ?timeout, "shell still busy with an earlier command");
            return Ok(timed_out(timeout));
        }
        self.session.move_to(&target).await?;
        if self.wait_for_prompt(remaining(deadline)).await?.is_none() {
            warn!(target = %target, "no prompt after changing directory");
            self.prompt_owed = true;
        }
        info!(cwd = %target, "working directory changed");
        Ok(target)
    }

    /// Wait until the shell prints the prompt a timed-out command still owes,
    /// dropping everything before it. `false` if it has not shown up by
    /// `deadline`.
    async fn catch_up(&mut self, deadline: Instant) -> RtermResult<bool> {
        if !self.prompt_owed {
            return Ok(true);
        }
        match self.wait_for_prompt(remaining(deadline)).await? {
            Some(stale) => {
                debug!(bytes = stale.len(), "shell caught up after a timeout");
                self.prompt_owed = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Swallow the start-up banner and first prompt.
    async fn settle(&mut self) {
        let timeout = self.session.core.options.command_timeout;
        match self.wait_for_prompt(timeout).await {
            Ok(Some(banner)) => debug!(bytes = banner.len(), "shell banner consumed"),
            Ok(None) => warn!(?timeout, "shell showed no initial prompt"),
            Err(e) => warn!(error = %e, "shell exited during start-up"),
        }
    }

    /// Drop output left over from an earlier command that timed out.
    fn discard_stale(&mut self) {
        let mut stale = String::new();
        self.collect(&mut stale);
        self.stdout = Utf8Carry::default();
        self.stderr = Utf8Carry::default();
        if !stale.is_empty() {
            debug!(bytes = stale.len(), "discarded stale shell output");
        }
    }

    fn collect(&mut self, text: &mut String) {
        let core = &self.session.core;
        text.push_str(&self.stdout.push(&core.drain(OutputStream::Stdout)));
        text.push_str(&self.stderr.push(&core.drain(OutputStream::Stderr)));
    }

    /// Poll until the output ends in the prompt terminator. Returns the text
    /// before the last terminator, or `None` on timeout.
    async fn wait_for_prompt(&mut self, timeout: Duration) -> RtermResult<Option<String>> {
        let poll_interval = self.session.core.options.poll_interval;
        let terminator = self.session.core.interpreter.prompt_terminator;
        let deadline = Instant::now() + timeout;
        let mut text = String::new();

        loop {
            self.collect(&mut text);

            let visible = text.trim_end_matches(' ');
            if visible.ends_with(terminator) {
                let mut head = visible[..visible.len() - terminator.len_utf8()].to_string();
                let prompt = self
                    .session
                    .core
                    .interpreter
                    .prompt_text(&self.session.working_directory);
                strip_prompt(&mut head, &prompt, self.session.core.interpreter.kind);
                // stdout that raced the prompt on stderr still belongs here
                let late = self
                    .stdout
                    .push(&self.session.core.drain(OutputStream::Stdout));
                head.push_str(&late);
                return Ok(Some(head));
            }

            if !self.session.core.channel.is_alive() {
                return Err(RtermError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "shell exited",
                )));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    fn clean(&self, raw: String) -> String {
        let body = if self.session.core.interpreter.echoes_input {
            raw.split_once('\n').map(|(_, rest)| rest).unwrap_or("")
        } else {
            raw.as_str()
        };
        let body = body.trim_end();
        if body.is_empty() {
            NO_OUTPUT_MESSAGE.to_string()
        } else {
            body.to_string()
        }
    }

    /// Terminate the shell.
    pub async fn close(&self) {
        self.session.close().await;
    }
}

fn timed_out(timeout: Duration) -> String {
    format!("Error: Command timed out after {} ms", timeout.as_millis())
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// Remove the prompt text that preceded the terminator.
fn strip_prompt(head: &mut String, prompt: &str, kind: InterpreterKind) {
    if !prompt.is_empty() && head.ends_with(prompt) {
        head.truncate(head.len() - prompt.len());
        return;
    }
    // cmd.exe prompts sit on their own line; drop it even if the directory
    // changed behind our back
    if kind == InterpreterKind::Cmd {
        let line_start = head.rfind('\n').map(|i| i + 1).unwrap_or(0);
        head.truncate(line_start);
    }
}

/// Streaming command handle. Output is read only through the paired
/// [`OutputTap`].
pub struct StreamingSession {
    session: ShellSession,
}

impl StreamingSession {
    pub fn working_directory(&self) -> &str {
        self.session.working_directory()
    }

    pub fn is_active(&self) -> bool {
        self.session.is_active()
    }

    /// Write `command` without waiting for completion.
    ///
    /// Returns `Some(text)` when the command is answered here rather than by
    /// the shell's own output (directory changes).
    pub async fn send_only(&mut self, command: &str) -> RtermResult<Option<String>> {
        match CommandLine::parse(command) {
            CommandLine::ChangeDirectory(arg) => match self.session.directory_target(arg) {
                Some(target) => {
                    self.session.move_to(&target).await?;
                    info!(cwd = %target, "working directory changed");
                    Ok(Some(target))
                }
                None => Ok(Some(PATH_NOT_FOUND_MESSAGE.to_string())),
            },
            CommandLine::PrintDirectory => {
                let instruction = self.session.core.interpreter.print_directory;
                self.session.write_command(instruction).await?;
                Ok(None)
            }
            _ => {
                self.session.write_command(command).await?;
                Ok(None)
            }
        }
    }

    /// Terminate the shell. Stop whoever holds the tap first.
    pub async fn close(&self) {
        self.session.close().await;
    }
}

/// The single reader of a streaming session's output.
pub struct OutputTap {
    core: Arc<SessionCore>,
    stdout: Utf8Carry,
    stderr: Utf8Carry,
}

impl OutputTap {
    /// Everything buffered right now, stdout before stderr. Never blocks.
    pub fn drain_available(&mut self) -> String {
        let mut text = self.stdout.push(&self.core.drain(OutputStream::Stdout));
        text.push_str(&self.stderr.push(&self.core.drain(OutputStream::Stderr)));
        text
    }

    pub fn is_active(&self) -> bool {
        self.core.is_active()
    }

    pub fn poll_interval(&self) -> Duration {
        self.core.options.poll_interval
    }
}

/// Decodes a byte stream as UTF-8, holding back a sequence split across
/// reads until the rest arrives.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn push(&mut self, bytes: &[u8]) -> String {
        if bytes.is_empty() && self.pending.is_empty() {
            return String::new();
        }
        self.pending.extend_from_slice(bytes);
        let cut = self.pending.len() - incomplete_tail(&self.pending);
        let text = String::from_utf8_lossy(&self.pending[..cut]).into_owned();
        self.pending.drain(..cut);
        text
    }
}

/// Length of an unfinished multi-byte sequence at the end of `buf`.
fn incomplete_tail(buf: &[u8]) -> usize {
    for back in 1..=buf.len().min(3) {
        let byte = buf[buf.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = match byte {
            0xF0..=0xF7 => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}
