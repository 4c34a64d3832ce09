//! Server configuration: TOML file + CLI overrides.

use crate::session::directory;
use crate::session::{DeliveryMode, Interpreter, SessionOptions};
use crate::session::interpreter::DEFAULT_POSIX_PROMPT;
use rterm_core::{Marker, RtermError, RtermResult};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub session: SessionSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default)]
    pub marker: Marker,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            buffer_size: default_buffer_size(),
            max_sessions: default_max_sessions(),
            marker: Marker::default(),
        }
    }
}

/// `[session]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default)]
    pub mode: DeliveryMode,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_terminate_timeout_ms")]
    pub terminate_timeout_ms: u64,
    /// Starting directory; the server's own cwd when unset.
    pub working_dir: Option<String>,
    /// Interpreter program; the platform shell when unset.
    pub shell: Option<String>,
    pub shell_args: Option<Vec<String>>,
    #[serde(default = "default_prompt")]
    pub prompt: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            mode: DeliveryMode::default(),
            command_timeout_ms: default_command_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            terminate_timeout_ms: default_terminate_timeout_ms(),
            working_dir: None,
            shell: None,
            shell_args: None,
            prompt: default_prompt(),
        }
    }
}

fn default_port() -> u16 {
    rterm_core::DEFAULT_PORT
}
fn default_bind() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}
fn default_buffer_size() -> usize {
    rterm_core::DEFAULT_BUFFER_SIZE
}
fn default_max_sessions() -> usize {
    64
}
fn default_command_timeout_ms() -> u64 {
    5000
}
fn default_poll_interval_ms() -> u64 {
    50
}
fn default_terminate_timeout_ms() -> u64 {
    2000
}
fn default_prompt() -> String {
    DEFAULT_POSIX_PROMPT.to_string()
}

/// Values given on the command line; `None` leaves the file value alone.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub bind: Option<IpAddr>,
    pub buffer_size: Option<usize>,
    pub max_sessions: Option<usize>,
    pub mode: Option<DeliveryMode>,
    pub command_timeout_ms: Option<u64>,
    pub working_dir: Option<String>,
    pub shell: Option<String>,
    pub legacy_marker: bool,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub buffer_size: usize,
    pub max_sessions: usize,
    pub marker: Marker,
    pub mode: DeliveryMode,
    pub working_dir: String,
    pub interpreter: Interpreter,
    pub session: SessionOptions,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> RtermResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| RtermError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, cli)
    }

    /// Merge a parsed file with CLI overrides and validate the result.
    pub fn resolve(file: ConfigFile, cli: CliOverrides) -> RtermResult<Self> {
        let server = file.server;
        let session = file.session;

        let port = cli.port.unwrap_or(server.port);
        let bind = cli.bind.unwrap_or(server.bind);
        let buffer_size = cli.buffer_size.unwrap_or(server.buffer_size);
        if buffer_size == 0 {
            return Err(RtermError::Config("buffer_size must be positive".into()));
        }
        let max_sessions = cli.max_sessions.unwrap_or(server.max_sessions);
        if max_sessions == 0 {
            return Err(RtermError::Config("max_sessions must be positive".into()));
        }
        let marker = if cli.legacy_marker {
            Marker::Legacy
        } else {
            server.marker
        };

        let working_dir = match cli.working_dir.or(session.working_dir) {
            Some(dir) => {
                let dir = expand_tilde_str(&dir).to_string_lossy().into_owned();
                if !directory::is_directory(&dir) {
                    return Err(RtermError::Config(format!(
                        "working_dir is not a directory: {dir}"
                    )));
                }
                dir
            }
            None => directory::current_dir_string(),
        };

        let shell = cli.shell.or(session.shell);
        let interpreter =
            Interpreter::from_config(shell.as_deref(), session.shell_args, &session.prompt);

        let options = SessionOptions {
            command_timeout: Duration::from_millis(
                cli.command_timeout_ms.unwrap_or(session.command_timeout_ms),
            ),
            poll_interval: Duration::from_millis(session.poll_interval_ms.max(1)),
            terminate_timeout: Duration::from_millis(session.terminate_timeout_ms),
            read_chunk: buffer_size,
        };

        Ok(Self {
            listen_addr: SocketAddr::new(bind, port),
            buffer_size,
            max_sessions,
            marker,
            mode: cli.mode.unwrap_or(session.mode),
            working_dir,
            interpreter,
            session: options,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ServerConfig::resolve(ConfigFile::default(), CliOverrides::default()).unwrap();
        assert_eq!(cfg.listen_addr, "0.0.0.0:27015".parse().unwrap());
        assert_eq!(cfg.buffer_size, 4096);
        assert_eq!(cfg.max_sessions, 64);
        assert_eq!(cfg.marker, Marker::Standard);
        assert_eq!(cfg.mode, DeliveryMode::RequestResponse);
        assert_eq!(cfg.session.command_timeout, Duration::from_millis(5000));
        assert_eq!(cfg.session.poll_interval, Duration::from_millis(50));
        assert_eq!(cfg.session.terminate_timeout, Duration::from_millis(2000));
    }

    #[test]
    fn parses_toml() {
        let dir = tempfile::tempdir().unwrap();
        let toml = format!(
            r#"
[server]
port = 4000
bind = "127.0.0.1"
buffer_size = 512
marker = "legacy"

[session]
mode = "streaming"
command_timeout_ms = 750
working_dir = '{}'
shell = "/bin/bash"
prompt = "$ "
"#,
            dir.path().display()
        );
        let file: ConfigFile = toml::from_str(&toml).unwrap();
        let cfg = ServerConfig::resolve(file, CliOverrides::default()).unwrap();

        assert_eq!(cfg.listen_addr, "127.0.0.1:4000".parse().unwrap());
        assert_eq!(cfg.buffer_size, 512);
        assert_eq!(cfg.session.read_chunk, 512);
        assert_eq!(cfg.marker, Marker::Legacy);
        assert_eq!(cfg.mode, DeliveryMode::Streaming);
        assert_eq!(cfg.session.command_timeout, Duration::from_millis(750));
        assert_eq!(cfg.working_dir, dir.path().to_string_lossy());
        assert_eq!(cfg.interpreter.program, "/bin/bash");
        assert_eq!(cfg.interpreter.prompt_terminator, '$');
    }

    #[test]
    fn cli_overrides_file() {
        let file: ConfigFile = toml::from_str("[server]\nport = 4000\n").unwrap();
        let cli = CliOverrides {
            port: Some(5000),
            mode: Some(DeliveryMode::Streaming),
            command_timeout_ms: Some(100),
            legacy_marker: true,
            ..CliOverrides::default()
        };
        let cfg = ServerConfig::resolve(file, cli).unwrap();
        assert_eq!(cfg.listen_addr.port(), 5000);
        assert_eq!(cfg.mode, DeliveryMode::Streaming);
        assert_eq!(cfg.session.command_timeout, Duration::from_millis(100));
        assert_eq!(cfg.marker, Marker::Legacy);
    }

    #[test]
    fn rejects_missing_working_dir() {
        let cli = CliOverrides {
            working_dir: Some("/definitely/not/here".into()),
            ..CliOverrides::default()
        };
        assert!(matches!(
            ServerConfig::resolve(ConfigFile::default(), cli),
            Err(RtermError::Config(_))
        ));
    }

    #[test]
    fn rejects_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(&path, "[server]\nport = \"not a number\"\n").unwrap();
        assert!(matches!(
            ServerConfig::load(Some(&path), CliOverrides::default()),
            Err(RtermError::Config(_))
        ));
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServerConfig::load(Some(&dir.path().join("absent.toml")), CliOverrides::default())
            .unwrap();
        assert_eq!(cfg.listen_addr.port(), 27015);
    }
}
