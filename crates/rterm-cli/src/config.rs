//! Client configuration at `~/.rterm/client.toml`.
//!
//! Provides default host, port, marker, and output settings.
//! CLI flags always override config file values.

use anyhow::{Context, Result};
use rterm_core::{Marker, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Default connection settings.
    #[serde(default)]
    pub default: DefaultConfig,
}

/// Default connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultConfig {
    /// Default server host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Default server port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Response marker the server uses: "standard" or "legacy".
    #[serde(default)]
    pub marker: Marker,

    /// Show streamed output as it arrives instead of waiting for markers.
    #[serde(default)]
    pub stream: bool,

    /// Connect timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DefaultConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            marker: Marker::default(),
            stream: false,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_timeout_secs() -> u64 {
    10
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &str) -> Result<Self> {
        let path = Path::new(path);
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }
}

/// Parse a `host[:port]` target into `(host, port)`.
///
/// Bare IPv6 addresses must be bracketed when a port is given
/// (`[::1]:27015`); an unbracketed address containing several colons is
/// taken as a host without a port.
pub fn parse_target(target: &str, default_port: u16) -> Result<(String, u16)> {
    if target.is_empty() {
        anyhow::bail!("empty host");
    }

    if let Some(rest) = target.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .with_context(|| format!("unterminated '[' in target '{target}'"))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(port, target)?,
            None if tail.is_empty() => default_port,
            None => anyhow::bail!("unexpected '{tail}' in target '{target}'"),
        };
        return Ok((host.to_string(), port));
    }

    match target.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            if host.is_empty() {
                anyhow::bail!("empty host in target '{target}'");
            }
            Ok((host.to_string(), parse_port(port, target)?))
        }
        _ => Ok((target.to_string(), default_port)),
    }
}

fn parse_port(port: &str, target: &str) -> Result<u16> {
    port.parse::<u16>()
        .with_context(|| format!("invalid port '{port}' in target '{target}'"))
}

/// Format `host` and `port` as a connect address.
pub fn socket_address(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
