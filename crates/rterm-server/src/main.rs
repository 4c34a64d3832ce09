//! rterm-server: remote terminal server.
//!
//! Accepts plain TCP connections and gives each client a persistent shell
//! session driven over a marker-delimited text protocol.

mod config;
mod handler;
mod registry;
mod server;
mod session;
mod streamer;
mod transport;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use server::RtermServer;
use session::DeliveryMode;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// rterm-server: remote terminal server
#[derive(Parser, Debug)]
#[command(name = "rterm-server", version, about = "Remote terminal server")]
struct Cli {
    /// Listen port [default: 27015]
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address [default: 0.0.0.0]
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Config file path
    #[arg(long, default_value = "~/.rterm/server.toml")]
    config: String,

    /// How output is delivered to clients
    #[arg(long, value_enum)]
    mode: Option<DeliveryMode>,

    /// Per-read buffer size and maximum command length in bytes
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Command timeout in milliseconds (request-response mode)
    #[arg(long)]
    command_timeout_ms: Option<u64>,

    /// Starting directory for new sessions
    #[arg(long)]
    working_dir: Option<String>,

    /// Shell program to run for each session
    #[arg(long)]
    shell: Option<String>,

    /// Frame responses with the legacy <<EOF>> marker
    #[arg(long)]
    legacy_marker: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting rterm-server");

    // Load server config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let overrides = CliOverrides {
        port: cli.port,
        bind: cli.bind,
        buffer_size: cli.buffer_size,
        max_sessions: cli.max_sessions,
        mode: cli.mode,
        command_timeout_ms: cli.command_timeout_ms,
        working_dir: cli.working_dir,
        shell: cli.shell,
        legacy_marker: cli.legacy_marker,
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let server = RtermServer::new(server_config);

    // Run until shutdown signal; the server tells clients before returning
    if let Err(e) = server.run(shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("rterm-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
