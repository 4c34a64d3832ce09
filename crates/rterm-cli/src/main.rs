//! rterm: remote terminal client CLI.
//!
//! Opens an interactive session against an rterm server, or runs a single
//! command and prints its output.

mod commands;
mod config;

use std::time::Duration;

use clap::{Parser, Subcommand};
use rterm_client::ConnectConfig;
use rterm_core::Marker;
use tracing::error;

/// rterm: remote terminal client
#[derive(Parser)]
#[command(name = "rterm", version, about = "Remote terminal client")]
struct Cli {
    /// Server port (overrides a port given in the target)
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Config file path
    #[arg(long = "config", global = true)]
    config: Option<String>,

    /// Expect the legacy <<EOF>> response marker
    #[arg(long, global = true)]
    legacy_marker: bool,

    /// Show streamed output as it arrives (for servers in streaming mode)
    #[arg(long, global = true)]
    stream: bool,

    /// Connect timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,

    /// Positional arguments: [host[:port]] [command...]
    ///
    /// With no subcommand the first positional arg is the server and any
    /// remaining args form a command to execute once.
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Open an interactive session
    Connect {
        /// Server as host[:port]
        target: Option<String>,
    },

    /// Run one command and print its output
    Exec {
        /// Server as host[:port]
        target: String,
        /// Command line to run
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
}

/// Quiet period that ends a streamed one-off command.
const STREAM_SETTLE: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing.
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("rterm=debug,rterm_cli=debug,rterm_client=debug,rterm_core=debug")
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("rterm=warn,rterm_cli=warn")
            .with_target(false)
            .init();
    }

    // Load config file.
    let config_path = cli.config.clone().unwrap_or_else(|| {
        let home = dirs::home_dir().unwrap_or_default();
        home.join(".rterm").join("client.toml").to_string_lossy().to_string()
    });
    let cfg = match config::Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("rterm: {e:#}");
            std::process::exit(1);
        }
    };

    // CLI flags override config.
    let stream = cli.stream || cfg.default.stream;
    let connect_config = ConnectConfig {
        marker: if cli.legacy_marker {
            Marker::Legacy
        } else {
            cfg.default.marker
        },
        timeout_secs: cli.timeout.unwrap_or(cfg.default.timeout_secs),
        stream_output: stream,
        ..ConnectConfig::default()
    };

    let (target, command) = match cli.command {
        Some(Command::Connect { target }) => (target, None),
        Some(Command::Exec { target, command }) => (Some(target), Some(command.join(" "))),
        None => {
            let mut args = cli.args.into_iter();
            let target = args.next();
            let rest: Vec<String> = args.collect();
            let command = (!rest.is_empty()).then(|| rest.join(" "));
            (target, command)
        }
    };

    let result: anyhow::Result<()> = async {
        let target = target.unwrap_or_else(|| cfg.default.host.clone());
        let (host, port) = config::parse_target(&target, cfg.default.port)?;
        let addr = config::socket_address(&host, cli.port.unwrap_or(port));
        match command {
            Some(command) => {
                let settle = stream.then_some(STREAM_SETTLE);
                commands::exec::run(&addr, connect_config, &command, settle).await
            }
            None => commands::connect::run(&addr, connect_config).await,
        }
    }
    .await;

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("rterm: {e:#}");
        std::process::exit(1);
    }
}
