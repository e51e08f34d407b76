//! espterm: manual network terminal for ESP32-class devices.
//!
//! Opens a TCP connection to the device, exchanges newline-delimited text
//! commands and responses, and shows a timestamped, colorized log.

mod commands;
mod config;
mod terminal;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::error;

/// espterm: network terminal for embedded devices
#[derive(Parser)]
#[command(name = "espterm", version, about = "Manual TCP terminal for ESP32-class devices")]
struct Cli {
    /// Device port (when the target does not include one)
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Connect timeout in milliseconds
    #[arg(short = 't', long = "timeout", global = true)]
    timeout: Option<u64>,

    /// Config file path
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,

    /// Device to monitor when no subcommand is given: HOST[:PORT]
    target: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Open the interactive monitor
    Monitor {
        /// Device in HOST[:PORT] format (defaults to the configured host)
        target: Option<String>,
    },

    /// Send commands, print the replies, and exit
    Send {
        /// Device in HOST[:PORT] format
        target: String,

        /// Commands to send, one line each
        #[arg(required = true)]
        commands: Vec<String>,

        /// How long to collect replies after the last command, in milliseconds
        #[arg(short, long, default_value_t = 1000)]
        wait: u64,

        /// Print the log as JSON lines
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing. Diagnostics go to stderr; stdout is the log view.
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("espterm=debug,espterm_cli=debug,espterm_client=debug,espterm_core=debug")
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("espterm=warn,espterm_cli=warn,espterm_client=error")
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("espterm: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(config::Config::default_path);
    let cfg = config::Config::load(&config_path)?;

    let session = cfg.session_config(cli.timeout);
    let log = cfg.log_store();

    match cli.command {
        Some(Command::Send {
            target,
            commands,
            wait,
            json,
        }) => {
            let endpoint = cfg.resolve_endpoint(Some(&target), cli.port)?;
            commands::send::run(
                endpoint,
                &commands,
                Duration::from_millis(wait),
                json,
                session,
                log,
            )
            .await
        }
        Some(Command::Monitor { target }) => {
            let endpoint = cfg.resolve_endpoint(target.as_deref(), cli.port)?;
            let default_port = cli.port.unwrap_or(cfg.default.port);
            commands::monitor::run(endpoint, session, log, default_port).await
        }
        None => {
            // Positional mode: espterm [HOST[:PORT]]
            let endpoint = cfg.resolve_endpoint(cli.target.as_deref(), cli.port)?;
            let default_port = cli.port.unwrap_or(cfg.default.port);
            commands::monitor::run(endpoint, session, log, default_port).await
        }
    }
}
