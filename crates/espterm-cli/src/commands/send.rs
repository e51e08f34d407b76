//! `espterm send HOST[:PORT] COMMAND...`: one-shot exchange.
//!
//! Connects, sends each command in order, collects replies for a fixed
//! window, disconnects, and prints the resulting log.

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use espterm_client::{SessionConfig, SessionController};
use espterm_core::{Endpoint, LogEntry, LogStore};
use tokio::time;
use tracing::info;

use crate::terminal::Renderer;

/// Run a one-shot exchange and print the log to stdout.
pub async fn run(
    endpoint: Endpoint,
    commands: &[String],
    wait: Duration,
    json: bool,
    session: SessionConfig,
    log: LogStore,
) -> Result<()> {
    let ctl = SessionController::new(session, log);

    let result = exchange(&ctl, &endpoint, commands, wait).await;
    ctl.disconnect().await;

    print_log(&ctl.snapshot().await, json)?;
    result
}

async fn exchange(
    ctl: &SessionController,
    endpoint: &Endpoint,
    commands: &[String],
    wait: Duration,
) -> Result<()> {
    ctl.connect(endpoint.clone())
        .await
        .with_context(|| format!("failed to connect to {endpoint}"))?;

    for command in commands {
        ctl.send(command)
            .await
            .with_context(|| format!("failed to send '{command}'"))?;
    }
    info!(count = commands.len(), wait_ms = wait.as_millis() as u64, "waiting for replies");
    time::sleep(wait).await;
    Ok(())
}

fn print_log(entries: &[LogEntry], json: bool) -> Result<()> {
    if json {
        let mut out = std::io::stdout().lock();
        for entry in entries {
            let line = serde_json::to_string(entry).context("failed to encode log entry")?;
            writeln!(out, "{line}")?;
        }
        out.flush()?;
    } else {
        let mut renderer = Renderer::stdout();
        for entry in entries {
            renderer.entry(entry)?;
        }
    }
    Ok(())
}
