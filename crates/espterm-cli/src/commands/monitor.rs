//! `espterm monitor [HOST[:PORT]]`: interactive device terminal.
//!
//! Connects through a `SessionController`, renders every log update as it
//! happens, and reads commands from stdin one line at a time. Lines starting
//! with `/` are local commands; everything else is sent to the device.

use std::sync::Arc;

use anyhow::{Context, Result};
use espterm_client::{ConnectionState, LogUpdate, SessionConfig, SessionController};
use espterm_core::{Endpoint, LogStore};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::terminal::Renderer;

const HELP: &str = "\
/connect [HOST[:PORT]]  connect (to the last device if no target)
/disconnect             close the connection
/clear                  clear the log
/status                 show connection status
/quit                   disconnect and exit
//text                  send \"/text\" to the device";

/// A line typed by the user.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Command(String),
    Connect(Option<String>),
    Disconnect,
    Clear,
    Status,
    Help,
    Quit,
    Unknown(String),
}

fn parse_input(line: &str) -> Input {
    let line = line.trim_end_matches(['\r', '\n']);
    if let Some(escaped) = line.strip_prefix("//") {
        return Input::Command(format!("/{escaped}"));
    }
    let Some(local) = line.strip_prefix('/') else {
        return Input::Command(line.to_string());
    };

    let mut parts = local.split_whitespace();
    match parts.next().unwrap_or_default() {
        "connect" => Input::Connect(parts.next().map(str::to_string)),
        "disconnect" => Input::Disconnect,
        "clear" => Input::Clear,
        "status" => Input::Status,
        "help" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => Input::Unknown(other.to_string()),
    }
}

/// Run the interactive monitor against `endpoint`.
pub async fn run(
    endpoint: Endpoint,
    session: SessionConfig,
    log: LogStore,
    default_port: u16,
) -> Result<()> {
    let ctl = Arc::new(SessionController::new(session, log));
    let mut updates = ctl.subscribe();
    let mut preview = ctl.watch_preview();
    let mut status = ctl.watch_status();
    let mut renderer = Renderer::stdout();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    info!(endpoint = %endpoint, "starting monitor");
    spawn_connect(&ctl, Some(endpoint));

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(LogUpdate::Appended(entry)) => renderer.entry(&entry)?,
                Ok(LogUpdate::Cleared(notice)) => {
                    renderer.clear_screen()?;
                    renderer.entry(&notice)?;
                }
                // Scrollback is the terminal's business.
                Ok(LogUpdate::Trimmed { .. }) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "display fell behind the log"),
                Err(RecvError::Closed) => break,
            },

            changed = preview.changed() => {
                if changed.is_err() {
                    break;
                }
                let text = preview.borrow_and_update().clone();
                renderer.preview(text.as_deref())?;
            }

            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                // Everything else already shows up in the log.
                if current.state == ConnectionState::Connecting {
                    renderer.status(&current)?;
                }
            }

            line = stdin.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    debug!("stdin closed");
                    break;
                };
                match parse_input(&line) {
                    Input::Command(command) => {
                        // Failures are already in the log.
                        if let Err(e) = ctl.send(&command).await {
                            debug!("send: {}", e);
                        }
                    }
                    Input::Connect(None) => spawn_connect(&ctl, None),
                    Input::Connect(Some(target)) => match Endpoint::parse(&target, default_port) {
                        Ok(endpoint) => spawn_connect(&ctl, Some(endpoint)),
                        Err(e) => eprintln!("espterm: {e}"),
                    },
                    Input::Disconnect => ctl.disconnect().await,
                    Input::Clear => ctl.clear().await,
                    Input::Status => renderer.status(&ctl.status())?,
                    Input::Help => eprintln!("{HELP}"),
                    Input::Quit => break,
                    Input::Unknown(name) => eprintln!("espterm: unknown command /{name} (try /help)"),
                }
            }
        }
    }

    ctl.disconnect().await;
    while let Ok(update) = updates.try_recv() {
        if let LogUpdate::Appended(entry) = update {
            renderer.entry(&entry)?;
        }
    }
    Ok(())
}

/// Connect in the background so rendering continues during the handshake.
///
/// `None` reconnects to the last device.
fn spawn_connect(ctl: &Arc<SessionController>, endpoint: Option<Endpoint>) {
    let ctl = ctl.clone();
    tokio::spawn(async move {
        let result = match endpoint {
            Some(endpoint) => ctl.connect(endpoint).await,
            None => ctl.reconnect().await,
        };
        // Connect failures are logged by the controller.
        if let Err(e) = result {
            debug!("connect: {}", e);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_command() {
        assert_eq!(parse_input("led on\r\n"), Input::Command("led on".into()));
        assert_eq!(parse_input(""), Input::Command(String::new()));
    }

    #[test]
    fn slash_commands() {
        assert_eq!(parse_input("/quit"), Input::Quit);
        assert_eq!(parse_input("/exit"), Input::Quit);
        assert_eq!(parse_input("/clear"), Input::Clear);
        assert_eq!(parse_input("/status"), Input::Status);
        assert_eq!(parse_input("/disconnect"), Input::Disconnect);
        assert_eq!(parse_input("/connect"), Input::Connect(None));
        assert_eq!(
            parse_input("/connect 192.168.4.1:23"),
            Input::Connect(Some("192.168.4.1:23".into()))
        );
        assert_eq!(parse_input("/reboot"), Input::Unknown("reboot".into()));
    }

    #[test]
    fn double_slash_escapes() {
        assert_eq!(parse_input("//reset"), Input::Command("/reset".into()));
    }
}
