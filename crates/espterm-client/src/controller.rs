//! Session + log composition.
//!
//! `SessionController` is the only piece that knows about both the
//! [`Session`] and the [`LogStore`]. It turns session events into log
//! entries and exposes a read model (status, log snapshot, preview) that any
//! front end can observe without a particular UI binding.

use std::sync::Arc;

use espterm_core::{Endpoint, Line, LogEntry, LogKind, LogStore, TermError, TermResult};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::session::{
    Closure, ConnectionState, LineStream, Session, SessionConfig, SessionEvent, SessionStatus,
};

/// A change to the log, as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogUpdate {
    /// An entry was appended.
    Appended(LogEntry),
    /// The oldest `removed` entries were replaced by a marker entry.
    Trimmed { removed: usize },
    /// The log was cleared, leaving only this notice.
    Cleared(LogEntry),
}

/// Log state shared with the inbound pump task.
struct Shared {
    log: Mutex<LogStore>,
    updates: broadcast::Sender<LogUpdate>,
    preview: watch::Sender<Option<String>>,
}

impl Shared {
    /// Stamp and append under the lock, so timestamps follow log order.
    async fn append(&self, message: impl Into<String>, kind: LogKind) {
        let mut log = self.log.lock().await;
        let entry = LogEntry::new(message, kind);
        // No subscribers is fine.
        let _ = self.updates.send(LogUpdate::Appended(entry.clone()));
        if let Some(removed) = log.append(entry) {
            debug!(removed, "log trimmed");
            let _ = self.updates.send(LogUpdate::Trimmed { removed });
        }
    }

    fn set_preview(&self, text: String) {
        self.preview.send_if_modified(|current| {
            if current.as_deref() == Some(text.as_str()) {
                false
            } else {
                *current = Some(text);
                true
            }
        });
    }

    fn clear_preview(&self) {
        self.preview.send_if_modified(|current| current.take().is_some());
    }
}

/// Drives a [`Session`] and records everything that happens in a [`LogStore`].
pub struct SessionController {
    session: Arc<Session>,
    shared: Arc<Shared>,
    endpoint: Mutex<Option<Endpoint>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Default for SessionController {
    fn default() -> Self {
        Self::new(SessionConfig::default(), LogStore::default())
    }
}

impl SessionController {
    pub fn new(config: SessionConfig, log: LogStore) -> Self {
        let (updates, _) = broadcast::channel(256);
        let (preview, _) = watch::channel(None);
        Self {
            session: Arc::new(Session::new(config)),
            shared: Arc::new(Shared {
                log: Mutex::new(log),
                updates,
                preview,
            }),
            endpoint: Mutex::new(None),
            pump: Mutex::new(None),
        }
    }

    // ── Read model ───────────────────────────────────────────────────

    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Subscribe to connection status changes.
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.session.subscribe()
    }

    /// Subscribe to log changes.
    pub fn subscribe(&self) -> broadcast::Receiver<LogUpdate> {
        self.shared.updates.subscribe()
    }

    /// Copy of the log, oldest first.
    pub async fn snapshot(&self) -> Vec<LogEntry> {
        self.shared.log.lock().await.snapshot()
    }

    /// The unterminated text currently arriving, if any.
    ///
    /// Previews never enter the log; each one overwrites the last.
    pub fn preview(&self) -> Option<String> {
        self.shared.preview.borrow().clone()
    }

    pub fn watch_preview(&self) -> watch::Receiver<Option<String>> {
        self.shared.preview.subscribe()
    }

    /// Endpoint of the last connect or `set_endpoint` call.
    pub async fn endpoint(&self) -> Option<Endpoint> {
        self.endpoint.lock().await.clone()
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Change the target endpoint. Refused while connecting or connected.
    pub async fn set_endpoint(&self, endpoint: Endpoint) -> TermResult<()> {
        let mut current = self.endpoint.lock().await;
        let state = self.session.state();
        if state.is_busy() {
            return Err(TermError::InvalidState(format!(
                "endpoint is fixed while {state:?}"
            )));
        }
        *current = Some(endpoint);
        Ok(())
    }

    /// Connect to `endpoint` and start recording inbound lines.
    ///
    /// A failed attempt is logged as an Error entry and returned.
    pub async fn connect(&self, endpoint: Endpoint) -> TermResult<()> {
        if let Err(e) = self.set_endpoint(endpoint.clone()).await {
            self.shared
                .append(format!("Connection failed: {e}"), LogKind::Error)
                .await;
            return Err(e);
        }

        if let Err(e) = self.session.connect(&endpoint).await {
            self.shared
                .append(format!("Connection failed: {e}"), LogKind::Error)
                .await;
            return Err(e);
        }

        self.shared
            .append(format!("Connected to {endpoint}"), LogKind::System)
            .await;

        match self.session.lines().await {
            Ok(lines) => {
                let handle = tokio::spawn(pump(self.shared.clone(), lines));
                *self.pump.lock().await = Some(handle);
            }
            // A concurrent disconnect already took the connection and logs it.
            Err(e) => debug!("connection gone before reader started: {}", e),
        }
        Ok(())
    }

    /// Reconnect to the last endpoint.
    pub async fn reconnect(&self) -> TermResult<()> {
        let endpoint = self
            .endpoint()
            .await
            .ok_or_else(|| TermError::InvalidEndpoint("no endpoint set".into()))?;
        self.connect(endpoint).await
    }

    /// Disconnect from any state and log it.
    pub async fn disconnect(&self) {
        self.session.disconnect().await;

        let pump = self.pump.lock().await.take();
        if let Some(mut pump) = pump {
            let wait = self.session.config().close_timeout;
            if time::timeout(wait, &mut pump).await.is_err() {
                warn!("line pump did not finish, aborting");
                pump.abort();
            }
        }

        self.shared.clear_preview();
        self.shared
            .append("Disconnected from server", LogKind::System)
            .await;
    }

    /// Send one command line.
    ///
    /// Empty input is rejected without touching the log. A failure is logged
    /// as an Error entry here. The Sent entry (`> command`) is written by the
    /// line pump when the I/O task reports the write, so it lands ahead of
    /// any reply read afterwards.
    pub async fn send(&self, command: &str) -> TermResult<()> {
        if command.is_empty() {
            return Err(TermError::EmptyCommand);
        }

        if let Err(e) = self.session.send(command).await {
            warn!(error = %e, "send failed");
            self.shared
                .append(format!("Failed to send: {command}"), LogKind::Error)
                .await;
            return Err(e);
        }
        Ok(())
    }

    /// Empty the log, leaving an "Output cleared" notice.
    pub async fn clear(&self) {
        let mut log = self.shared.log.lock().await;
        let notice = log.clear().clone();
        let _ = self.shared.updates.send(LogUpdate::Cleared(notice));
        self.shared.clear_preview();
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Ok(mut pump) = self.pump.try_lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }
    }
}

/// Move connection events into the log until the connection ends.
async fn pump(shared: Arc<Shared>, mut events: LineStream) {
    while let Some(event) = events.next_event().await {
        match event {
            SessionEvent::Sent(command) => {
                shared.append(format!("> {command}"), LogKind::Sent).await;
            }
            SessionEvent::Line(Line::Complete(text)) => {
                shared.clear_preview();
                shared.append(text, LogKind::Received).await;
            }
            SessionEvent::Line(Line::Preview(text)) => shared.set_preview(text),
        }
    }
    shared.clear_preview();

    match events.closure() {
        Some(Closure::Remote) => {
            info!("device closed the connection");
            shared
                .append("Connection closed by server", LogKind::System)
                .await;
        }
        Some(Closure::Failed(reason)) => {
            shared
                .append(format!("Connection error: {reason}"), LogKind::Error)
                .await;
        }
        Some(Closure::Local) | None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    async fn ping_pong_server() -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line == "PING" && write.write_all(b"PONG\n").await.is_err() {
                    break;
                }
            }
        });
        Endpoint::new("127.0.0.1", port).unwrap()
    }

    fn controller() -> SessionController {
        SessionController::new(
            SessionConfig {
                connect_timeout: Duration::from_millis(500),
                ..SessionConfig::default()
            },
            LogStore::default(),
        )
    }

    /// Poll the log until `pred` holds, or panic after two seconds.
    async fn wait_for_log(
        ctl: &SessionController,
        pred: impl Fn(&[LogEntry]) -> bool,
    ) -> Vec<LogEntry> {
        time::timeout(Duration::from_secs(2), async {
            loop {
                let log = ctl.snapshot().await;
                if pred(&log) {
                    return log;
                }
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("log condition not reached")
    }

    fn position(log: &[LogEntry], kind: LogKind, message: &str) -> Option<usize> {
        log.iter()
            .position(|e| e.kind == kind && e.message == message)
    }

    #[tokio::test]
    async fn ping_pong_scenario() {
        let endpoint = ping_pong_server().await;
        let ctl = controller();

        ctl.connect(endpoint.clone()).await.unwrap();
        assert!(ctl.state().is_connected());
        ctl.send("PING").await.unwrap();

        let log = wait_for_log(&ctl, |log| {
            position(log, LogKind::Received, "PONG").is_some()
        })
        .await;

        let connected = position(&log, LogKind::System, &format!("Connected to {endpoint}")).unwrap();
        let sent = position(&log, LogKind::Sent, "> PING").unwrap();
        let received = position(&log, LogKind::Received, "PONG").unwrap();
        assert!(connected < sent);
        assert!(sent < received);

        ctl.disconnect().await;
    }

    #[tokio::test]
    async fn send_while_disconnected_logs_error_only() {
        let ctl = controller();
        assert!(ctl.send("PING").await.is_err());

        let log = ctl.snapshot().await;
        assert!(log.iter().all(|e| e.kind != LogKind::Sent));
        assert_eq!(position(&log, LogKind::Error, "Failed to send: PING"), Some(0));
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let endpoint = ping_pong_server().await;
        let ctl = controller();
        ctl.connect(endpoint).await.unwrap();

        assert!(matches!(ctl.send("").await, Err(TermError::EmptyCommand)));
        assert_eq!(ctl.snapshot().await.len(), 1);

        // Whitespace is a real keystroke for some devices.
        ctl.send(" ").await.unwrap();
        wait_for_log(&ctl, |log| position(log, LogKind::Sent, ">  ").is_some()).await;
        ctl.disconnect().await;
    }

    #[tokio::test]
    async fn failed_connect_is_logged() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let ctl = controller();
        let err = ctl
            .connect(Endpoint::new("127.0.0.1", port).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, TermError::ConnectRefused));
        assert!(matches!(ctl.state(), ConnectionState::Failed(_)));

        let log = ctl.snapshot().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].kind, LogKind::Error);
        assert!(log[0].message.starts_with("Connection failed:"));
    }

    #[tokio::test]
    async fn disconnect_twice_logs_each_time() {
        let ctl = controller();
        ctl.disconnect().await;
        ctl.disconnect().await;

        assert_eq!(ctl.state(), ConnectionState::Disconnected);
        let log = ctl.snapshot().await;
        assert_eq!(log.len(), 2);
        assert!(log
            .iter()
            .all(|e| e.kind == LogKind::System && e.message == "Disconnected from server"));
    }

    #[tokio::test]
    async fn remote_close_is_logged() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"rebooting\n").await.unwrap();
        });

        let ctl = controller();
        ctl.connect(Endpoint::new("127.0.0.1", port).unwrap())
            .await
            .unwrap();

        let log = wait_for_log(&ctl, |log| {
            position(log, LogKind::System, "Connection closed by server").is_some()
        })
        .await;
        assert!(
            position(&log, LogKind::Received, "rebooting").unwrap()
                < position(&log, LogKind::System, "Connection closed by server").unwrap()
        );
        assert_eq!(ctl.status().message, "Connection closed by server");
    }

    #[tokio::test]
    async fn preview_stays_out_of_log() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"temp=2").await.unwrap();
            let _ = go_rx.await;
            stream.write_all(b"1\n").await.unwrap();
            time::sleep(Duration::from_millis(500)).await;
        });

        let ctl = controller();
        let mut preview = ctl.watch_preview();
        ctl.connect(Endpoint::new("127.0.0.1", port).unwrap())
            .await
            .unwrap();

        let seen = time::timeout(Duration::from_secs(2), preview.wait_for(Option::is_some))
            .await
            .unwrap()
            .unwrap()
            .clone();
        assert_eq!(seen.as_deref(), Some("temp=2"));
        assert_eq!(ctl.snapshot().await.len(), 1);

        go_tx.send(()).unwrap();
        wait_for_log(&ctl, |log| position(log, LogKind::Received, "temp=21").is_some()).await;
        assert_eq!(ctl.preview(), None);
        ctl.disconnect().await;
    }

    #[tokio::test]
    async fn clear_resets_log() {
        let ctl = controller();
        let mut updates = ctl.subscribe();
        ctl.send("x").await.unwrap_err();
        ctl.clear().await;

        let log = ctl.snapshot().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].message, "Output cleared");

        assert!(matches!(updates.recv().await.unwrap(), LogUpdate::Appended(_)));
        assert_eq!(updates.recv().await.unwrap(), LogUpdate::Cleared(log[0].clone()));
    }

    #[tokio::test]
    async fn trim_is_broadcast() {
        let ctl = SessionController::new(SessionConfig::default(), LogStore::new(3, 2));
        let mut updates = ctl.subscribe();
        for _ in 0..4 {
            ctl.disconnect().await;
        }

        let mut trims = 0;
        while let Ok(update) = updates.try_recv() {
            if let LogUpdate::Trimmed { removed } = update {
                assert_eq!(removed, 2);
                trims += 1;
            }
        }
        assert_eq!(trims, 1);
        assert_eq!(ctl.snapshot().await.len(), 3);
    }

    #[tokio::test]
    async fn endpoint_is_fixed_while_connected() {
        let endpoint = ping_pong_server().await;
        let ctl = controller();
        let other = Endpoint::new("10.0.0.2", 23).unwrap();

        ctl.set_endpoint(other.clone()).await.unwrap();
        ctl.connect(endpoint.clone()).await.unwrap();
        assert!(matches!(
            ctl.set_endpoint(other.clone()).await,
            Err(TermError::InvalidState(_))
        ));
        assert_eq!(ctl.endpoint().await, Some(endpoint));

        ctl.disconnect().await;
        ctl.set_endpoint(other.clone()).await.unwrap();
        assert_eq!(ctl.endpoint().await, Some(other));
    }

    #[tokio::test]
    async fn reconnect_uses_last_endpoint() {
        let ctl = controller();
        assert!(matches!(
            ctl.reconnect().await,
            Err(TermError::InvalidEndpoint(_))
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port()).unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        ctl.connect(endpoint.clone()).await.unwrap();
        ctl.disconnect().await;
        ctl.reconnect().await.unwrap();
        assert!(ctl.state().is_connected());

        let log = ctl.snapshot().await;
        let connects = log
            .iter()
            .filter(|e| e.message == format!("Connected to {endpoint}"))
            .count();
        assert_eq!(connects, 2);
        ctl.disconnect().await;
    }

    /// Abort the connection with an RST instead of a FIN.
    #[allow(deprecated)]
    fn reset(stream: tokio::net::TcpStream) {
        stream.set_linger(Some(Duration::ZERO)).unwrap();
        drop(stream);
    }

    #[tokio::test]
    async fn log_stays_readable_during_stuck_write() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            // Accept and never read.
            let (_stream, _) = listener.accept().await.unwrap();
            time::sleep(Duration::from_secs(10)).await;
        });

        let ctl = Arc::new(controller());
        ctl.connect(Endpoint::new("127.0.0.1", port).unwrap())
            .await
            .unwrap();

        let sender = {
            let ctl = ctl.clone();
            tokio::spawn(async move { ctl.send(&"x".repeat(16 << 20)).await })
        };
        time::sleep(Duration::from_millis(200)).await;

        let log = time::timeout(Duration::from_secs(2), ctl.snapshot())
            .await
            .expect("log blocked by a pending write");
        assert_eq!(log.len(), 1);
        time::timeout(Duration::from_secs(2), ctl.clear())
            .await
            .expect("clear blocked by a pending write");

        ctl.disconnect().await;
        let result = time::timeout(Duration::from_secs(2), sender)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
        let log = ctl.snapshot().await;
        assert!(position(&log, LogKind::System, "Disconnected from server").is_some());
        assert!(log.iter().all(|e| e.kind != LogKind::Sent));
    }

    #[tokio::test]
    async fn read_failure_is_logged() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            reset(stream);
        });

        let ctl = controller();
        ctl.connect(Endpoint::new("127.0.0.1", port).unwrap())
            .await
            .unwrap();

        wait_for_log(&ctl, |log| {
            log.iter()
                .any(|e| e.kind == LogKind::Error && e.message.starts_with("Connection error:"))
        })
        .await;
        assert!(matches!(ctl.state(), ConnectionState::Failed(_)));
    }

    #[tokio::test]
    async fn write_failure_is_logged() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"ready\n").await.unwrap();
            let _ = go_rx.await;
            reset(stream);
        });

        // Keep the reader parked so the reset shows up on the write.
        let ctl = SessionController::new(
            SessionConfig {
                connect_timeout: Duration::from_millis(500),
                idle_delay: Duration::from_secs(10),
                ..SessionConfig::default()
            },
            LogStore::default(),
        );
        ctl.connect(Endpoint::new("127.0.0.1", port).unwrap())
            .await
            .unwrap();
        wait_for_log(&ctl, |log| position(log, LogKind::Received, "ready").is_some()).await;

        go_tx.send(()).unwrap();
        time::sleep(Duration::from_millis(200)).await;

        let err = ctl.send("PING").await.unwrap_err();
        assert!(matches!(err, TermError::WriteFailed(_)));

        let log = wait_for_log(&ctl, |log| {
            log.iter()
                .any(|e| e.kind == LogKind::Error && e.message.starts_with("Connection error:"))
        })
        .await;
        assert!(position(&log, LogKind::Error, "Failed to send: PING").is_some());
        assert!(log.iter().all(|e| e.kind != LogKind::Sent));
        assert!(matches!(ctl.state(), ConnectionState::Failed(_)));
    }
}
