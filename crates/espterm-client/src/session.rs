//! Client-side TCP session.
//!
//! A `Session` owns one device connection at a time. All socket I/O for a
//! connection runs in a single spawned task; callers hand it work through a
//! command channel and get completions back over oneshot replies, while the
//! inbound side is delivered as a [`LineStream`].

use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use espterm_core::{Endpoint, Line, LineReassembler, TermError, TermResult};
use futures_util::Stream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};

/// Inbound lines buffered between the I/O task and the line consumer.
const INBOUND_BACKLOG: usize = 1024;

/// Connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// TCP handshake in progress.
    Connecting,
    /// Socket open and the inbound stream is being read.
    Connected,
    /// Last attempt or connection ended in an error. Retry is allowed.
    Failed(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Whether an attempt or a connection currently holds the session.
    pub fn is_busy(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

/// Observable status: the state plus a line of text for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub message: String,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            message: "Disconnected".to_string(),
        }
    }
}

/// Tunables for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upper bound on the TCP handshake.
    pub connect_timeout: Duration,
    /// Pause after each read cycle. Lets chunks coalesce and yields the CPU.
    pub idle_delay: Duration,
    /// Read buffer size per cycle, in bytes.
    pub read_chunk: usize,
    /// How long disconnect waits for the I/O task before aborting it.
    pub close_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(5000),
            idle_delay: Duration::from_millis(10),
            read_chunk: 1024,
            close_timeout: Duration::from_millis(1000),
        }
    }
}

/// Why an inbound stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Closure {
    /// The device closed the connection.
    Remote,
    /// A read or write failed.
    Failed(String),
    /// Closed by `disconnect` on this side.
    Local,
}

/// Something that happened on a connection, in the order the I/O task saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A command line was written and flushed.
    Sent(String),
    /// Text arrived from the device.
    Line(Line),
}

/// Items passed from the I/O task to the [`LineStream`].
#[derive(Debug)]
enum Inbound {
    Event(SessionEvent),
    Closed(Closure),
}

/// Work handed to the I/O task.
#[derive(Debug)]
enum IoCommand {
    Send {
        text: String,
        reply: oneshot::Sender<TermResult<()>>,
    },
    Close,
}

/// The events of one connection: lines read and commands written, in order.
///
/// A written command is reported before any line read after it, so a reply
/// never overtakes the command that caused it. Ends when the connection
/// does. [`LineStream::closure`] then tells why.
///
/// The I/O task waits for this stream to be drained once its backlog is
/// full; nothing read from the socket is discarded.
pub struct LineStream {
    rx: mpsc::Receiver<Inbound>,
    closure: Option<Closure>,
}

impl LineStream {
    /// Receive the next event, or `None` once the connection is gone.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }

    /// Receive the next line, skipping `Sent` notices.
    pub async fn next_line(&mut self) -> Option<Line> {
        loop {
            match self.next_event().await? {
                SessionEvent::Line(line) => return Some(line),
                SessionEvent::Sent(_) => {}
            }
        }
    }

    /// Why the stream ended. `None` while it is still open.
    pub fn closure(&self) -> Option<&Closure> {
        self.closure.as_ref()
    }
}

impl Stream for LineStream {
    type Item = SessionEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<SessionEvent>> {
        let this = self.get_mut();
        if this.closure.is_some() {
            return Poll::Ready(None);
        }
        match ready!(this.rx.poll_recv(cx)) {
            Some(Inbound::Event(event)) => Poll::Ready(Some(event)),
            Some(Inbound::Closed(closure)) => {
                this.closure = Some(closure);
                Poll::Ready(None)
            }
            // The I/O task was aborted before it could report.
            None => {
                this.closure = Some(Closure::Local);
                Poll::Ready(None)
            }
        }
    }
}

/// A live connection and the task driving it.
struct Connection {
    generation: u64,
    endpoint: Endpoint,
    cmd_tx: mpsc::Sender<IoCommand>,
    task: JoinHandle<()>,
    lines: Option<LineStream>,
}

#[derive(Default)]
struct Inner {
    connection: Option<Connection>,
    /// Cancels the in-flight connect attempt.
    pending_connect: Option<oneshot::Sender<()>>,
    /// Stream of a connection the device closed before anyone took it.
    unclaimed: Option<LineStream>,
    /// Bumped on every connect attempt; stale I/O tasks compare against it.
    generation: u64,
}

struct Shared {
    status: watch::Sender<SessionStatus>,
    inner: Mutex<Inner>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        self.status.borrow().state.clone()
    }

    fn set_status(&self, state: ConnectionState, message: impl Into<String>) {
        self.status.send_replace(SessionStatus {
            state,
            message: message.into(),
        });
    }

    /// Called by an I/O task on its way out.
    ///
    /// Only the task that still owns the session's connection may change the
    /// state; after `disconnect` or a reconnect this is a no-op.
    async fn finish(&self, generation: u64, closure: &Closure) {
        let mut inner = self.inner.lock().await;
        let current = inner
            .connection
            .as_ref()
            .is_some_and(|c| c.generation == generation);
        if !current {
            return;
        }
        let Some(mut connection) = inner.connection.take() else {
            return;
        };
        // Lines read before the close stay available to `lines()`.
        inner.unclaimed = connection.lines.take();
        let endpoint = connection.endpoint.to_string();

        match closure {
            Closure::Remote => {
                info!(endpoint = %endpoint, "connection closed by server");
                self.set_status(ConnectionState::Disconnected, "Connection closed by server");
            }
            Closure::Failed(reason) => {
                warn!(endpoint = %endpoint, "connection error: {}", reason);
                self.set_status(
                    ConnectionState::Failed(reason.clone()),
                    format!("Connection error: {reason}"),
                );
            }
            Closure::Local => {
                self.set_status(ConnectionState::Disconnected, "Disconnected");
            }
        }
    }
}

/// One TCP connection lifecycle at a time, from connect to disconnect.
pub struct Session {
    config: SessionConfig,
    shared: Arc<Shared>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let (status, _) = watch::channel(SessionStatus::default());
        Self {
            config,
            shared: Arc::new(Shared {
                status,
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current status snapshot.
    pub fn status(&self) -> SessionStatus {
        self.shared.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Subscribe to status changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status.subscribe()
    }

    /// Endpoint of the live connection, if any.
    pub async fn endpoint(&self) -> Option<Endpoint> {
        let inner = self.shared.inner.lock().await;
        inner.connection.as_ref().map(|c| c.endpoint.clone())
    }

    /// Open a TCP connection to `endpoint` within the configured timeout.
    ///
    /// Only valid while Disconnected or Failed; a second call during an
    /// attempt or a live connection is rejected without touching the state.
    /// On failure the state becomes `Failed` and the error is returned.
    pub async fn connect(&self, endpoint: &Endpoint) -> TermResult<()> {
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let generation = {
            let mut inner = self.shared.inner.lock().await;
            let state = self.shared.state();
            if state.is_busy() {
                warn!(endpoint = %endpoint, ?state, "connect rejected");
                return Err(TermError::InvalidState(format!(
                    "cannot connect while {state:?}"
                )));
            }
            inner.generation += 1;
            inner.pending_connect = Some(cancel_tx);
            inner.unclaimed = None;
            self.shared
                .set_status(ConnectionState::Connecting, format!("Connecting to {endpoint}..."));
            inner.generation
        };
        info!(host = endpoint.host(), port = endpoint.port(), "connecting");

        let attempt = time::timeout(
            self.config.connect_timeout,
            TcpStream::connect((endpoint.host(), endpoint.port())),
        );
        let result = tokio::select! {
            result = attempt => match result {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(e)) => Err(TermError::from_connect(e)),
                Err(_) => Err(TermError::ConnectTimeout),
            },
            _ = cancel_rx => Err(TermError::InvalidState("connect cancelled".into())),
        };

        let mut inner = self.shared.inner.lock().await;
        if inner.generation != generation || inner.pending_connect.is_none() {
            // `disconnect` got here first and already reported Disconnected.
            debug!(endpoint = %endpoint, "connect attempt abandoned");
            return Err(match result {
                Err(e @ TermError::InvalidState(_)) => e,
                _ => TermError::InvalidState("connect cancelled".into()),
            });
        }
        inner.pending_connect = None;

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "connect failed");
                self.shared.set_status(
                    ConnectionState::Failed(e.to_string()),
                    format!("Connection failed: {e}"),
                );
                return Err(e);
            }
        };

        // Commands are tiny and latency-bound.
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {}", e);
        }

        let (cmd_tx, cmd_rx) = mpsc::channel::<IoCommand>(64);
        let (line_tx, line_rx) = mpsc::channel::<Inbound>(INBOUND_BACKLOG);
        let task = tokio::spawn(io_loop(
            stream,
            cmd_rx,
            line_tx,
            self.config.clone(),
            self.shared.clone(),
            generation,
        ));

        inner.connection = Some(Connection {
            generation,
            endpoint: endpoint.clone(),
            cmd_tx,
            task,
            lines: Some(LineStream {
                rx: line_rx,
                closure: None,
            }),
        });
        self.shared
            .set_status(ConnectionState::Connected, format!("Connected to {endpoint}"));
        info!(endpoint = %endpoint, "connected");
        Ok(())
    }

    /// Take the event stream of the current connection.
    ///
    /// There is one stream per connection; a second call fails. If the
    /// device already closed the connection, the stream still yields what
    /// was read before the close.
    pub async fn lines(&self) -> TermResult<LineStream> {
        let mut inner = self.shared.inner.lock().await;
        let live = inner.connection.as_mut().and_then(|c| c.lines.take());
        live.or_else(|| inner.unclaimed.take())
            .ok_or_else(|| TermError::InvalidState("no unclaimed connection stream".into()))
    }

    /// Write `text` plus a line terminator and flush it.
    ///
    /// Fails with `InvalidState` unless Connected. A write error closes the
    /// connection and moves the session to `Failed`. On success a
    /// [`SessionEvent::Sent`] is queued on the stream first.
    pub async fn send(&self, text: &str) -> TermResult<()> {
        let cmd_tx = {
            let inner = self.shared.inner.lock().await;
            match (&self.shared.state(), &inner.connection) {
                (ConnectionState::Connected, Some(connection)) => connection.cmd_tx.clone(),
                (state, _) => {
                    debug!(?state, "send rejected: not connected");
                    return Err(TermError::InvalidState("not connected".into()));
                }
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx
            .send(IoCommand::Send {
                text: text.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| TermError::StreamClosed)?;
        reply_rx.await.map_err(|_| TermError::StreamClosed)?
    }

    /// Close the connection, or abandon a connect attempt, from any state.
    ///
    /// Never fails: close-time errors are logged and swallowed. Always ends
    /// in `Disconnected`.
    pub async fn disconnect(&self) {
        let (connection, pending) = {
            let mut inner = self.shared.inner.lock().await;
            inner.unclaimed = None;
            (inner.connection.take(), inner.pending_connect.take())
        };

        if let Some(cancel) = pending {
            let _ = cancel.send(());
            debug!("cancelled pending connect");
        }

        if let Some(connection) = connection {
            let Connection {
                endpoint,
                cmd_tx,
                mut task,
                ..
            } = connection;

            // A full queue means the task is stuck writing; the timeout
            // below covers that.
            let _ = cmd_tx.try_send(IoCommand::Close);
            drop(cmd_tx);

            match time::timeout(self.config.close_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("I/O task ended abnormally: {}", e),
                Err(_) => {
                    warn!(endpoint = %endpoint, "I/O task did not stop in time, aborting");
                    task.abort();
                }
            }
            info!(endpoint = %endpoint, "disconnected");
        }

        self.shared
            .set_status(ConnectionState::Disconnected, "Disconnected");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.shared.inner.try_lock() {
            inner.unclaimed = None;
            if let Some(connection) = inner.connection.take() {
                connection.task.abort();
            }
        }
    }
}

/// Write one command line and flush.
async fn write_line(writer: &mut OwnedWriteHalf, text: &str) -> std::io::Result<()> {
    let mut frame = Vec::with_capacity(text.len() + 1);
    frame.extend_from_slice(text.as_bytes());
    frame.push(b'\n');
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// The per-connection I/O task: the only reader and writer of the socket.
async fn io_loop(
    stream: TcpStream,
    mut cmd_rx: mpsc::Receiver<IoCommand>,
    line_tx: mpsc::Sender<Inbound>,
    config: SessionConfig,
    shared: Arc<Shared>,
    generation: u64,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut reassembler = LineReassembler::new();
    let mut buf = vec![0u8; config.read_chunk.max(1)];
    let mut next_read = Instant::now();

    let closure = loop {
        let deadline = next_read;
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(IoCommand::Send { text, reply }) => {
                    match write_line(&mut writer, &text).await {
                        Ok(()) => {
                            debug!(bytes = text.len() + 1, "command sent");
                            // A dropped stream only means nobody is listening.
                            let _ = line_tx.send(Inbound::Event(SessionEvent::Sent(text))).await;
                            let _ = reply.send(Ok(()));
                        }
                        Err(e) => {
                            warn!(error = %e, "write failed");
                            let reason = e.to_string();
                            let _ = reply.send(Err(TermError::WriteFailed(reason.clone())));
                            break Closure::Failed(reason);
                        }
                    }
                }
                Some(IoCommand::Close) | None => {
                    debug!("I/O task closing");
                    break Closure::Local;
                }
            },
            result = async {
                time::sleep_until(deadline).await;
                reader.read(&mut buf).await
            } => {
                match result {
                    Ok(0) => break Closure::Remote,
                    Ok(n) => {
                        trace!(bytes = n, "read chunk");
                        for line in reassembler.feed(&buf[..n]) {
                            debug!(complete = line.is_complete(), "received: {}", line);
                            // Waits for the consumer when the backlog is full.
                            let _ = line_tx.send(Inbound::Event(SessionEvent::Line(line))).await;
                        }
                        next_read = Instant::now() + config.idle_delay;
                    }
                    Err(e) => {
                        warn!(error = %e, "read failed");
                        break Closure::Failed(e.to_string());
                    }
                }
            }
        }
    };

    if let Err(e) = writer.shutdown().await {
        debug!("shutdown on close: {}", e);
    }
    drop(reader);
    drop(writer);
    shared.finish(generation, &closure).await;
    let _ = line_tx.send(Inbound::Closed(closure)).await;
}
