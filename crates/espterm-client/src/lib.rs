//! espterm-client: async TCP client for ESP32-class devices speaking
//! newline-delimited text.
//!
//! Provides a [`Session`] that owns the socket lifecycle
//! (connect/send/disconnect plus the ordered event stream) and a
//! [`SessionController`] that records everything in a bounded log.
//!
//! # Quick Start
//!
//! ```no_run
//! use espterm_client::{SessionController, SessionConfig};
//! use espterm_core::{Endpoint, LogStore};
//!
//! # async fn example() -> espterm_core::TermResult<()> {
//! let ctl = SessionController::new(SessionConfig::default(), LogStore::default());
//! ctl.connect(Endpoint::parse("192.168.4.1", 23)?).await?;
//! ctl.send("status").await?;
//!
//! for entry in ctl.snapshot().await {
//!     println!("[{}] {}", entry.timestamp, entry.message);
//! }
//!
//! ctl.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod controller;
pub mod session;

// Re-export primary public types.
pub use controller::{LogUpdate, SessionController};
pub use session::{
    Closure, ConnectionState, LineStream, Session, SessionConfig, SessionEvent, SessionStatus,
};

// Re-export espterm-core types for convenience.
pub use espterm_core::{Endpoint, Line, LogEntry, LogKind, LogStore, TermError, TermResult};
