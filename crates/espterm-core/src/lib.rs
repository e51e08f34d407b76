//! espterm-core: shared pieces for the espterm network terminal.
//!
//! Provides newline reassembly over an arbitrarily chunked byte stream, the
//! bounded timestamped log shown to the user, endpoint parsing, and the
//! error taxonomy used by the session layer.

pub mod endpoint;
pub mod error;
pub mod line;
pub mod log;

// Re-export commonly used items at crate root.
pub use endpoint::Endpoint;
pub use error::{TermError, TermResult};
pub use line::{Line, LineReassembler};
pub use log::{LogEntry, LogKind, LogStore};
