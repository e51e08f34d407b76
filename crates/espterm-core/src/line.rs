//! Newline framing for the device text stream.
//!
//! Wire format: UTF-8 text terminated by `\n`, optionally preceded by `\r`.
//! The device flushes whenever it likes, so chunk boundaries carry no meaning.

use std::fmt;

use tracing::trace;

/// Marker appended when rendering a preview.
pub const PREVIEW_SUFFIX: &str = " (...)";

/// A logical line produced by [`LineReassembler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// A terminated line, `\r\n` / `\n` stripped.
    Complete(String),
    /// The unterminated residue after a chunk, trimmed. Not yet a line.
    Preview(String),
}

impl Line {
    pub fn text(&self) -> &str {
        match self {
            Line::Complete(text) | Line::Preview(text) => text,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Line::Complete(_))
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Line::Complete(text) => f.write_str(text),
            Line::Preview(text) => write!(f, "{text}{PREVIEW_SUFFIX}"),
        }
    }
}

/// Streaming line decoder: accumulates bytes and yields complete lines.
///
/// One instance serves one connection. There is deliberately no reset:
/// a reconnect builds a fresh reassembler.
#[derive(Debug, Default)]
pub struct LineReassembler {
    buffer: Vec<u8>,
}

impl LineReassembler {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed a chunk and return every line it completed, in order.
    ///
    /// If a printable residue remains afterwards it is reported once more as
    /// a trailing [`Line::Preview`]; the residue stays buffered.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Line> {
        let mut lines = Vec::new();
        let mut rest = data;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.buffer.extend_from_slice(&rest[..pos]);
            rest = &rest[pos + 1..];

            let mut raw = std::mem::take(&mut self.buffer);
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
            if !raw.is_empty() {
                let line = String::from_utf8_lossy(&raw).into_owned();
                trace!(len = line.len(), "complete line");
                lines.push(Line::Complete(line));
            }
        }
        self.buffer.extend_from_slice(rest);

        if let Some(preview) = self.preview() {
            lines.push(Line::Preview(preview));
        }
        lines
    }

    /// The current residue as preview text, if it holds anything printable.
    ///
    /// A multi-byte character cut by the chunk boundary is left out until
    /// its remaining bytes arrive.
    pub fn preview(&self) -> Option<String> {
        let text = match std::str::from_utf8(&self.buffer) {
            Ok(text) => text,
            Err(e) => std::str::from_utf8(&self.buffer[..e.valid_up_to()]).unwrap_or_default(),
        };
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }

    /// Number of unterminated bytes held.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
