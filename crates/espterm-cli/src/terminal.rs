//! Colorized rendering of the log on a terminal.
//!
//! Wraps crossterm's styling and line clearing. Colors are only emitted when
//! stdout is a terminal, so piped output stays plain.

use std::io::{self, IsTerminal, Write};

use crossterm::style::{Attribute, Color, Print, ResetColor, SetAttribute, SetForegroundColor};
use crossterm::terminal::{Clear, ClearType};
use crossterm::{cursor, queue};
use espterm_client::SessionStatus;
use espterm_core::line::PREVIEW_SUFFIX;
use espterm_core::{LogEntry, LogKind};

/// Foreground color for each entry kind.
pub fn kind_color(kind: LogKind) -> Color {
    match kind {
        LogKind::Received => Color::Blue,
        LogKind::Sent => Color::Green,
        LogKind::System => Color::DarkGrey,
        LogKind::Error => Color::Red,
    }
}

/// Plain one-line form of an entry: `[HH:MM:SS] message`.
pub fn format_entry(entry: &LogEntry) -> String {
    format!("[{}] {}", entry.timestamp, entry.message)
}

/// Writes log entries, keeping at most one overwritable preview line.
pub struct Renderer<W: Write> {
    out: W,
    color: bool,
    preview_shown: bool,
}

impl Renderer<io::Stdout> {
    pub fn stdout() -> Self {
        let color = io::stdout().is_terminal();
        Self::new(io::stdout(), color)
    }
}

impl<W: Write> Renderer<W> {
    pub fn new(out: W, color: bool) -> Self {
        Self {
            out,
            color,
            preview_shown: false,
        }
    }

    pub fn entry(&mut self, entry: &LogEntry) -> io::Result<()> {
        self.erase_preview()?;
        let line = format_entry(entry);
        if self.color {
            queue!(
                self.out,
                SetForegroundColor(kind_color(entry.kind)),
                Print(line),
                ResetColor,
                Print("\n")
            )?;
        } else {
            writeln!(self.out, "{line}")?;
        }
        self.out.flush()
    }

    /// Show (or with `None`, remove) the in-flight partial line.
    pub fn preview(&mut self, text: Option<&str>) -> io::Result<()> {
        self.erase_preview()?;
        let Some(text) = text else {
            return self.out.flush();
        };
        // Without a terminal there is no way to overwrite; skip previews.
        if !self.color {
            return Ok(());
        }
        queue!(
            self.out,
            SetAttribute(Attribute::Dim),
            Print(format!("{text}{PREVIEW_SUFFIX}")),
            SetAttribute(Attribute::Reset)
        )?;
        self.preview_shown = true;
        self.out.flush()
    }

    pub fn status(&mut self, status: &SessionStatus) -> io::Result<()> {
        self.erase_preview()?;
        if self.color {
            queue!(
                self.out,
                SetAttribute(Attribute::Italic),
                Print(format!("-- {} --", status.message)),
                SetAttribute(Attribute::Reset),
                Print("\n")
            )?;
        } else {
            writeln!(self.out, "-- {} --", status.message)?;
        }
        self.out.flush()
    }

    /// Wipe the visible screen, used when the log is cleared.
    pub fn clear_screen(&mut self) -> io::Result<()> {
        self.preview_shown = false;
        if self.color {
            queue!(self.out, Clear(ClearType::All), cursor::MoveTo(0, 0))?;
        }
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn erase_preview(&mut self) -> io::Result<()> {
        if self.preview_shown {
            queue!(self.out, Print("\r"), Clear(ClearType::CurrentLine))?;
            self.preview_shown = false;
        }
        Ok(())
    }
}
