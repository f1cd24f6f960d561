//! Append-only progress channel and the user-visible notification seam.
//!
//! The [`LogSink`] carries human-readable progress lines (resolved command
//! lines, process output, sync summaries) to whatever surface the caller
//! displays. Lines are appended in the order they are produced; diagnostic
//! logging goes through `tracing` separately.

use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::error;

/// Append-only text channel receiving progress lines.
pub trait LogSink: Send + Sync {
    /// Appends a single line. Implementations must preserve call order.
    fn append(&self, line: &str);
}

/// Sink writing each line to an [`io::Write`] target and flushing it.
#[derive(Debug)]
pub struct WriterSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl WriterSink<io::Stdout> {
    /// Creates a sink that writes to standard output.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl WriterSink<io::Stderr> {
    /// Creates a sink that writes to standard error.
    #[must_use]
    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }
}

impl<W: Write + Send> WriterSink<W> {
    /// Wraps an arbitrary writer.
    #[must_use]
    pub const fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send> LogSink for WriterSink<W> {
    fn append(&self, line: &str) {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{line}").ok();
        writer.flush().ok();
    }
}

/// In-memory sink that records every line; cloned handles share storage.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of the recorded lines.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the index of the first line containing `needle`.
    #[must_use]
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.lines().iter().position(|line| line.contains(needle))
    }

    /// Returns `true` when any recorded line contains `needle`.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.position(needle).is_some()
    }
}

impl LogSink for MemorySink {
    fn append(&self, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.to_owned());
    }
}

/// User-visible notification channel owned by the triggering layer.
pub trait Notifier: Send + Sync {
    /// Surfaces an operation failure to the user.
    fn notify_error(&self, message: &str);
}

/// Notifier that reports failures through `tracing` at error level.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify_error(&self, message: &str) {
        error!(%message, "operation failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_sink_preserves_line_order() {
        let sink = WriterSink::new(Vec::new());
        sink.append("first");
        sink.append("second");

        let buffer = sink
            .writer
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        assert_eq!(
            String::from_utf8(buffer).expect("utf8"),
            "first\nsecond\n"
        );
    }

    #[test]
    fn memory_sink_clones_share_storage() {
        let sink = MemorySink::new();
        let clone = sink.clone();
        clone.append("from clone");

        assert!(sink.contains("from clone"));
        assert_eq!(sink.position("clone"), Some(0));
    }
}
