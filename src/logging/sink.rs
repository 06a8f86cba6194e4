// SPDX-License-Identifier: Apache-2.0 OR MIT
// Text output sinks for log entries

use super::entry::LogEntry;
use super::logger::LogBackend;
use std::io::Write;
use std::sync::Mutex;

/// Output sink for log entries
pub trait LogSink: Send {
    /// Write a log entry to the sink
    fn write_entry(&mut self, entry: &LogEntry);

    /// Flush any buffered output
    fn flush(&mut self);
}

/// Standard error sink (writes plain text lines to stderr)
pub struct StderrSink {
    stderr: std::io::Stderr,
}

impl StderrSink {
    pub fn new() -> Self {
        Self {
            stderr: std::io::stderr(),
        }
    }
}

impl Default for StderrSink {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for StderrSink {
    fn write_entry(&mut self, entry: &LogEntry) {
        let _ = writeln!(self.stderr, "{}", entry.to_text());
    }

    fn flush(&mut self) {
        let _ = self.stderr.flush();
    }
}

/// Sink writing into any `Write` implementation (files, buffers)
pub struct WriterSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> LogSink for WriterSink<W> {
    fn write_entry(&mut self, entry: &LogEntry) {
        let _ = writeln!(self.writer, "{}", entry.to_text());
    }

    fn flush(&mut self) {
        let _ = self.writer.flush();
    }
}

/// Adapts a `LogSink` into a logger backend
pub struct SinkBackend<S: LogSink> {
    sink: Mutex<S>,
}

impl<S: LogSink> SinkBackend<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }
}

impl<S: LogSink> LogBackend for SinkBackend<S> {
    fn write(&self, entry: LogEntry) {
        let mut sink = match self.sink.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sink.write_entry(&entry);
        if entry.severity <= super::Severity::Warning {
            sink.flush();
        }
    }
}
