// SPDX-License-Identifier: Apache-2.0 OR MIT
// Facility/severity logging for the PIM core
//
// Every component logs through a cheap-to-clone `Logger` handle. Level
// filtering (global plus per-facility overrides) happens before an entry
// is built; backends decide where entries go (stderr JSON, stderr text,
// bounded in-memory capture for tests and scenario replay).

mod entry;
mod facility;
mod logger;
#[macro_use]
mod macros;
mod severity;
mod sink;

// Public exports
pub use entry::{KeyValue, LogEntry};
pub use facility::Facility;
pub use logger::{LogBackend, LogRegistry, Logger, MemoryLog, StderrJsonLogger};
pub use severity::Severity;
pub use sink::{LogSink, SinkBackend, StderrSink, WriterSink};
