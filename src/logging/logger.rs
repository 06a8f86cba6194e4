// SPDX-License-Identifier: Apache-2.0 OR MIT
// Logger, backends and LogRegistry

use super::entry::LogEntry;
use super::sink::{SinkBackend, StderrSink, WriterSink};
use super::{Facility, Severity};
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Where log entries go once they pass level filtering
pub trait LogBackend: Send + Sync {
    fn write(&self, entry: LogEntry);
}

/// Simple stderr JSON logger (one object per line)
pub struct StderrJsonLogger;

impl LogBackend for StderrJsonLogger {
    fn write(&self, entry: LogEntry) {
        let mut log_msg = serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "level": format!("{:?}", entry.severity),
            "facility": format!("{:?}", entry.facility),
            "message": entry.get_message(),
        });
        if !entry.get_kvs().is_empty() {
            let kvs: serde_json::Map<String, serde_json::Value> = entry
                .get_kvs()
                .iter()
                .map(|kv| (kv.key.clone(), serde_json::Value::from(kv.value.clone())))
                .collect();
            log_msg["kvs"] = serde_json::Value::Object(kvs);
        }
        eprintln!("{}", log_msg);
    }
}

/// Bounded in-memory capture; oldest entries are dropped first
pub struct MemoryLog {
    capacity: usize,
    next_sequence: AtomicU64,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl MemoryLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_sequence: AtomicU64::new(0),
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<LogEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Copy of every retained entry, oldest first
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.lock().iter().cloned().collect()
    }

    /// Remove and return every retained entry
    pub fn drain(&self) -> Vec<LogEntry> {
        self.lock().drain(..).collect()
    }

    /// True if any retained entry's message contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.lock().iter().any(|e| e.get_message().contains(needle))
    }

    pub fn count(&self, facility: Facility) -> usize {
        self.lock().iter().filter(|e| e.facility == facility).count()
    }

    /// Total number of entries ever written, including dropped ones
    pub fn written(&self) -> u64 {
        self.next_sequence.load(Ordering::Relaxed)
    }
}

impl LogBackend for MemoryLog {
    fn write(&self, mut entry: LogEntry) {
        entry.sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }
}

/// Backend that discards everything
struct NullBackend;

impl LogBackend for NullBackend {
    fn write(&self, _entry: LogEntry) {}
}

type FacilityLevels = Arc<RwLock<HashMap<Facility, Severity>>>;

/// Logger handle for writing log entries
///
/// This is a lightweight handle that can be cloned and passed around.
/// The backend and level filters are shared via Arc.
#[derive(Clone)]
pub struct Logger {
    backend: Arc<dyn LogBackend>,
    /// Global minimum log level (default: Info)
    global_min_level: Arc<AtomicU8>,
    /// Per-facility minimum log levels
    facility_min_levels: FacilityLevels,
}

impl Logger {
    /// Create a logger over any backend with fresh level filters
    pub fn from_backend(backend: Arc<dyn LogBackend>, level: Severity) -> Self {
        Self {
            backend,
            global_min_level: Arc::new(AtomicU8::new(level as u8)),
            facility_min_levels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create a logger that writes JSON directly to stderr
    pub fn stderr_json() -> Self {
        Self::from_backend(Arc::new(StderrJsonLogger), Severity::Info)
    }

    /// Create a logger that writes plain text lines to stderr
    pub fn stderr_text() -> Self {
        Self::from_backend(
            Arc::new(SinkBackend::new(StderrSink::new())),
            Severity::Info,
        )
    }

    /// Create a logger that captures everything (Debug and above) in memory
    pub fn memory(capacity: usize) -> (Self, Arc<MemoryLog>) {
        let log = Arc::new(MemoryLog::new(capacity));
        let logger = Self::from_backend(Arc::clone(&log) as Arc<dyn LogBackend>, Severity::Debug);
        (logger, log)
    }

    /// Logger that drops every entry
    pub fn disabled() -> Self {
        Self::from_backend(Arc::new(NullBackend), Severity::Emergency)
    }

    /// Check if a log message should be written based on severity filtering
    #[inline]
    fn should_log(&self, severity: Severity, facility: Facility) -> bool {
        // Facility-specific level overrides global
        let facility_level = match self.facility_min_levels.read() {
            Ok(levels) => levels.get(&facility).copied(),
            Err(poisoned) => poisoned.into_inner().get(&facility).copied(),
        };
        if let Some(min_level) = facility_level {
            return severity <= min_level;
        }

        let global_min = self.global_min_level.load(Ordering::Relaxed);
        (severity as u8) <= global_min
    }

    /// Write a log entry
    #[inline]
    pub fn log(&self, severity: Severity, facility: Facility, message: &str) {
        if !self.should_log(severity, facility) {
            return;
        }

        self.backend.write(LogEntry::new(severity, facility, message));
    }

    /// Write a log entry with key-value pairs
    #[inline]
    pub fn log_kv(
        &self,
        severity: Severity,
        facility: Facility,
        message: &str,
        kvs: &[(&str, &str)],
    ) {
        if !self.should_log(severity, facility) {
            return;
        }

        let mut entry = LogEntry::new(severity, facility, message);
        for (key, value) in kvs {
            entry.add_kv(key, value);
        }
        self.backend.write(entry);
    }

    /// True when Debug output for `facility` would be written
    ///
    /// Lets callers skip formatting cost on hot paths.
    #[inline]
    pub fn debug_enabled(&self, facility: Facility) -> bool {
        self.should_log(Severity::Debug, facility)
    }

    #[inline]
    pub fn critical(&self, facility: Facility, message: &str) {
        self.log(Severity::Critical, facility, message);
    }

    #[inline]
    pub fn error(&self, facility: Facility, message: &str) {
        self.log(Severity::Error, facility, message);
    }

    #[inline]
    pub fn warning(&self, facility: Facility, message: &str) {
        self.log(Severity::Warning, facility, message);
    }

    #[inline]
    pub fn notice(&self, facility: Facility, message: &str) {
        self.log(Severity::Notice, facility, message);
    }

    #[inline]
    pub fn info(&self, facility: Facility, message: &str) {
        self.log(Severity::Info, facility, message);
    }

    #[inline]
    pub fn debug(&self, facility: Facility, message: &str) {
        self.log(Severity::Debug, facility, message);
    }

    /// Set the global minimum log level
    pub fn set_global_level(&self, level: Severity) {
        self.global_min_level.store(level as u8, Ordering::Relaxed);
    }

    /// Set the minimum log level for a specific facility
    pub fn set_facility_level(&self, facility: Facility, level: Severity) {
        match self.facility_min_levels.write() {
            Ok(mut levels) => levels.insert(facility, level),
            Err(poisoned) => poisoned.into_inner().insert(facility, level),
        };
    }

    /// Clear the facility-specific log level (fall back to global)
    pub fn clear_facility_level(&self, facility: Facility) {
        match self.facility_min_levels.write() {
            Ok(mut levels) => levels.remove(&facility),
            Err(poisoned) => poisoned.into_inner().remove(&facility),
        };
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::disabled()
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("global_min_level", &self.global_min_level.load(Ordering::Relaxed))
            .finish()
    }
}

/// Registry of per-facility loggers sharing one backend and one set of levels
pub struct LogRegistry {
    loggers: HashMap<Facility, Logger>,
    global_min_level: Arc<AtomicU8>,
    facility_min_levels: FacilityLevels,
}

impl LogRegistry {
    /// Create a registry with a logger for every facility over `backend`
    pub fn new(backend: Arc<dyn LogBackend>, level: Severity) -> Self {
        let global_min_level = Arc::new(AtomicU8::new(level as u8));
        let facility_min_levels: FacilityLevels = Arc::new(RwLock::new(HashMap::new()));

        let loggers = Facility::ALL
            .iter()
            .map(|facility| {
                let logger = Logger {
                    backend: Arc::clone(&backend),
                    global_min_level: Arc::clone(&global_min_level),
                    facility_min_levels: Arc::clone(&facility_min_levels),
                };
                (*facility, logger)
            })
            .collect();

        Self {
            loggers,
            global_min_level,
            facility_min_levels,
        }
    }

    /// Registry writing JSON lines to stderr
    pub fn stderr_json(level: Severity) -> Self {
        Self::new(Arc::new(StderrJsonLogger), level)
    }

    /// Registry writing plain text lines to stderr
    pub fn stderr_text(level: Severity) -> Self {
        Self::new(Arc::new(SinkBackend::new(StderrSink::new())), level)
    }

    /// Registry writing plain text lines into `writer` (a log file)
    pub fn text_writer<W: Write + Send + 'static>(writer: W, level: Severity) -> Self {
        Self::new(Arc::new(SinkBackend::new(WriterSink::new(writer))), level)
    }

    /// Get a logger for a specific facility
    pub fn get(&self, facility: Facility) -> Option<&Logger> {
        self.loggers.get(&facility)
    }

    /// Get a cloned logger for a specific facility
    pub fn get_logger(&self, facility: Facility) -> Option<Logger> {
        self.loggers.get(&facility).cloned()
    }

    /// Set the global minimum log level
    ///
    /// This affects all facilities unless overridden by facility-specific levels.
    pub fn set_global_level(&self, level: Severity) {
        self.global_min_level.store(level as u8, Ordering::Relaxed);
    }

    /// Get the global minimum log level
    pub fn get_global_level(&self) -> Severity {
        let level = self.global_min_level.load(Ordering::Relaxed);
        Severity::from_u8(level).unwrap_or(Severity::Info)
    }

    /// Set the minimum log level for a specific facility
    pub fn set_facility_level(&self, facility: Facility, level: Severity) {
        match self.facility_min_levels.write() {
            Ok(mut levels) => levels.insert(facility, level),
            Err(poisoned) => poisoned.into_inner().insert(facility, level),
        };
    }

    /// Get the minimum log level for a specific facility
    ///
    /// Returns the facility-specific level if set, otherwise the global level.
    pub fn get_facility_level(&self, facility: Facility) -> Severity {
        let level = match self.facility_min_levels.read() {
            Ok(levels) => levels.get(&facility).copied(),
            Err(poisoned) => poisoned.into_inner().get(&facility).copied(),
        };
        level.unwrap_or_else(|| self.get_global_level())
    }
}
