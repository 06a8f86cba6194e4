// SPDX-License-Identifier: Apache-2.0 OR MIT
// Log entry structure

use super::{Facility, Severity};
use serde::Serialize;

/// Key-value pair for structured logging
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

impl std::fmt::Debug for KeyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// A single log record as handed to a backend
#[derive(Clone, Serialize)]
pub struct LogEntry {
    pub severity: Severity,
    pub facility: Facility,
    /// Nanoseconds since the first entry created by this process
    pub timestamp_ns: u64,
    /// Assigned by backends that keep ordering (MemoryLog)
    pub sequence: u64,
    message: String,
    kvs: Vec<KeyValue>,
}

impl LogEntry {
    /// Maximum number of key-value pairs kept per entry
    pub const MAX_KVS: usize = 4;

    pub fn new(severity: Severity, facility: Facility, message: &str) -> Self {
        Self {
            severity,
            facility,
            timestamp_ns: monotonic_nanos(),
            sequence: 0,
            message: message.to_string(),
            kvs: Vec::new(),
        }
    }

    pub fn get_message(&self) -> &str {
        &self.message
    }

    /// Add a key-value pair (extra pairs beyond MAX_KVS are dropped)
    pub fn add_kv(&mut self, key: &str, value: &str) {
        if self.kvs.len() < Self::MAX_KVS {
            self.kvs.push(KeyValue::new(key, value));
        }
    }

    pub fn get_kvs(&self) -> &[KeyValue] {
        &self.kvs
    }

    /// Plain text rendering: `[SEVERITY] [Facility] message k=v ...`
    pub fn to_text(&self) -> String {
        if self.kvs.is_empty() {
            format!("[{}] [{}] {}", self.severity, self.facility, self.message)
        } else {
            let kv_str: Vec<String> = self.kvs.iter().map(|kv| format!("{:?}", kv)).collect();
            format!(
                "[{}] [{}] {} {}",
                self.severity,
                self.facility,
                self.message,
                kv_str.join(" ")
            )
        }
    }
}

impl std::fmt::Debug for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("LogEntry");
        debug
            .field("severity", &self.severity)
            .field("facility", &self.facility)
            .field("message", &self.message);

        if !self.kvs.is_empty() {
            debug.field("kvs", &self.kvs);
        }

        debug.finish()
    }
}

/// Get monotonic nanoseconds since an arbitrary point
fn monotonic_nanos() -> u64 {
    use std::time::Instant;
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_creation() {
        let entry = LogEntry::new(Severity::Info, Facility::IfChannel, "Test message");
        assert_eq!(entry.severity, Severity::Info);
        assert_eq!(entry.facility, Facility::IfChannel);
        assert_eq!(entry.get_message(), "Test message");
    }

    #[test]
    fn test_add_kv() {
        let mut entry = LogEntry::new(Severity::Info, Facility::Oil, "Test");
        entry.add_kv("sg", "(10.0.0.1,239.1.1.1)");
        entry.add_kv("vif", "3");

        assert_eq!(entry.get_kvs().len(), 2);
        assert_eq!(entry.get_kvs()[0].key, "sg");
        assert_eq!(entry.get_kvs()[1].value, "3");
    }

    #[test]
    fn test_max_kvs() {
        let mut entry = LogEntry::new(Severity::Info, Facility::Oil, "Test");
        for i in 0..6 {
            entry.add_kv("k", &i.to_string());
        }
        assert_eq!(entry.get_kvs().len(), LogEntry::MAX_KVS);
    }

    #[test]
    fn test_text_rendering() {
        let mut entry = LogEntry::new(Severity::Warning, Facility::Assert, "loser got join");
        assert_eq!(entry.to_text(), "[WARNING] [Assert] loser got join");
        entry.add_kv("if", "eth0");
        assert_eq!(entry.to_text(), "[WARNING] [Assert] loser got join if=eth0");
    }

    #[test]
    fn test_timestamps_monotonic() {
        let a = LogEntry::new(Severity::Debug, Facility::Timer, "a");
        let b = LogEntry::new(Severity::Debug, Facility::Timer, "b");
        assert!(b.timestamp_ns >= a.timestamp_ns);
    }
}
