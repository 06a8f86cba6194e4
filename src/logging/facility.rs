// SPDX-License-Identifier: Apache-2.0 OR MIT
// Logging facilities (component identifiers)

use serde::{Deserialize, Serialize};

/// Logging facility - identifies which component generated the log message
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Facility {
    // === PIM core ===
    /// Interface-channel lifecycle and join/prune state machine
    IfChannel = 0,
    /// Assert election
    Assert = 1,
    /// Upstream entry registry, join-desired evaluation
    Upstream = 2,
    /// Outgoing interface list changes
    Oil = 3,
    /// PIM interfaces, neighbors and DR election
    Interface = 4,

    // === Runtime ===
    /// Timer queue
    Timer = 5,
    /// Event loop
    Supervisor = 6,
    /// Configuration loading and validation
    Config = 7,

    // === Testing and Utilities ===
    /// Test harness and fixtures
    Test = 12,

    /// Fallback for uncategorized messages
    Unknown = 255,
}

impl Facility {
    /// All facilities that get a logger in a registry
    pub const ALL: [Facility; 9] = [
        Facility::IfChannel,
        Facility::Assert,
        Facility::Upstream,
        Facility::Oil,
        Facility::Interface,
        Facility::Timer,
        Facility::Supervisor,
        Facility::Config,
        Facility::Test,
    ];

    /// Get facility code as u8
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Get facility name as static string
    pub const fn as_str(self) -> &'static str {
        match self {
            Facility::IfChannel => "IfChannel",
            Facility::Assert => "Assert",
            Facility::Upstream => "Upstream",
            Facility::Oil => "Oil",
            Facility::Interface => "Interface",
            Facility::Timer => "Timer",
            Facility::Supervisor => "Supervisor",
            Facility::Config => "Config",
            Facility::Test => "Test",
            Facility::Unknown => "Unknown",
        }
    }

    /// Create from u8 value (returns Unknown if invalid)
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Facility::IfChannel,
            1 => Facility::Assert,
            2 => Facility::Upstream,
            3 => Facility::Oil,
            4 => Facility::Interface,
            5 => Facility::Timer,
            6 => Facility::Supervisor,
            7 => Facility::Config,
            12 => Facility::Test,
            _ => Facility::Unknown,
        }
    }

    /// Check if this facility logs on every protocol message
    pub const fn is_high_frequency(self) -> bool {
        matches!(self, Facility::IfChannel | Facility::Oil | Facility::Timer)
    }

    /// Number of entries kept by an in-memory capture for this facility
    pub const fn buffer_size(self) -> usize {
        match self {
            Facility::IfChannel => 4096,
            Facility::Oil => 2048,
            Facility::Timer => 2048,
            Facility::Assert | Facility::Upstream => 1024,
            _ => 512,
        }
    }
}

impl std::fmt::Display for Facility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
