// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Configuration file types and parsing for the PIM core.
//!
//! JSON5 configuration format supporting:
//! - Protocol timer overrides (RFC 7761 defaults when absent)
//! - The SSM group range
//! - The PIM interface list
//! - Comments and trailing commas

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// Startup configuration (JSON5 file format)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoreConfig {
    /// J/P_Override_Interval in milliseconds
    #[serde(default = "default_jp_override_interval_ms")]
    pub jp_override_interval_ms: u64,

    /// Keepalive_Period of last-hop-router upstream entries
    #[serde(default = "default_keep_alive_time_secs")]
    pub keep_alive_time_secs: u64,

    #[serde(default = "default_assert_time_secs")]
    pub assert_time_secs: u64,

    #[serde(default = "default_assert_override_interval_secs")]
    pub assert_override_interval_secs: u64,

    /// Groups handled source-specifically; (*,G) membership is not tracked
    #[serde(default = "default_ssm_range")]
    pub ssm_range: GroupRange,

    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
}

fn default_jp_override_interval_ms() -> u64 {
    3000
}

fn default_keep_alive_time_secs() -> u64 {
    210
}

fn default_assert_time_secs() -> u64 {
    180
}

fn default_assert_override_interval_secs() -> u64 {
    3
}

fn default_ssm_range() -> GroupRange {
    GroupRange {
        prefix: Ipv4Addr::new(232, 0, 0, 0),
        len: 8,
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            jp_override_interval_ms: default_jp_override_interval_ms(),
            keep_alive_time_secs: default_keep_alive_time_secs(),
            assert_time_secs: default_assert_time_secs(),
            assert_override_interval_secs: default_assert_override_interval_secs(),
            ssm_range: default_ssm_range(),
            interfaces: Vec::new(),
        }
    }
}

/// One PIM interface as stored in the config file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterfaceConfig {
    /// Network interface name
    pub name: String,

    /// Multicast VIF index used to address the interface in OILs
    pub vif_index: u32,

    /// Our primary address on the interface
    pub address: Ipv4Addr,

    #[serde(default = "default_true")]
    pub pim_enabled: bool,

    #[serde(default = "default_dr_priority")]
    pub dr_priority: u32,

    /// Interface is one leg of a multi-chassis link aggregation
    #[serde(default)]
    pub dual_active: bool,
}

fn default_true() -> bool {
    true
}

fn default_dr_priority() -> u32 {
    1
}

/// An IPv4 prefix written as "a.b.c.d/len"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GroupRange {
    pub prefix: Ipv4Addr,
    pub len: u8,
}

impl GroupRange {
    pub fn new(prefix: Ipv4Addr, len: u8) -> Result<Self, ConfigError> {
        if len > 32 {
            return Err(ConfigError::InvalidGroupRange {
                range: format!("{}/{}", prefix, len),
                reason: "prefix length above 32".to_string(),
            });
        }
        Ok(Self {
            prefix: Ipv4Addr::from(u32::from(prefix) & Self::mask(len)),
            len,
        })
    }

    fn mask(len: u8) -> u32 {
        match len {
            0 => 0,
            n => u32::MAX << (32 - u32::from(n)),
        }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & Self::mask(self.len) == u32::from(self.prefix)
    }

    /// True if the whole range lies inside 224.0.0.0/4
    pub fn is_multicast(&self) -> bool {
        self.len >= 4 && self.prefix.is_multicast()
    }
}

impl TryFrom<String> for GroupRange {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<GroupRange> for String {
    fn from(range: GroupRange) -> Self {
        range.to_string()
    }
}

impl std::str::FromStr for GroupRange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidGroupRange {
            range: s.to_string(),
            reason: reason.to_string(),
        };
        let (addr, len) = s.split_once('/').ok_or_else(|| invalid("missing '/len'"))?;
        let prefix: Ipv4Addr = addr.trim().parse().map_err(|_| invalid("bad address"))?;
        let len: u8 = len.trim().parse().map_err(|_| invalid("bad prefix length"))?;
        GroupRange::new(prefix, len)
    }
}

impl fmt::Display for GroupRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.prefix, self.len)
    }
}

impl CoreConfig {
    /// Load configuration from a JSON5 file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e.to_string()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        json5::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Serialize configuration (pretty JSON, which is valid JSON5)
    pub fn to_json5(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = self.to_json5();
        std::fs::write(path, content)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e.to_string()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names: HashMap<&str, usize> = HashMap::new();
        let mut vifs: HashMap<u32, usize> = HashMap::new();

        for (idx, iface) in self.interfaces.iter().enumerate() {
            validate_interface_name(&iface.name)?;

            if let Some(&first) = names.get(iface.name.as_str()) {
                return Err(ConfigError::DuplicateInterface {
                    name: iface.name.clone(),
                    indices: (first, idx),
                });
            }
            names.insert(iface.name.as_str(), idx);

            if let Some(&first) = vifs.get(&iface.vif_index) {
                return Err(ConfigError::DuplicateVifIndex {
                    vif_index: iface.vif_index,
                    indices: (first, idx),
                });
            }
            vifs.insert(iface.vif_index, idx);

            if iface.address.is_multicast()
                || iface.address.is_unspecified()
                || iface.address.is_broadcast()
            {
                return Err(ConfigError::InvalidInterfaceAddress {
                    name: iface.name.clone(),
                    address: iface.address,
                });
            }
        }

        if !self.ssm_range.is_multicast() {
            return Err(ConfigError::InvalidGroupRange {
                range: self.ssm_range.to_string(),
                reason: "SSM range must be inside 224.0.0.0/4".to_string(),
            });
        }

        if self.assert_override_interval_secs >= self.assert_time_secs {
            return Err(ConfigError::InvalidTimer {
                name: "assert_override_interval_secs".to_string(),
                reason: format!(
                    "must be shorter than assert_time_secs ({})",
                    self.assert_time_secs
                ),
            });
        }

        Ok(())
    }

    pub fn jp_override_interval(&self) -> Duration {
        Duration::from_millis(self.jp_override_interval_ms)
    }

    pub fn keep_alive_time(&self) -> Duration {
        Duration::from_secs(self.keep_alive_time_secs)
    }

    pub fn assert_time(&self) -> Duration {
        Duration::from_secs(self.assert_time_secs)
    }

    /// Assert_Time - Assert_Override_Interval: how long a winner waits before resending
    pub fn assert_resend_interval(&self) -> Duration {
        Duration::from_secs(
            self.assert_time_secs
                .saturating_sub(self.assert_override_interval_secs),
        )
    }

    pub fn is_ssm(&self, group: Ipv4Addr) -> bool {
        self.ssm_range.contains(group)
    }

    pub fn interface_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.interfaces.iter().map(|i| i.name.clone()).collect();
        names.sort();
        names
    }
}

/// Validate an interface name
fn validate_interface_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::InvalidInterfaceName {
            name: name.to_string(),
            reason: "interface name cannot be empty".to_string(),
        });
    }
    if name.len() > 15 {
        // Linux IFNAMSIZ limit
        return Err(ConfigError::InvalidInterfaceName {
            name: name.to_string(),
            reason: "interface name too long (max 15 chars)".to_string(),
        });
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(ConfigError::InvalidInterfaceName {
            name: name.to_string(),
            reason: "interface name contains invalid characters".to_string(),
        });
    }
    if name.chars().next().map(|c| c.is_ascii_digit()) == Some(true) {
        return Err(ConfigError::InvalidInterfaceName {
            name: name.to_string(),
            reason: "interface name cannot start with a digit".to_string(),
        });
    }
    Ok(())
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    IoError(std::path::PathBuf, String),
    ParseError(String),
    DuplicateInterface {
        name: String,
        indices: (usize, usize),
    },
    DuplicateVifIndex {
        vif_index: u32,
        indices: (usize, usize),
    },
    InvalidInterfaceName {
        name: String,
        reason: String,
    },
    InvalidInterfaceAddress {
        name: String,
        address: Ipv4Addr,
    },
    InvalidGroupRange {
        range: String,
        reason: String,
    },
    InvalidTimer {
        name: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(path, msg) => {
                write!(
                    f,
                    "failed to read config file '{}': {}",
                    path.display(),
                    msg
                )
            }
            ConfigError::ParseError(msg) => write!(f, "failed to parse config: {}", msg),
            ConfigError::DuplicateInterface { name, indices } => write!(
                f,
                "duplicate interface '{}' (entries {} and {})",
                name, indices.0, indices.1
            ),
            ConfigError::DuplicateVifIndex { vif_index, indices } => write!(
                f,
                "duplicate vif index {} (entries {} and {})",
                vif_index, indices.0, indices.1
            ),
            ConfigError::InvalidInterfaceName { name, reason } => {
                write!(f, "invalid interface name '{}': {}", name, reason)
            }
            ConfigError::InvalidInterfaceAddress { name, address } => {
                write!(f, "invalid address {} on interface '{}'", address, name)
            }
            ConfigError::InvalidGroupRange { range, reason } => {
                write!(f, "invalid group range '{}': {}", range, reason)
            }
            ConfigError::InvalidTimer { name, reason } => {
                write!(f, "invalid timer {}: {}", name, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
