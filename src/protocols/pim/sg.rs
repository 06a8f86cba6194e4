// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Source-Group keys and Join/Prune encoded-source flags.

use std::cmp::Ordering;
use std::fmt;
use std::net::Ipv4Addr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::error::PimError;

/// Wildcard address for source or group
pub const WILDCARD: Ipv4Addr = Ipv4Addr::UNSPECIFIED;

/// A (source, group) pair where `0.0.0.0` means "any".
///
/// Valid forms are (*,*), (*,G) and (S,G). (S,*) cannot be built through
/// [`SourceGroup::new`] and is rejected by every table operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawSourceGroup")]
pub struct SourceGroup {
    pub source: Ipv4Addr,
    pub group: Ipv4Addr,
}

#[derive(Deserialize)]
struct RawSourceGroup {
    #[serde(default = "wildcard")]
    source: Ipv4Addr,
    #[serde(default = "wildcard")]
    group: Ipv4Addr,
}

fn wildcard() -> Ipv4Addr {
    WILDCARD
}

impl TryFrom<RawSourceGroup> for SourceGroup {
    type Error = PimError;

    fn try_from(raw: RawSourceGroup) -> Result<Self, Self::Error> {
        SourceGroup::new(raw.source, raw.group)
    }
}

impl SourceGroup {
    pub fn new(source: Ipv4Addr, group: Ipv4Addr) -> Result<Self, PimError> {
        let sg = Self { source, group };
        if sg.is_valid() {
            Ok(sg)
        } else {
            Err(PimError::InvalidSourceGroup(sg.to_string()))
        }
    }

    /// (*,G)
    pub const fn star_g(group: Ipv4Addr) -> Self {
        Self {
            source: WILDCARD,
            group,
        }
    }

    /// (*,*)
    pub const fn star_star() -> Self {
        Self {
            source: WILDCARD,
            group: WILDCARD,
        }
    }

    pub fn is_valid(&self) -> bool {
        !(self.source != WILDCARD && self.group == WILDCARD)
    }

    pub fn source_is_wildcard(&self) -> bool {
        self.source == WILDCARD
    }

    pub fn is_star_g(&self) -> bool {
        self.source == WILDCARD && self.group != WILDCARD
    }

    pub fn is_star_star(&self) -> bool {
        self.source == WILDCARD && self.group == WILDCARD
    }

    pub fn is_sg(&self) -> bool {
        self.source != WILDCARD && self.group != WILDCARD
    }

    /// The covering (*,G) key of an (S,G); None for wildcard-source keys
    pub fn parent(&self) -> Option<SourceGroup> {
        self.is_sg().then(|| SourceGroup::star_g(self.group))
    }
}

impl Ord for SourceGroup {
    fn cmp(&self, other: &Self) -> Ordering {
        self.group
            .cmp(&other.group)
            .then_with(|| self.source.cmp(&other.source))
    }
}

impl PartialOrd for SourceGroup {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SourceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fmt_addr = |addr: Ipv4Addr| {
            if addr == WILDCARD {
                "*".to_string()
            } else {
                addr.to_string()
            }
        };
        write!(f, "({},{})", fmt_addr(self.source), fmt_addr(self.group))
    }
}

bitflags! {
    /// Encoded-source flags carried per source in a Join/Prune message
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct SourceFlags: u8 {
        const RPT = 0x01;
        const WILDCARD = 0x02;
        const SPARSE = 0x04;
    }
}

impl SourceFlags {
    /// RPT set without WC: the entry is an (S,G,rpt) exception
    pub fn is_sg_rpt(self) -> bool {
        self.contains(SourceFlags::RPT) && !self.contains(SourceFlags::WILDCARD)
    }
}
