// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Protocol state machines
//!
//! The only protocol here is the PIM-SM downstream core. Timer types live
//! at this level so the timer queue in the supervisor does not depend on
//! PIM internals beyond the identifiers it carries.

pub mod pim;

use std::net::Ipv4Addr;
use std::time::Instant;

use serde::Serialize;

use pim::{ChannelId, UpstreamId, VifIndex};

/// Handle returned when a timer is scheduled
///
/// Tokens are never reused. An owner that stores a token and later sees a
/// different token fire knows the expiry is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TimerToken(pub(crate) u64);

impl std::fmt::Display for TimerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Types of timers used by the PIM core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TimerType {
    /// Downstream join expiry timer (ET) of an interface channel
    IfJoinExpiry(ChannelId),
    /// Prune-pending timer (PPT) of an interface channel
    PrunePending(ChannelId),
    /// Assert timer (AT) of an interface channel
    Assert(ChannelId),
    /// Keepalive timer of an upstream entry
    UpstreamKeepalive(UpstreamId),
    /// Neighbor liveness (Hello holdtime)
    NeighborExpiry {
        vif: VifIndex,
        neighbor: Ipv4Addr,
    },
}

/// A timer that has been scheduled, as returned on expiry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRequest {
    pub token: TimerToken,
    pub timer_type: TimerType,
    /// When the timer was due to fire
    pub fire_at: Instant,
}
