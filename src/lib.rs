// SPDX-License-Identifier: Apache-2.0 OR MIT
//! PIM-SM (RFC 7761) downstream per-interface state machines.
//!
//! The crate tracks, for every interface and (S,G) or (*,G), the downstream
//! join/prune state, local membership and assert state, derives the
//! outgoing-interface lists of the upstream entries from them and reports
//! every forwarding-plane and message-layer side effect as a
//! [`PimAction`]. Packet encoding, route lookup and kernel programming are
//! left to the caller.

pub mod config;
pub mod logging;
pub mod protocols;
pub mod supervisor;

pub use config::{ConfigError, CoreConfig, GroupRange, InterfaceConfig};
pub use protocols::pim::{
    AssertMetric, AssertState, ChannelId, JoinPruneSender, JoinState, LocalMembership,
    OifFlags, OilAdapter, PimAction, PimCore, PimError, PimEvent, SourceFlags, SourceGroup,
    UpstreamId,
};
pub use protocols::{TimerRequest, TimerToken, TimerType};
pub use supervisor::{EventLoop, Scenario};
