// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Inbound events in serializable form
//!
//! The event loop and the replay driver feed the core through
//! [`PimCore::handle_event`]; each variant maps onto one public handler.

use std::net::Ipv4Addr;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::assert::AssertMetric;
use super::join_prune::JoinPruneGroup;
use super::sg::{SourceFlags, SourceGroup};
use super::upstream::Rpf;
use super::PimCore;
use crate::log_warning;
use crate::logging::Facility;

fn default_holdtime() -> u16 {
    210
}

fn default_dr_priority() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PimEvent {
    LocalMembershipAdd {
        interface: String,
        sg: SourceGroup,
        #[serde(default)]
        vxlan: bool,
    },
    LocalMembershipDel {
        interface: String,
        sg: SourceGroup,
    },
    MembershipClear {
        interface: String,
    },
    /// A whole Join/Prune message
    JoinPrune {
        interface: String,
        neighbor: Ipv4Addr,
        upstream: Ipv4Addr,
        #[serde(default = "default_holdtime")]
        holdtime: u16,
        groups: Vec<JoinPruneGroup>,
    },
    Join {
        interface: String,
        neighbor: Ipv4Addr,
        upstream: Ipv4Addr,
        sg: SourceGroup,
        #[serde(default)]
        flags: SourceFlags,
        #[serde(default = "default_holdtime")]
        holdtime: u16,
    },
    Prune {
        interface: String,
        upstream: Ipv4Addr,
        sg: SourceGroup,
        #[serde(default)]
        flags: SourceFlags,
        #[serde(default = "default_holdtime")]
        holdtime: u16,
    },
    Assert {
        interface: String,
        sg: SourceGroup,
        metric: AssertMetric,
    },
    InterfaceState {
        interface: String,
        up: bool,
    },
    NewInterfaceJoined {
        interface: String,
    },
    NeighborUp {
        interface: String,
        address: Ipv4Addr,
        #[serde(default = "default_dr_priority")]
        dr_priority: u32,
        #[serde(default)]
        holdtime: Option<u16>,
    },
    NeighborDown {
        interface: String,
        address: Ipv4Addr,
    },
    /// Route lookup result for an entry; `interface: None` withdraws it
    SetRpf {
        sg: SourceGroup,
        #[serde(default)]
        interface: Option<String>,
        #[serde(default = "unspecified")]
        neighbor: Ipv4Addr,
        #[serde(default)]
        metric_preference: u32,
        #[serde(default)]
        route_metric: u32,
    },
    SetSptBit {
        sg: SourceGroup,
        spt: bool,
    },
    /// Data seen for an (S,G)
    RefreshKeepalive {
        sg: SourceGroup,
    },
    HoldUpstream {
        sg: SourceGroup,
    },
    ReleaseUpstream {
        sg: SourceGroup,
    },
}

fn unspecified() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

impl PimEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PimEvent::LocalMembershipAdd { .. } => "local_membership_add",
            PimEvent::LocalMembershipDel { .. } => "local_membership_del",
            PimEvent::MembershipClear { .. } => "membership_clear",
            PimEvent::JoinPrune { .. } => "join_prune",
            PimEvent::Join { .. } => "join",
            PimEvent::Prune { .. } => "prune",
            PimEvent::Assert { .. } => "assert",
            PimEvent::InterfaceState { .. } => "interface_state",
            PimEvent::NewInterfaceJoined { .. } => "new_interface_joined",
            PimEvent::NeighborUp { .. } => "neighbor_up",
            PimEvent::NeighborDown { .. } => "neighbor_down",
            PimEvent::SetRpf { .. } => "set_rpf",
            PimEvent::SetSptBit { .. } => "set_spt_bit",
            PimEvent::RefreshKeepalive { .. } => "refresh_keepalive",
            PimEvent::HoldUpstream { .. } => "hold_upstream",
            PimEvent::ReleaseUpstream { .. } => "release_upstream",
        }
    }
}

impl PimCore {
    /// Apply one event; returns whether the handler accepted it
    pub fn handle_event(&mut self, event: PimEvent, now: Instant) -> bool {
        match event {
            PimEvent::LocalMembershipAdd { interface, sg, vxlan } => {
                self.local_membership_add(&interface, sg, vxlan, now)
            }
            PimEvent::LocalMembershipDel { interface, sg } => self.local_membership_del(&interface, sg, now),
            PimEvent::MembershipClear { interface } => self.membership_clear(&interface, now),
            PimEvent::JoinPrune {
                interface,
                neighbor,
                upstream,
                holdtime,
                groups,
            } => self.receive_join_prune(&interface, neighbor, upstream, holdtime, &groups, now),
            PimEvent::Join {
                interface,
                neighbor,
                upstream,
                sg,
                flags,
                holdtime,
            } => self.receive_join(&interface, neighbor, upstream, sg, flags, holdtime, now),
            PimEvent::Prune {
                interface,
                upstream,
                sg,
                flags,
                holdtime,
            } => self.receive_prune(&interface, upstream, sg, flags, holdtime, now),
            PimEvent::Assert { interface, sg, metric } => self.receive_assert(&interface, sg, metric, now),
            PimEvent::InterfaceState { interface, up } => self.interface_state_change(&interface, up, now),
            PimEvent::NewInterfaceJoined { interface } => self.new_interface_joined(&interface, now),
            PimEvent::NeighborUp {
                interface,
                address,
                dr_priority,
                holdtime,
            } => self.neighbor_up(&interface, address, dr_priority, holdtime, now),
            PimEvent::NeighborDown { interface, address } => self.neighbor_down(&interface, address, now),
            PimEvent::SetRpf {
                sg,
                interface,
                neighbor,
                metric_preference,
                route_metric,
            } => {
                let vif = match interface {
                    Some(name) => match self.names.get(&name) {
                        Some(vif) => Some(*vif),
                        None => {
                            log_warning!(
                                self.logger,
                                Facility::Upstream,
                                &format!("rpf for {} on unknown interface {}", sg, name)
                            );
                            return false;
                        }
                    },
                    None => None,
                };
                let rpf = Rpf {
                    interface: vif,
                    neighbor,
                    metric_preference,
                    route_metric,
                };
                self.set_rpf(sg, rpf, now)
            }
            PimEvent::SetSptBit { sg, spt } => self.set_spt_bit(sg, spt, now),
            PimEvent::RefreshKeepalive { sg } => self.refresh_keepalive(sg, now),
            PimEvent::HoldUpstream { sg } => {
                self.hold_upstream(sg, now);
                true
            }
            PimEvent::ReleaseUpstream { sg } => self.release_upstream(sg, now),
        }
    }
}
