// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Assert election (RFC 7761 section 4.6)
//!
//! Each interface channel carries its own assert state. The A1..A6 actions
//! below are the only places that change it; predicate updates from the
//! join and membership machinery re-enter through
//! [`PimCore::update_could_assert`] and friends.

use std::cmp::Ordering;
use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use super::actions::PimAction;
use super::ifchannel::{ChannelFlags, ChannelId};
use super::oil::OifFlags;
use super::sg::{SourceFlags, SourceGroup, WILDCARD};
use super::stats;
use super::upstream::{Rpf, UpstreamFlags, UpstreamJoinState};
use super::PimCore;
use crate::logging::Facility;
use crate::{log_debug, log_warning};

/// Assert metric; `Ord` ranks the better metric greater
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssertMetric {
    pub rpt_bit: bool,
    pub metric_preference: u32,
    pub route_metric: u32,
    pub address: Ipv4Addr,
}

impl AssertMetric {
    pub const PREFERENCE_MAX: u32 = u32::MAX;
    pub const ROUTE_METRIC_MAX: u32 = u32::MAX;

    /// Metric of a router that cannot forward
    pub const INFINITE: AssertMetric = AssertMetric {
        rpt_bit: true,
        metric_preference: Self::PREFERENCE_MAX,
        route_metric: Self::ROUTE_METRIC_MAX,
        address: WILDCARD,
    };

    pub fn new(rpt_bit: bool, metric_preference: u32, route_metric: u32, address: Ipv4Addr) -> Self {
        Self {
            rpt_bit,
            metric_preference,
            route_metric,
            address,
        }
    }

    /// The shortest-path metric toward the source as seen from `address`
    pub fn spt(rpf: &Rpf, address: Ipv4Addr) -> Self {
        Self::new(false, rpf.metric_preference, rpf.route_metric, address)
    }

    /// The metric carried by an AssertCancel
    pub fn cancel(address: Ipv4Addr) -> Self {
        Self::new(false, Self::PREFERENCE_MAX, Self::ROUTE_METRIC_MAX, address)
    }

    pub fn is_cancel(&self) -> bool {
        self.metric_preference == Self::PREFERENCE_MAX && self.route_metric == Self::ROUTE_METRIC_MAX
    }

    /// Strictly better: lower rpt bit, then lower preference, then lower
    /// route metric, then higher address
    pub fn better(&self, other: &AssertMetric) -> bool {
        self.cmp(other) == Ordering::Greater
    }
}

impl Ord for AssertMetric {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .rpt_bit
            .cmp(&self.rpt_bit)
            .then_with(|| other.metric_preference.cmp(&self.metric_preference))
            .then_with(|| other.route_metric.cmp(&self.route_metric))
            .then_with(|| self.address.cmp(&other.address))
    }
}

impl PartialOrd for AssertMetric {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for AssertMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            u8::from(self.rpt_bit),
            self.metric_preference,
            self.route_metric,
            self.address
        )
    }
}

/// Per-channel assert state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum AssertState {
    #[default]
    NoInfo,
    Winner,
    Loser,
}

impl AssertState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssertState::NoInfo => "NOINFO",
            AssertState::Winner => "WINNER",
            AssertState::Loser => "LOSER",
        }
    }
}

impl fmt::Display for AssertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PimCore {
    /// Handle a received Assert for `sg`; `metric.address` is the sender
    pub fn receive_assert(
        &mut self,
        interface: &str,
        sg: SourceGroup,
        metric: AssertMetric,
        now: std::time::Instant,
    ) -> bool {
        self.now = now;
        let neighbor = metric.address;
        let Some(vif) = self.active_vif(interface, &sg, "assert") else {
            return false;
        };
        if self.interfaces.get(&vif).map(|i| i.primary_address) == Some(neighbor) {
            log_debug!(
                self.logger,
                Facility::Assert,
                &format!("{} ignoring own assert for {}", interface, sg)
            );
            return false;
        }

        let id = self.channel_add(vif, sg, SourceFlags::empty(), UpstreamFlags::empty());
        self.dispatch_assert(id, metric);
        self.delete_on_noinfo(id);
        true
    }

    fn dispatch_assert(&mut self, id: ChannelId, recv: AssertMetric) {
        let Some(ch) = self.channels.get(&id) else {
            return;
        };
        let my = ch.assert_my_metric;
        let inferior = my.better(&recv);
        let acceptable = recv.better(&my);
        let preferred = recv.better(&ch.assert_winner_metric);
        let atd = ch.flags.contains(ChannelFlags::ASSERT_TRACKING_DESIRED);
        let could_assert = ch.flags.contains(ChannelFlags::COULD_ASSERT);
        let from_winner = recv.address == ch.assert_winner;
        let state = ch.assert_state;

        match state {
            AssertState::NoInfo => {
                if recv.rpt_bit || inferior {
                    if could_assert {
                        self.assert_action_a1(id);
                    }
                } else if acceptable && atd {
                    self.assert_action_a6(id, recv);
                }
            }
            AssertState::Winner => {
                if preferred {
                    self.assert_action_a2(id, recv);
                } else if inferior {
                    self.assert_action_a3(id);
                }
            }
            AssertState::Loser => {
                if from_winner {
                    if recv.is_cancel() || inferior {
                        self.assert_action_a5(id);
                    } else if acceptable && !recv.rpt_bit {
                        self.assert_action_a2(id, recv);
                    }
                } else if preferred {
                    self.assert_action_a2(id, recv);
                }
            }
        }
    }

    /// Assert timer expiry
    pub(crate) fn on_assert_timer(&mut self, id: ChannelId) {
        let Some(state) = self.channels.get(&id).map(|c| c.assert_state) else {
            return;
        };
        match state {
            AssertState::Winner => self.assert_action_a3(id),
            AssertState::Loser => self.assert_action_a5(id),
            AssertState::NoInfo => {
                log_warning!(
                    self.logger,
                    Facility::Assert,
                    &format!("assert timer fired in NOINFO on {}", self.describe(id))
                );
            }
        }
        self.delete_on_noinfo(id);
    }

    /// Set assert state and winner; a changed winner re-evaluates the
    /// predicates that depend on it
    pub(crate) fn assert_winner_set(
        &mut self,
        id: ChannelId,
        state: AssertState,
        winner: Ipv4Addr,
        metric: AssertMetric,
    ) {
        let Some(ch) = self.channels.get_mut(&id) else {
            return;
        };
        let winner_changed = ch.assert_winner != winner;
        let metric_changed = ch.assert_winner_metric != metric;
        let old_state = ch.assert_state;

        ch.assert_state = state;
        ch.assert_winner = winner;
        ch.assert_winner_metric = metric;
        let upstream = ch.upstream;

        if old_state != state {
            stats::assert_transition(state);
            log_debug!(
                self.logger,
                Facility::Assert,
                &format!(
                    "{} assert {} -> {} winner {}",
                    self.describe(id),
                    old_state,
                    state,
                    winner
                )
            );
        }

        if winner_changed || metric_changed {
            self.update_join_desired(upstream);
            self.update_could_assert(id);
            self.update_assert_tracking_desired(id);
        }
    }

    /// A1: become winner with our own metric and announce it
    pub(crate) fn assert_action_a1(&mut self, id: ChannelId) {
        let Some(address) = self.channel_address(id) else {
            return;
        };
        let my = self.my_assert_metric(id);
        self.assert_winner_set(id, AssertState::Winner, address, my);
        self.assert_action_a3(id);
    }

    /// A2: become loser to `winner` and stop forwarding here
    pub(crate) fn assert_action_a2(&mut self, id: ChannelId, winner: AssertMetric) {
        self.assert_winner_set(id, AssertState::Loser, winner.address, winner);
        let assert_time = self.config.assert_time();
        self.arm_assert_timer(id, assert_time);

        if self.lost_assert(id) {
            if let Some((upstream, vif)) = self.channels.get(&id).map(|c| (c.upstream, c.vif)) {
                self.oil_del(upstream, vif, OifFlags::all());
            }
        }
    }

    /// A3: send our Assert and restart the resend timer
    pub(crate) fn assert_action_a3(&mut self, id: ChannelId) {
        let Some(ch) = self.channels.get(&id) else {
            return;
        };
        if ch.assert_state != AssertState::Winner {
            log_warning!(
                self.logger,
                Facility::Assert,
                &format!("A3 on {} while {}", self.describe(id), ch.assert_state)
            );
            return;
        }
        let (vif, sg, metric) = (ch.vif, ch.sg, ch.assert_my_metric);
        let resend = self.config.assert_resend_interval();
        self.arm_assert_timer(id, resend);
        self.emit(PimAction::SendAssert { vif, sg, metric });
    }

    /// A4: send AssertCancel, then A5
    pub(crate) fn assert_action_a4(&mut self, id: ChannelId) {
        let Some(ch) = self.channels.get(&id) else {
            return;
        };
        let (vif, sg) = (ch.vif, ch.sg);
        if let Some(address) = self.channel_address(id) {
            self.emit(PimAction::SendAssertCancel {
                vif,
                sg,
                metric: AssertMetric::cancel(address),
            });
        }
        self.assert_action_a5(id);
    }

    /// A5: forget the election; a former loser resumes forwarding
    pub(crate) fn assert_action_a5(&mut self, id: ChannelId) {
        let Some(was_loser) = self
            .channels
            .get(&id)
            .map(|c| c.assert_state == AssertState::Loser)
        else {
            return;
        };
        self.cancel_assert_timer(id);
        self.assert_winner_set(id, AssertState::NoInfo, WILDCARD, AssertMetric::INFINITE);
        if was_loser {
            self.resume_forwarding(id);
        }
    }

    /// A6: A2, and on the RPF interface of a joined entry set the SPT bit
    pub(crate) fn assert_action_a6(&mut self, id: ChannelId, winner: AssertMetric) {
        self.assert_action_a2(id, winner);

        let Some((upstream, vif)) = self.channels.get(&id).map(|c| (c.upstream, c.vif)) else {
            return;
        };
        if let Some(up) = self.upstreams.get_mut(upstream) {
            if up.rpf.interface == Some(vif) && up.join_state == UpstreamJoinState::Joined {
                up.spt_bit = true;
            }
        }
    }

    fn resume_forwarding(&mut self, id: ChannelId) {
        if self.is_in_oiflist(id) {
            self.forward_start(id);
        }
        let Some(ch) = self.channels.get(&id) else {
            return;
        };
        let (upstream, vif, parent) = (ch.upstream, ch.vif, ch.parent);
        if let Some(star) = parent {
            if self.inherit_interface(upstream, Some(id), Some(star)) {
                self.oil_add(upstream, vif, OifFlags::PROTO_STAR);
            }
        }
    }

    /// Re-evaluate CouldAssert; losing it while Winner withdraws (A4)
    pub(crate) fn update_could_assert(&mut self, id: ChannelId) {
        let Some(old) = self
            .channels
            .get(&id)
            .map(|c| c.flags.contains(ChannelFlags::COULD_ASSERT))
        else {
            return;
        };
        let new = self.could_assert(id);
        if new == old {
            return;
        }
        let Some(ch) = self.channels.get_mut(&id) else {
            return;
        };
        ch.flags.set(ChannelFlags::COULD_ASSERT, new);
        let winner = ch.assert_state == AssertState::Winner;

        if !new && winner {
            self.assert_action_a4(id);
        }
        self.update_my_assert_metric(id);
    }

    /// Re-evaluate my_assert_metric; beating the recorded winner resets (A5)
    pub(crate) fn update_my_assert_metric(&mut self, id: ChannelId) {
        let new = self.my_assert_metric(id);
        let Some(ch) = self.channels.get_mut(&id) else {
            return;
        };
        if ch.assert_my_metric == new {
            return;
        }
        ch.assert_my_metric = new;
        if new.better(&ch.assert_winner_metric) {
            self.assert_action_a5(id);
        }
    }

    /// Re-evaluate AssertTrackingDesired; losing it while Loser resets (A5)
    pub(crate) fn update_assert_tracking_desired(&mut self, id: ChannelId) {
        let Some(old) = self
            .channels
            .get(&id)
            .map(|c| c.flags.contains(ChannelFlags::ASSERT_TRACKING_DESIRED))
        else {
            return;
        };
        let new = self.assert_tracking_desired(id);
        if new == old {
            return;
        }
        let Some(ch) = self.channels.get_mut(&id) else {
            return;
        };
        ch.flags.set(ChannelFlags::ASSERT_TRACKING_DESIRED, new);
        let loser = ch.assert_state == AssertState::Loser;

        if !new && loser {
            self.assert_action_a5(id);
        }
    }

    /// Re-run every assert predicate of a channel after an input changed
    pub(crate) fn reevaluate_assert(&mut self, id: ChannelId) {
        self.update_could_assert(id);
        self.update_my_assert_metric(id);
        self.update_assert_tracking_desired(id);
    }
}
