// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Interface channels: per-(interface, S-G) downstream state.
//!
//! Channels live in the core's arena and are addressed by [`ChannelId`].
//! The per-interface index orders them by (group, source). A (*,G) channel
//! and the (S,G) channels of the same group on the same interface are
//! linked as parent and children; both directions are kept in step by
//! [`PimCore::channel_add`] and [`PimCore::channel_delete`].

use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use serde::Serialize;

use super::actions::PimAction;
use super::assert::{AssertMetric, AssertState};
use super::error::PimError;
use super::interface::VifIndex;
use super::oil::OifFlags;
use super::sg::{SourceFlags, SourceGroup, WILDCARD};
use super::stats;
use super::upstream::{UpstreamFlags, UpstreamId};
use super::PimCore;
use crate::logging::Facility;
use crate::protocols::{TimerToken, TimerType};
use crate::{log_debug, log_notice, log_warning};

/// Handle of an interface channel; never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChannelId(pub(crate) u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch#{}", self.0)
    }
}

/// Downstream join state
///
/// The two Tmp variants are only ever reported by
/// [`PimCore::effective_join_state`] while a (*,G) update session is open;
/// a channel never stores them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum JoinState {
    #[default]
    NoInfo,
    Join,
    PrunePending,
    Prune,
    PruneTmp,
    PrunePendingTmp,
}

impl JoinState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinState::NoInfo => "NOINFO",
            JoinState::Join => "JOIN",
            JoinState::PrunePending => "PRUNEP",
            JoinState::Prune => "PRUNE",
            JoinState::PruneTmp => "PRUNET",
            JoinState::PrunePendingTmp => "PRUNEPT",
        }
    }
}

impl fmt::Display for JoinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local receiver state (IGMP/MLD or VXLAN termination)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum LocalMembership {
    #[default]
    NoInfo,
    Include,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
    pub struct ChannelFlags: u8 {
        const COULD_ASSERT = 0x01;
        const ASSERT_TRACKING_DESIRED = 0x02;
        /// (S,G,rpt) exception entry
        const S_G_RPT = 0x04;
        const PROTO_PIM = 0x08;
        const PROTO_IGMP = 0x10;
    }
}

/// Timers owned by a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelTimer {
    Expiry,
    PrunePending,
    Assert,
}

#[derive(Debug, Clone)]
pub struct InterfaceChannel {
    pub id: ChannelId,
    pub vif: VifIndex,
    pub sg: SourceGroup,
    pub join_state: JoinState,
    pub local_membership: LocalMembership,
    pub assert_state: AssertState,
    pub assert_my_metric: AssertMetric,
    pub assert_winner_metric: AssertMetric,
    pub assert_winner: Ipv4Addr,
    pub flags: ChannelFlags,
    pub(crate) expiry_timer: Option<TimerToken>,
    pub(crate) prune_pending_timer: Option<TimerToken>,
    pub(crate) assert_timer: Option<TimerToken>,
    /// Covering (*,G) channel on the same interface
    pub parent: Option<ChannelId>,
    /// (S,G) channels covered by this (*,G)
    pub children: BTreeSet<ChannelId>,
    pub upstream: UpstreamId,
    /// Last transition to or from NoInfo
    pub join_creation: Instant,
    pub(crate) dual_active_counted: bool,
}

impl InterfaceChannel {
    pub fn has_expiry_timer(&self) -> bool {
        self.expiry_timer.is_some()
    }

    pub fn has_prune_pending_timer(&self) -> bool {
        self.prune_pending_timer.is_some()
    }

    pub fn has_assert_timer(&self) -> bool {
        self.assert_timer.is_some()
    }

    pub fn summary(&self, interface: &str) -> ChannelSummary {
        ChannelSummary {
            interface: interface.to_string(),
            sg: self.sg,
            join_state: self.join_state,
            local_membership: self.local_membership,
            assert_state: self.assert_state,
            assert_winner: self.assert_winner,
            flags: self.flags,
            children: self.children.len(),
        }
    }
}

/// Read-only view of a channel
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSummary {
    pub interface: String,
    pub sg: SourceGroup,
    pub join_state: JoinState,
    pub local_membership: LocalMembership,
    pub assert_state: AssertState,
    pub assert_winner: Ipv4Addr,
    pub flags: ChannelFlags,
    pub children: usize,
}

impl PimCore {
    /// Channel of `sg` on a named interface
    pub fn find(&self, interface: &str, sg: &SourceGroup) -> Option<ChannelId> {
        let vif = self.names.get(interface)?;
        self.find_on(*vif, sg)
    }

    pub(crate) fn find_on(&self, vif: VifIndex, sg: &SourceGroup) -> Option<ChannelId> {
        self.interfaces.get(&vif)?.channels.get(sg).copied()
    }

    pub fn channel(&self, id: ChannelId) -> Option<&InterfaceChannel> {
        self.channels.get(&id)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Channels of an interface in (group, source) order
    pub fn channels_on(&self, interface: &str) -> Vec<ChannelSummary> {
        let Some(iface) = self.names.get(interface).and_then(|vif| self.interfaces.get(vif)) else {
            return Vec::new();
        };
        iface
            .channels
            .values()
            .filter_map(|id| self.channels.get(id))
            .map(|ch| ch.summary(&iface.name))
            .collect()
    }

    /// Time left on one of a channel's timers
    pub fn timer_remaining(&self, id: ChannelId, timer: ChannelTimer, now: Instant) -> Option<Duration> {
        let ch = self.channels.get(&id)?;
        let token = match timer {
            ChannelTimer::Expiry => ch.expiry_timer,
            ChannelTimer::PrunePending => ch.prune_pending_timer,
            ChannelTimer::Assert => ch.assert_timer,
        }?;
        self.timers.remaining(token, now)
    }

    /// Find or create a channel, merging protocol references
    pub fn get_or_create(
        &mut self,
        interface: &str,
        sg: SourceGroup,
        source_flags: SourceFlags,
        up_flags: UpstreamFlags,
    ) -> Result<ChannelId, PimError> {
        if !sg.is_valid() {
            return Err(PimError::InvalidSourceGroup(sg.to_string()));
        }
        let vif = *self
            .names
            .get(interface)
            .ok_or_else(|| PimError::UnknownInterface(interface.to_string()))?;
        Ok(self.channel_add(vif, sg, source_flags, up_flags))
    }

    pub(crate) fn channel_add(
        &mut self,
        vif: VifIndex,
        sg: SourceGroup,
        source_flags: SourceFlags,
        up_flags: UpstreamFlags,
    ) -> ChannelId {
        if let Some(id) = self.find_on(vif, &sg) {
            if let Some(ch) = self.channels.get_mut(&id) {
                if up_flags.contains(UpstreamFlags::SRC_PIM) {
                    ch.flags.insert(ChannelFlags::PROTO_PIM);
                }
                if up_flags.contains(UpstreamFlags::SRC_IGMP) {
                    ch.flags.insert(ChannelFlags::PROTO_IGMP);
                }
                let upstream = ch.upstream;
                if let Some(up) = self.upstreams.get_mut(upstream) {
                    up.flags |= up_flags;
                }
            }
            return id;
        }

        let id = ChannelId(self.next_channel_id);
        self.next_channel_id += 1;
        let (upstream, created) = self.upstream_add(sg, up_flags);

        let mut flags = ChannelFlags::empty();
        if source_flags.is_sg_rpt() {
            flags |= ChannelFlags::S_G_RPT;
        }
        if up_flags.contains(UpstreamFlags::SRC_PIM) {
            flags |= ChannelFlags::PROTO_PIM;
        }
        if up_flags.contains(UpstreamFlags::SRC_IGMP) {
            flags |= ChannelFlags::PROTO_IGMP;
        }

        let parent = sg.parent().and_then(|star| self.find_on(vif, &star));
        let mut children = BTreeSet::new();
        if let Some(iface) = self.interfaces.get(&vif) {
            if sg.is_star_g() {
                let last = SourceGroup {
                    source: Ipv4Addr::BROADCAST,
                    group: sg.group,
                };
                children.extend(
                    iface
                        .channels
                        .range(sg..=last)
                        .filter(|(key, _)| key.is_sg())
                        .map(|(_, child)| *child),
                );
            }
        }
        for child in &children {
            if let Some(c) = self.channels.get_mut(child) {
                c.parent = Some(id);
            }
        }
        if let Some(p) = parent.and_then(|p| self.channels.get_mut(&p)) {
            p.children.insert(id);
        }

        self.channels.insert(
            id,
            InterfaceChannel {
                id,
                vif,
                sg,
                join_state: JoinState::NoInfo,
                local_membership: LocalMembership::NoInfo,
                assert_state: AssertState::NoInfo,
                assert_my_metric: AssertMetric::INFINITE,
                assert_winner_metric: AssertMetric::INFINITE,
                assert_winner: WILDCARD,
                flags,
                expiry_timer: None,
                prune_pending_timer: None,
                assert_timer: None,
                parent,
                children,
                upstream,
                join_creation: self.now,
                dual_active_counted: false,
            },
        );
        let mut dual_active = false;
        if let Some(iface) = self.interfaces.get_mut(&vif) {
            iface.channels.insert(sg, id);
            dual_active = iface.dual_active;
        }
        if let Some(up) = self.upstreams.get_mut(upstream) {
            up.ifchannels.insert(id);
        }

        let could_assert = self.could_assert(id);
        let tracking = self.assert_tracking_desired(id);
        if let Some(ch) = self.channels.get_mut(&id) {
            ch.flags.set(ChannelFlags::COULD_ASSERT, could_assert);
            ch.flags.set(ChannelFlags::ASSERT_TRACKING_DESIRED, tracking);
        }
        let my_metric = self.my_assert_metric(id);
        if let Some(ch) = self.channels.get_mut(&id) {
            ch.assert_my_metric = my_metric;
            ch.assert_winner_metric = my_metric;
        }

        if dual_active {
            self.dual_active_add(id);
        }

        stats::channel_created();
        log_debug!(
            self.logger,
            Facility::IfChannel,
            &format!("{} created {} flags {:?}", self.describe(id), id, flags)
        );

        if created {
            self.upstream_created(upstream);
        }
        id
    }

    fn dual_active_add(&mut self, id: ChannelId) {
        let Some(ch) = self.channels.get_mut(&id) else {
            return;
        };
        ch.dual_active_counted = true;
        let upstream = ch.upstream;
        let Some(up) = self.upstreams.get_mut(upstream) else {
            return;
        };
        up.dualactive_ifchannel_count += 1;
        up.flags.insert(UpstreamFlags::MLAG_INTERFACE);
        if up.dualactive_ifchannel_count == 1 {
            let sg = up.sg;
            self.emit(PimAction::MlagLocalAdd { sg });
        }
    }

    fn dual_active_del(&mut self, upstream: UpstreamId) {
        let Some(up) = self.upstreams.get_mut(upstream) else {
            return;
        };
        let last = up.dualactive_ifchannel_count == 1;
        up.dualactive_ifchannel_count = up.dualactive_ifchannel_count.saturating_sub(1);
        if last {
            up.flags.remove(UpstreamFlags::MLAG_INTERFACE);
            let sg = up.sg;
            self.emit(PimAction::MlagLocalDel { sg });
        }
    }

    /// Remove a channel and its OIL contribution, releasing its upstream
    pub(crate) fn channel_delete(&mut self, id: ChannelId) {
        let Some(ch) = self.channels.get(&id) else {
            return;
        };
        let (vif, sg, upstream, parent, counted) =
            (ch.vif, ch.sg, ch.upstream, ch.parent, ch.dual_active_counted);
        let children: Vec<ChannelId> = ch.children.iter().copied().collect();
        let timers = [ch.expiry_timer, ch.prune_pending_timer, ch.assert_timer];

        for token in timers.into_iter().flatten() {
            self.timers.cancel(token);
        }
        if counted {
            self.dual_active_del(upstream);
        }

        // Without this channel's exception the (*,G) state applies again
        if sg.is_sg() && parent.is_some() && self.join_desired_interface(upstream, None, parent) {
            self.oil_add(upstream, vif, OifFlags::PROTO_STAR);
        }

        let up_flags = self
            .upstreams
            .get(upstream)
            .map(|up| up.flags)
            .unwrap_or_default();
        let mut mask = OifFlags::PROTO_PIM;
        if up_flags.contains(UpstreamFlags::SRC_IGMP) {
            mask |= OifFlags::PROTO_IGMP;
        }
        if up_flags.contains(UpstreamFlags::SRC_VXLAN_TERM) {
            mask |= OifFlags::PROTO_VXLAN;
        }
        self.oil_del(upstream, vif, mask);

        if sg.source_is_wildcard() {
            let sources: Vec<UpstreamId> = self
                .upstreams
                .get(upstream)
                .map(|up| up.sources.iter().copied().collect())
                .unwrap_or_default();
            for child in sources {
                self.oil_del_inherited(child, vif);
            }
        }

        for child in children {
            if let Some(c) = self.channels.get_mut(&child) {
                c.parent = None;
            }
        }
        if let Some(p) = parent.and_then(|p| self.channels.get_mut(&p)) {
            p.children.remove(&id);
        }
        if let Some(up) = self.upstreams.get_mut(upstream) {
            up.ifchannels.remove(&id);
        }
        if let Some(iface) = self.interfaces.get_mut(&vif) {
            iface.channels.remove(&sg);
        }
        if let Some(session) = self.batch.as_mut() {
            session.pending.remove(&id);
        }

        let name = self
            .interfaces
            .get(&vif)
            .map(|i| i.name.clone())
            .unwrap_or_default();
        self.channels.remove(&id);
        stats::channel_deleted();
        log_debug!(
            self.logger,
            Facility::IfChannel,
            &format!("{} {} deleted {}", name, sg, id)
        );

        self.update_join_desired(upstream);
        self.upstream_release(upstream);
    }

    /// Delete the channel once nothing keeps it alive; true if deleted
    pub(crate) fn delete_on_noinfo(&mut self, id: ChannelId) -> bool {
        let idle = self.channels.get(&id).is_some_and(|ch| {
            ch.join_state == JoinState::NoInfo
                && ch.local_membership == LocalMembership::NoInfo
                && ch.expiry_timer.is_none()
        });
        if idle {
            self.channel_delete(id);
        }
        idle
    }

    pub(crate) fn delete_on_noinfo_all(&mut self, vif: VifIndex) {
        let ids = self
            .interfaces
            .get(&vif)
            .map(|i| i.channel_ids())
            .unwrap_or_default();
        for id in ids {
            self.delete_on_noinfo(id);
        }
    }

    /// Delete every channel of an interface in (group, source) order
    pub(crate) fn delete_all(&mut self, vif: VifIndex) {
        loop {
            let Some(id) = self
                .interfaces
                .get(&vif)
                .and_then(|i| i.channels.values().next().copied())
            else {
                break;
            };
            self.ifjoin_switch(id, JoinState::NoInfo);
            self.channel_delete(id);
        }
    }

    /// Drop local membership on every channel of an interface
    pub fn membership_clear(&mut self, interface: &str, now: Instant) -> bool {
        self.now = now;
        let Some(vif) = self.names.get(interface).copied() else {
            return false;
        };
        let included: Vec<ChannelId> = self
            .interfaces
            .get(&vif)
            .map(|i| i.channel_ids())
            .unwrap_or_default()
            .into_iter()
            .filter(|id| {
                self.channels
                    .get(id)
                    .is_some_and(|c| c.local_membership == LocalMembership::Include)
            })
            .collect();
        for id in included {
            self.membership_remove(id);
        }
        self.delete_on_noinfo_all(vif);
        true
    }

    pub(crate) fn ifmembership_set(&mut self, id: ChannelId, membership: LocalMembership) {
        let Some(ch) = self.channels.get_mut(&id) else {
            return;
        };
        if ch.local_membership == membership {
            return;
        }
        ch.local_membership = membership;
        let upstream = ch.upstream;
        self.update_join_desired(upstream);
        self.update_could_assert(id);
        self.update_assert_tracking_desired(id);
    }

    /// Change the stored join state, fanning a (*,G) change out to its sources
    pub(crate) fn ifjoin_switch(&mut self, id: ChannelId, new_state: JoinState) {
        debug_assert!(
            !matches!(new_state, JoinState::PruneTmp | JoinState::PrunePendingTmp),
            "transient join states are never stored"
        );
        let now = self.now;
        let Some(ch) = self.channels.get_mut(&id) else {
            return;
        };
        let old_state = ch.join_state;
        if old_state == new_state {
            return;
        }
        ch.join_state = new_state;
        let (sg, vif, upstream) = (ch.sg, ch.vif, ch.upstream);

        stats::join_transition(new_state);
        log_debug!(
            self.logger,
            Facility::IfChannel,
            &format!("{} join {} -> {}", self.describe(id), old_state, new_state)
        );

        if sg.source_is_wildcard() {
            let sources: Vec<UpstreamId> = self
                .upstreams
                .get(upstream)
                .map(|up| up.sources.iter().copied().collect())
                .unwrap_or_default();
            if matches!(new_state, JoinState::NoInfo | JoinState::Join) {
                for child in sources {
                    self.star_inherit(child, vif, id);
                }
            }
        }

        if old_state == JoinState::NoInfo || new_state == JoinState::NoInfo {
            if let Some(ch) = self.channels.get_mut(&id) {
                ch.join_creation = now;
            }
            self.update_join_desired(upstream);
            self.update_could_assert(id);
            self.update_assert_tracking_desired(id);
        }
    }

    /// Start forwarding the entry out of the channel's interface
    pub(crate) fn forward_start(&mut self, id: ChannelId) {
        let Some(upstream) = self.channels.get(&id).map(|c| c.upstream) else {
            return;
        };
        let vif = self.channels.get(&id).map(|c| c.vif).unwrap_or_default();
        let mut flags = OifFlags::empty();
        if self.joins(id) {
            flags |= OifFlags::PROTO_PIM;
        }
        if self.pim_include(id) {
            flags |= self.local_oif_flag(id);
        }
        if flags.is_empty() {
            flags = OifFlags::PROTO_PIM;
        }
        self.oil_add(upstream, vif, flags);
    }

    /// Stop PIM forwarding out of the channel's interface
    pub(crate) fn forward_stop(&mut self, id: ChannelId) {
        if let Some((upstream, vif)) = self.channels.get(&id).map(|c| (c.upstream, c.vif)) {
            self.oil_del(upstream, vif, OifFlags::PROTO_PIM);
        }
    }

    /// Common landing for join expiry and prune completion
    pub(crate) fn ifjoin_to_noinfo(&mut self, id: ChannelId) {
        self.ifjoin_switch(id, JoinState::NoInfo);
        self.forward_stop(id);
        if let Some(ch) = self.channels.get_mut(&id) {
            ch.flags.remove(ChannelFlags::PROTO_PIM);
            let upstream = ch.upstream;
            if let Some(up) = self.upstreams.get_mut(upstream) {
                up.flags.remove(UpstreamFlags::SRC_PIM);
            }
        }
        self.delete_on_noinfo(id);
    }

    /// Join expiry timer (ET)
    pub(crate) fn on_join_expiry(&mut self, id: ChannelId) {
        log_debug!(
            self.logger,
            Facility::IfChannel,
            &format!("{} join expired", self.describe(id))
        );
        self.ifjoin_to_noinfo(id);
    }

    pub(crate) fn arm_channel_timer(&mut self, id: ChannelId, timer: ChannelTimer, delay: Duration) {
        self.cancel_channel_timer(id, timer);
        let timer_type = match timer {
            ChannelTimer::Expiry => TimerType::IfJoinExpiry(id),
            ChannelTimer::PrunePending => TimerType::PrunePending(id),
            ChannelTimer::Assert => TimerType::Assert(id),
        };
        let now = self.now;
        let Some(ch) = self.channels.get_mut(&id) else {
            return;
        };
        let token = self.timers.schedule(timer_type, delay, now);
        match timer {
            ChannelTimer::Expiry => ch.expiry_timer = Some(token),
            ChannelTimer::PrunePending => ch.prune_pending_timer = Some(token),
            ChannelTimer::Assert => ch.assert_timer = Some(token),
        }
    }

    pub(crate) fn cancel_channel_timer(&mut self, id: ChannelId, timer: ChannelTimer) {
        let Some(ch) = self.channels.get_mut(&id) else {
            return;
        };
        let slot = match timer {
            ChannelTimer::Expiry => &mut ch.expiry_timer,
            ChannelTimer::PrunePending => &mut ch.prune_pending_timer,
            ChannelTimer::Assert => &mut ch.assert_timer,
        };
        if let Some(token) = slot.take() {
            self.timers.cancel(token);
        }
    }

    pub(crate) fn arm_assert_timer(&mut self, id: ChannelId, delay: Duration) {
        self.arm_channel_timer(id, ChannelTimer::Assert, delay);
    }

    pub(crate) fn cancel_assert_timer(&mut self, id: ChannelId) {
        self.cancel_channel_timer(id, ChannelTimer::Assert);
    }

    /// Time left on the join expiry timer at the current event
    pub(crate) fn expiry_remaining(&self, id: ChannelId) -> Option<Duration> {
        let token = self.channels.get(&id)?.expiry_timer?;
        self.timers.remaining(token, self.now)
    }

    /// Join channels elsewhere whose RPF now points out of `vif` start forwarding
    pub(crate) fn scan_forward_start(&mut self, vif: VifIndex) {
        let candidates: Vec<ChannelId> = self
            .channels
            .values()
            .filter(|ch| ch.vif != vif && ch.join_state == JoinState::Join)
            .filter(|ch| {
                self.upstreams
                    .get(ch.upstream)
                    .is_some_and(|up| up.channel_oil.is_none() && up.rpf.interface == Some(vif))
            })
            .map(|ch| ch.id)
            .collect();
        for id in candidates {
            self.forward_start(id);
        }
    }

    pub fn new_interface_joined(&mut self, interface: &str, now: Instant) -> bool {
        self.now = now;
        let Some(vif) = self.names.get(interface).copied() else {
            log_warning!(
                self.logger,
                Facility::Interface,
                &format!("unknown interface {}", interface)
            );
            return false;
        };
        self.scan_forward_start(vif);
        true
    }

    /// Operational state change; going down deletes every channel
    pub fn interface_state_change(&mut self, interface: &str, up: bool, now: Instant) -> bool {
        self.now = now;
        let Some(vif) = self.names.get(interface).copied() else {
            log_warning!(
                self.logger,
                Facility::Interface,
                &format!("state change for unknown interface {}", interface)
            );
            return false;
        };
        if self.interfaces.get(&vif).map(|i| i.up) == Some(up) {
            return false;
        }

        if up {
            if let Some(iface) = self.interfaces.get_mut(&vif) {
                iface.up = true;
                iface.elect_dr();
            }
        } else {
            self.delete_all(vif);
            let mut expired = Vec::new();
            if let Some(iface) = self.interfaces.get_mut(&vif) {
                expired.extend(iface.neighbors.drain().filter_map(|(_, n)| n.expiry_timer));
                iface.up = false;
                iface.elect_dr();
            }
            for token in expired {
                self.timers.cancel(token);
            }
        }

        log_notice!(
            self.logger,
            Facility::Interface,
            &format!("{} is {}", interface, if up { "up" } else { "down" })
        );
        true
    }

    /// "eth0 (S,G)" for log lines
    pub(crate) fn describe(&self, id: ChannelId) -> String {
        match self.channels.get(&id) {
            Some(ch) => {
                let name = self
                    .interfaces
                    .get(&ch.vif)
                    .map(|i| i.name.as_str())
                    .unwrap_or("?");
                format!("{} {}", name, ch.sg)
            }
            None => id.to_string(),
        }
    }

    /// Our address on the channel's interface
    pub(crate) fn channel_address(&self, id: ChannelId) -> Option<Ipv4Addr> {
        let ch = self.channels.get(&id)?;
        self.interfaces.get(&ch.vif).map(|i| i.primary_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoreConfig, InterfaceConfig};
    use crate::logging::Logger;

    fn core() -> PimCore {
        let mut config = CoreConfig::default();
        for (name, vif, addr) in [("eth0", 1, "10.0.0.1"), ("eth1", 2, "10.0.1.1")] {
            config.interfaces.push(InterfaceConfig {
                name: name.to_string(),
                vif_index: vif,
                address: addr.parse().unwrap(),
                pim_enabled: true,
                dr_priority: 1,
                dual_active: name == "eth1",
            });
        }
        PimCore::new(config, Logger::disabled(), Instant::now())
    }

    fn sg(s: &str, g: &str) -> SourceGroup {
        SourceGroup::new(s.parse().unwrap(), g.parse().unwrap()).unwrap()
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let mut core = core();
        let key = sg("10.1.1.1", "239.1.1.1");
        let a = core
            .get_or_create("eth0", key, SourceFlags::empty(), UpstreamFlags::SRC_PIM)
            .unwrap();
        let b = core
            .get_or_create("eth0", key, SourceFlags::empty(), UpstreamFlags::SRC_IGMP)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(core.channel_count(), 1);

        let ch = core.channel(a).unwrap();
        assert!(ch.flags.contains(ChannelFlags::PROTO_PIM | ChannelFlags::PROTO_IGMP));
        let up = core.upstream(&key).unwrap();
        assert!(up.flags.contains(UpstreamFlags::SRC_PIM | UpstreamFlags::SRC_IGMP));
        assert_eq!(up.ref_count, 1);
    }

    #[test]
    fn test_get_or_create_rejects_bad_input() {
        let mut core = core();
        let bad = SourceGroup {
            source: "10.1.1.1".parse().unwrap(),
            group: WILDCARD,
        };
        assert!(matches!(
            core.get_or_create("eth0", bad, SourceFlags::empty(), UpstreamFlags::empty()),
            Err(PimError::InvalidSourceGroup(_))
        ));
        assert!(matches!(
            core.get_or_create("eth9", sg("10.1.1.1", "239.1.1.1"), SourceFlags::empty(), UpstreamFlags::empty()),
            Err(PimError::UnknownInterface(_))
        ));
    }

    #[test]
    fn test_parent_links_in_either_order() {
        let mut core = core();
        let group = "239.1.1.1".parse().unwrap();
        let early = core
            .get_or_create("eth0", sg("10.1.1.1", "239.1.1.1"), SourceFlags::empty(), UpstreamFlags::empty())
            .unwrap();
        let star = core
            .get_or_create("eth0", SourceGroup::star_g(group), SourceFlags::empty(), UpstreamFlags::empty())
            .unwrap();
        let late = core
            .get_or_create("eth0", sg("10.1.1.2", "239.1.1.1"), SourceFlags::RPT, UpstreamFlags::empty())
            .unwrap();
        let elsewhere = core
            .get_or_create("eth1", sg("10.1.1.3", "239.1.1.1"), SourceFlags::empty(), UpstreamFlags::empty())
            .unwrap();

        assert_eq!(core.channel(early).unwrap().parent, Some(star));
        assert_eq!(core.channel(late).unwrap().parent, Some(star));
        assert_eq!(core.channel(elsewhere).unwrap().parent, None);
        let children: Vec<ChannelId> = core.channel(star).unwrap().children.iter().copied().collect();
        assert_eq!(children, vec![early, late]);
        assert!(core.channel(late).unwrap().flags.contains(ChannelFlags::S_G_RPT));
    }

    #[test]
    fn test_delete_star_orphans_children() {
        let mut core = core();
        let group = "239.1.1.1".parse().unwrap();
        let star = core
            .get_or_create("eth0", SourceGroup::star_g(group), SourceFlags::empty(), UpstreamFlags::empty())
            .unwrap();
        let child = core
            .get_or_create("eth0", sg("10.1.1.1", "239.1.1.1"), SourceFlags::RPT, UpstreamFlags::empty())
            .unwrap();

        core.channel_delete(star);
        assert!(core.channel(star).is_none());
        assert_eq!(core.channel(child).unwrap().parent, None);
        assert!(core.upstream(&SourceGroup::star_g(group)).is_none());
    }

    #[test]
    fn test_delete_on_noinfo_only_when_idle() {
        let mut core = core();
        let key = sg("10.1.1.1", "239.1.1.1");
        let id = core
            .get_or_create("eth0", key, SourceFlags::empty(), UpstreamFlags::empty())
            .unwrap();
        core.arm_channel_timer(id, ChannelTimer::Expiry, Duration::from_secs(10));
        assert!(!core.delete_on_noinfo(id));

        core.cancel_channel_timer(id, ChannelTimer::Expiry);
        assert!(core.delete_on_noinfo(id));
        assert!(core.find("eth0", &key).is_none());
        assert!(core.upstream(&key).is_none());
        assert!(core.timers.is_empty());
    }

    #[test]
    fn test_delete_all_is_ordered() {
        let (logger, log) = Logger::memory(64);
        let mut core = core();
        core.logger = logger;
        for key in [
            sg("10.1.1.2", "239.1.1.1"),
            sg("10.1.1.9", "225.1.1.1"),
            sg("10.1.1.1", "239.1.1.1"),
        ] {
            core.get_or_create("eth0", key, SourceFlags::empty(), UpstreamFlags::empty())
                .unwrap();
        }
        core.delete_all(1);
        assert_eq!(core.channel_count(), 0);

        let deleted: Vec<String> = log
            .snapshot()
            .iter()
            .map(|e| e.get_message().to_string())
            .filter(|m| m.contains(" deleted "))
            .collect();
        assert_eq!(deleted.len(), 3);
        assert!(deleted[0].contains("(10.1.1.9,225.1.1.1)"));
        assert!(deleted[1].contains("(10.1.1.1,239.1.1.1)"));
        assert!(deleted[2].contains("(10.1.1.2,239.1.1.1)"));
    }

    #[test]
    fn test_dual_active_bookkeeping() {
        let mut core = core();
        let key = sg("10.1.1.1", "239.1.1.1");
        let id = core
            .get_or_create("eth1", key, SourceFlags::empty(), UpstreamFlags::empty())
            .unwrap();
        assert_eq!(core.upstream(&key).unwrap().dualactive_ifchannel_count, 1);
        assert_eq!(core.take_actions(), vec![PimAction::MlagLocalAdd { sg: key }]);

        core.channel_delete(id);
        assert_eq!(core.take_actions(), vec![PimAction::MlagLocalDel { sg: key }]);
    }

    #[test]
    fn test_ids_never_reused() {
        let mut core = core();
        let key = sg("10.1.1.1", "239.1.1.1");
        let a = core
            .get_or_create("eth0", key, SourceFlags::empty(), UpstreamFlags::empty())
            .unwrap();
        core.channel_delete(a);
        let b = core
            .get_or_create("eth0", key, SourceFlags::empty(), UpstreamFlags::empty())
            .unwrap();
        assert_ne!(a, b);
    }
}
