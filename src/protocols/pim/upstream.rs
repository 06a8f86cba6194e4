// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Upstream entries: per-(S,G) state shared by every interface.
//!
//! An upstream is referenced by each interface channel of its (S,G) and by
//! external holds. (S,G) entries are linked under the (*,G) entry of their
//! group in both directions; links are ids, so a freed parent simply stops
//! resolving.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Instant;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::actions::PimAction;
use super::ifchannel::{ChannelFlags, ChannelId, LocalMembership};
use super::interface::VifIndex;
use super::oil::{ChannelOil, OifFlags};
use super::sg::SourceGroup;
use super::stats;
use super::PimCore;
use crate::logging::Facility;
use crate::protocols::{TimerToken, TimerType};
use crate::{log_debug, log_info, log_warning};

/// Handle of an upstream entry; never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct UpstreamId(pub(crate) u64);

impl fmt::Display for UpstreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "up#{}", self.0)
    }
}

bitflags! {
    /// Upstream flags; the SRC_* bits record who referenced the entry
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct UpstreamFlags: u32 {
        const DR_JOIN_DESIRED = 1 << 0;
        const SRC_IGMP = 1 << 1;
        const SRC_PIM = 1 << 2;
        const SRC_STREAM = 1 << 3;
        const SRC_LHR = 1 << 4;
        const SRC_VXLAN_TERM = 1 << 5;
        const SRC_HOLD = 1 << 6;
        const MLAG_INTERFACE = 1 << 7;
        /// Local receivers make the router a last-hop candidate
        const CAN_BE_LHR = Self::SRC_IGMP.bits() | Self::SRC_VXLAN_TERM.bits();
    }
}

/// Upstream join state toward RPF'(S,G)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum UpstreamJoinState {
    #[default]
    NotJoined,
    Joined,
}

impl fmt::Display for UpstreamJoinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamJoinState::NotJoined => f.write_str("NOTJOINED"),
            UpstreamJoinState::Joined => f.write_str("JOINED"),
        }
    }
}

/// RPF information supplied by route lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rpf {
    /// Interface toward the source (or RP); None while unresolved
    pub interface: Option<VifIndex>,
    /// RPF'(S,G) neighbor
    pub neighbor: Ipv4Addr,
    pub metric_preference: u32,
    pub route_metric: u32,
}

impl Default for Rpf {
    fn default() -> Self {
        Self {
            interface: None,
            neighbor: Ipv4Addr::UNSPECIFIED,
            metric_preference: u32::MAX,
            route_metric: u32::MAX,
        }
    }
}

impl Rpf {
    pub fn is_known(&self) -> bool {
        self.interface.is_some()
    }
}

/// Per-(S,G) state shared across interfaces
#[derive(Debug)]
pub struct Upstream {
    pub id: UpstreamId,
    pub sg: SourceGroup,
    pub flags: UpstreamFlags,
    pub ref_count: u32,
    /// External holds; each also counts in `ref_count`
    pub hold_count: u32,
    pub rpf: Rpf,
    pub join_state: UpstreamJoinState,
    pub spt_bit: bool,
    pub ifchannels: BTreeSet<ChannelId>,
    /// The (*,G) entry of an (S,G)
    pub parent: Option<UpstreamId>,
    /// (S,G) entries under a (*,G)
    pub sources: BTreeSet<UpstreamId>,
    pub channel_oil: Option<ChannelOil>,
    pub(crate) keepalive_timer: Option<TimerToken>,
    pub dualactive_ifchannel_count: u32,
}

impl Upstream {
    pub fn summary(&self) -> UpstreamSummary {
        UpstreamSummary {
            sg: self.sg,
            flags: self.flags,
            ref_count: self.ref_count,
            join_state: self.join_state,
            rpf: self.rpf,
            channels: self.ifchannels.len(),
            oifs: self
                .channel_oil
                .as_ref()
                .map(|oil| oil.oifs().collect())
                .unwrap_or_default(),
        }
    }
}

/// Read-only view of an upstream entry
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamSummary {
    pub sg: SourceGroup,
    pub flags: UpstreamFlags,
    pub ref_count: u32,
    pub join_state: UpstreamJoinState,
    pub rpf: Rpf,
    pub channels: usize,
    pub oifs: Vec<(VifIndex, OifFlags)>,
}

/// Upstream entries keyed by id and by (S,G)
#[derive(Debug, Default)]
pub struct UpstreamRegistry {
    next_id: u64,
    entries: BTreeMap<UpstreamId, Upstream>,
    by_sg: BTreeMap<SourceGroup, UpstreamId>,
}

impl UpstreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, sg: &SourceGroup) -> Option<UpstreamId> {
        self.by_sg.get(sg).copied()
    }

    pub fn get(&self, id: UpstreamId) -> Option<&Upstream> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: UpstreamId) -> Option<&mut Upstream> {
        self.entries.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Upstream> {
        self.entries.values()
    }

    /// Insert a new entry with one reference and link it into the (*,G) tree
    fn insert(&mut self, sg: SourceGroup, flags: UpstreamFlags, rpf: Rpf) -> UpstreamId {
        let id = UpstreamId(self.next_id);
        self.next_id += 1;

        let mut up = Upstream {
            id,
            sg,
            flags,
            ref_count: 1,
            hold_count: 0,
            rpf,
            join_state: UpstreamJoinState::NotJoined,
            spt_bit: false,
            ifchannels: BTreeSet::new(),
            parent: None,
            sources: BTreeSet::new(),
            channel_oil: rpf.interface.map(|iif| ChannelOil::new(sg, Some(iif))),
            keepalive_timer: None,
            dualactive_ifchannel_count: 0,
        };

        if let Some(parent_sg) = sg.parent() {
            if let Some(parent) = self.by_sg.get(&parent_sg).copied() {
                up.parent = Some(parent);
                if let Some(p) = self.entries.get_mut(&parent) {
                    p.sources.insert(id);
                }
            }
        } else if sg.is_star_g() {
            let last = SourceGroup {
                source: Ipv4Addr::BROADCAST,
                group: sg.group,
            };
            let children: Vec<UpstreamId> = self
                .by_sg
                .range(sg..=last)
                .filter(|(key, _)| key.is_sg())
                .map(|(_, child)| *child)
                .collect();
            for child in children {
                if let Some(c) = self.entries.get_mut(&child) {
                    c.parent = Some(id);
                    up.sources.insert(child);
                }
            }
        }

        self.entries.insert(id, up);
        self.by_sg.insert(sg, id);
        id
    }

    /// Unlink and drop an entry
    fn remove(&mut self, id: UpstreamId) -> Option<Upstream> {
        let up = self.entries.remove(&id)?;
        self.by_sg.remove(&up.sg);
        if let Some(parent) = up.parent.and_then(|p| self.entries.get_mut(&p)) {
            parent.sources.remove(&id);
        }
        for child in &up.sources {
            if let Some(c) = self.entries.get_mut(child) {
                c.parent = None;
            }
        }
        Some(up)
    }
}

impl PimCore {
    /// Find or create the upstream of `sg`, taking one reference
    ///
    /// A newly created (S,G) still needs [`PimCore::upstream_created`] once
    /// the caller has linked its own state.
    pub(crate) fn upstream_add(&mut self, sg: SourceGroup, flags: UpstreamFlags) -> (UpstreamId, bool) {
        if let Some(id) = self.upstreams.find(&sg) {
            self.upstream_ref(id, flags);
            return (id, false);
        }
        let rpf = self.rpf_table.get(&sg).copied().unwrap_or_default();
        let id = self.upstreams.insert(sg, flags, rpf);
        stats::upstream_created();
        log_info!(
            self.logger,
            Facility::Upstream,
            &format!("{} created upstream {} flags {:?}", id, sg, flags)
        );
        (id, true)
    }

    /// A new (S,G) with a (*,G) parent and known RPF inherits its OIFs now
    pub(crate) fn upstream_created(&mut self, id: UpstreamId) {
        let Some(up) = self.upstreams.get(id) else {
            return;
        };
        if up.sg.is_sg() && up.parent.is_some() && up.rpf.is_known() {
            self.inherited_olist(id);
        }
    }

    pub(crate) fn upstream_ref(&mut self, id: UpstreamId, flags: UpstreamFlags) {
        if let Some(up) = self.upstreams.get_mut(id) {
            up.flags |= flags;
            up.ref_count += 1;
        }
    }

    /// Drop one reference; returns false once the entry is gone
    pub(crate) fn upstream_release(&mut self, id: UpstreamId) -> bool {
        let Some(up) = self.upstreams.get_mut(id) else {
            return false;
        };
        debug_assert!(up.ref_count > 0, "upstream {} released below zero", up.sg);
        up.ref_count = up.ref_count.saturating_sub(1);
        if up.ref_count > 0 {
            return true;
        }
        debug_assert!(up.ifchannels.is_empty(), "upstream {} freed while referenced", up.sg);

        if let Some(token) = up.keepalive_timer.take() {
            self.timers.cancel(token);
        }
        let sg = up.sg;
        let joined = up.join_state == UpstreamJoinState::Joined;
        let installed = up.channel_oil.as_ref().is_some_and(|oil| oil.installed);

        if joined {
            self.send_upstream_join_prune(id, false);
        }
        if installed {
            self.emit(PimAction::MrouteRemove { sg });
        }
        self.upstreams.remove(id);
        stats::upstream_deleted();
        log_info!(
            self.logger,
            Facility::Upstream,
            &format!("{} deleted upstream {}", id, sg)
        );
        false
    }

    /// Hold an upstream on behalf of a caller outside the channel table
    pub fn hold_upstream(&mut self, sg: SourceGroup, now: Instant) -> UpstreamId {
        self.now = now;
        let (id, created) = self.upstream_add(sg, UpstreamFlags::SRC_HOLD);
        if let Some(up) = self.upstreams.get_mut(id) {
            up.hold_count += 1;
        }
        if created {
            self.upstream_created(id);
        }
        id
    }

    /// Release a hold taken with [`PimCore::hold_upstream`]
    pub fn release_upstream(&mut self, sg: SourceGroup, now: Instant) -> bool {
        self.now = now;
        let Some(id) = self.upstreams.find(&sg) else {
            return false;
        };
        let Some(up) = self.upstreams.get_mut(id) else {
            return false;
        };
        if up.hold_count == 0 {
            log_warning!(
                self.logger,
                Facility::Upstream,
                &format!("release of unheld upstream {}", sg)
            );
            return false;
        }
        up.hold_count -= 1;
        if up.hold_count == 0 {
            up.flags.remove(UpstreamFlags::SRC_HOLD);
        }
        self.upstream_release(id);
        true
    }

    /// Install RPF information for `sg`, now or for when its upstream appears
    pub fn set_rpf(&mut self, sg: SourceGroup, rpf: Rpf, now: Instant) -> bool {
        self.now = now;
        if let Some(vif) = rpf.interface {
            if !self.interfaces.contains_key(&vif) {
                log_warning!(
                    self.logger,
                    Facility::Upstream,
                    &format!("RPF for {} names unknown vif {}", sg, vif)
                );
                return false;
            }
        }
        self.rpf_table.insert(sg, rpf);
        if let Some(id) = self.upstreams.find(&sg) {
            self.apply_rpf(id, rpf);
        }
        true
    }

    fn apply_rpf(&mut self, id: UpstreamId, rpf: Rpf) {
        let Some(up) = self.upstreams.get_mut(id) else {
            return;
        };
        let old = std::mem::replace(&mut up.rpf, rpf);
        let sg = up.sg;
        let joined = up.join_state == UpstreamJoinState::Joined;

        let mut dropped = None;
        let mut reinstall = None;
        if up.channel_oil.is_none() {
            if let Some(iif) = rpf.interface {
                up.channel_oil = Some(ChannelOil::new(sg, Some(iif)));
            }
        } else if let Some(oil) = up.channel_oil.as_mut() {
            if oil.iif != rpf.interface {
                dropped = oil.set_iif(rpf.interface).zip(rpf.interface);
                if oil.installed {
                    reinstall = rpf.interface;
                }
            }
        }
        let channels: Vec<ChannelId> = up.ifchannels.iter().copied().collect();

        if let Some((flags, vif)) = dropped {
            stats::oif_removed();
            self.emit(PimAction::DelOif {
                sg,
                vif,
                flags,
                removed: true,
            });
        }
        if let Some(iif) = reinstall {
            self.emit(PimAction::MrouteInstall { sg, iif });
        }

        // RPF'(S,G) changed while joined: prune the old path, join the new
        if joined && old.neighbor != rpf.neighbor {
            if let Some(vif) = old.interface {
                self.emit(PimAction::SendJoinPrune {
                    vif,
                    neighbor: old.neighbor,
                    sg,
                    is_join: false,
                });
            }
            self.send_upstream_join_prune(id, true);
        }

        log_debug!(
            self.logger,
            Facility::Upstream,
            &format!(
                "{} RPF {:?}/{} -> {:?}/{}",
                sg, old.interface, old.neighbor, rpf.interface, rpf.neighbor
            )
        );

        for ch in channels {
            self.reevaluate_assert(ch);
        }
        self.inherited_olist(id);
    }

    /// Set or clear the SPT bit of `sg`
    pub fn set_spt_bit(&mut self, sg: SourceGroup, spt: bool, now: Instant) -> bool {
        self.now = now;
        let Some(id) = self.upstreams.find(&sg) else {
            return false;
        };
        let Some(up) = self.upstreams.get_mut(id) else {
            return false;
        };
        up.spt_bit = spt;
        let channels: Vec<ChannelId> = up.ifchannels.iter().copied().collect();
        for ch in channels {
            self.reevaluate_assert(ch);
        }
        true
    }

    /// JoinDesired(S,G): some interface wants traffic for this entry
    pub(crate) fn evaluate_join_desired(&self, id: UpstreamId) -> bool {
        let Some(up) = self.upstreams.get(id) else {
            return false;
        };
        let parent_sg = up.parent.and_then(|p| self.upstreams.get(p)).map(|p| p.sg);

        self.interfaces.values().any(|iface| {
            let ch = iface.channels.get(&up.sg).copied();
            let star = parent_sg.and_then(|psg| iface.channels.get(&psg).copied());
            (ch.is_some() || star.is_some()) && self.join_desired_interface(id, ch, star)
        })
    }

    /// Recompute JoinDesired and switch the upstream join state on a change
    pub(crate) fn update_join_desired(&mut self, id: UpstreamId) {
        let Some(was) = self
            .upstreams
            .get(id)
            .map(|up| up.flags.contains(UpstreamFlags::DR_JOIN_DESIRED))
        else {
            return;
        };
        let is = self.evaluate_join_desired(id);
        let Some(up) = self.upstreams.get_mut(id) else {
            return;
        };
        up.flags.set(UpstreamFlags::DR_JOIN_DESIRED, is);

        if is && up.join_state == UpstreamJoinState::NotJoined {
            self.upstream_switch(id, UpstreamJoinState::Joined);
        } else if !is && was {
            self.upstream_switch(id, UpstreamJoinState::NotJoined);
        }
    }

    fn upstream_switch(&mut self, id: UpstreamId, new_state: UpstreamJoinState) {
        let Some(up) = self.upstreams.get_mut(id) else {
            return;
        };
        let old_state = std::mem::replace(&mut up.join_state, new_state);
        let sg = up.sg;
        let channels: Vec<ChannelId> = up.ifchannels.iter().copied().collect();

        log_debug!(
            self.logger,
            Facility::Upstream,
            &format!("{} upstream {} -> {}", sg, old_state, new_state)
        );

        for ch in channels {
            self.update_assert_tracking_desired(ch);
        }

        match new_state {
            UpstreamJoinState::Joined => {
                self.inherited_olist_decide(id);
                if old_state != UpstreamJoinState::Joined {
                    self.emit(PimAction::UpstreamJoinDesired { sg, joined: true });
                    self.send_upstream_join_prune(id, true);
                }
            }
            UpstreamJoinState::NotJoined => {
                self.forward_off(id);
                if old_state == UpstreamJoinState::Joined {
                    self.emit(PimAction::UpstreamJoinDesired { sg, joined: false });
                    self.send_upstream_join_prune(id, false);
                }
            }
        }
    }

    /// Stop PIM forwarding on every channel of the entry
    fn forward_off(&mut self, id: UpstreamId) {
        let channels: Vec<ChannelId> = self
            .upstreams
            .get(id)
            .map(|up| up.ifchannels.iter().copied().collect())
            .unwrap_or_default();
        for ch in channels {
            self.forward_stop(ch);
        }
    }

    /// Add every interface of the inherited OIL; returns how many qualify
    pub(crate) fn inherited_olist_decide(&mut self, id: UpstreamId) -> usize {
        let Some(up) = self.upstreams.get_mut(id) else {
            return 0;
        };
        if up.channel_oil.is_none() {
            match up.rpf.interface {
                Some(iif) => up.channel_oil = Some(ChannelOil::new(up.sg, Some(iif))),
                None => return 0,
            }
        }
        let sg = up.sg;
        let parent = up.parent;
        let parent_sg = parent.and_then(|p| self.upstreams.get(p)).map(|p| p.sg);

        let candidates: Vec<(VifIndex, Option<ChannelId>, Option<ChannelId>)> = self
            .interfaces
            .values()
            .map(|iface| {
                (
                    iface.vif_index,
                    iface.channels.get(&sg).copied(),
                    parent_sg.and_then(|psg| iface.channels.get(&psg).copied()),
                )
            })
            .filter(|(_, ch, star)| ch.is_some() || star.is_some())
            .collect();

        let mut count = 0;
        for (vif, ch, star) in candidates {
            if !self.join_desired_interface(id, ch, star) {
                continue;
            }
            let flags = self.inherited_flags(id, ch, star);
            self.oil_add(id, vif, flags);
            count += 1;
        }
        count
    }

    /// Origins of an inherited-OIL interface
    fn inherited_flags(&self, id: UpstreamId, ch: Option<ChannelId>, star: Option<ChannelId>) -> OifFlags {
        let mut flags = OifFlags::empty();
        if let Some(cid) = ch {
            if self.joins(cid) {
                flags |= OifFlags::PROTO_PIM;
            }
            if self.pim_include(cid) {
                flags |= self.local_oif_flag(cid);
            }
        }
        if star.is_some() && self.inherit_interface(id, ch, star) {
            flags |= OifFlags::PROTO_STAR;
        }
        flags
    }

    /// OIF flag contributed by a channel's local membership
    pub(crate) fn local_oif_flag(&self, id: ChannelId) -> OifFlags {
        let igmp = self.channels.get(&id).is_some_and(|c| {
            c.local_membership == LocalMembership::Include
                && c.flags.contains(ChannelFlags::PROTO_IGMP)
        });
        if igmp {
            OifFlags::PROTO_IGMP
        } else {
            OifFlags::PROTO_VXLAN
        }
    }

    /// Populate the inherited OIL and re-evaluate JoinDesired
    pub(crate) fn inherited_olist(&mut self, id: UpstreamId) -> usize {
        let count = self.inherited_olist_decide(id);
        self.update_join_desired(id);

        // Nothing to forward: install the entry anyway so arriving traffic is dropped
        if count == 0 {
            self.mroute_install(id);
        }
        count
    }

    pub fn empty_inherited_olist(&self, id: UpstreamId) -> bool {
        self.upstreams
            .get(id)
            .and_then(|up| up.channel_oil.as_ref())
            .map_or(true, |oil| oil.is_empty())
    }

    /// Send a Join or Prune for the entry toward RPF'(S,G)
    pub(crate) fn send_upstream_join_prune(&mut self, id: UpstreamId, is_join: bool) {
        let Some(up) = self.upstreams.get(id) else {
            return;
        };
        let sg = up.sg;
        match up.rpf.interface {
            Some(vif) if !up.rpf.neighbor.is_unspecified() => {
                let neighbor = up.rpf.neighbor;
                self.emit(PimAction::SendJoinPrune {
                    vif,
                    neighbor,
                    sg,
                    is_join,
                });
            }
            _ => {
                log_debug!(
                    self.logger,
                    Facility::Upstream,
                    &format!("{} no RPF neighbor, {} not sent", sg, if is_join { "join" } else { "prune" })
                );
            }
        }
    }

    /// (Re)start the keepalive timer of an entry
    pub(crate) fn keepalive_start(&mut self, id: UpstreamId) {
        let delay = self.config.keep_alive_time();
        let now = self.now;
        let Some(up) = self.upstreams.get_mut(id) else {
            return;
        };
        if let Some(old) = up.keepalive_timer.take() {
            self.timers.cancel(old);
        }
        up.keepalive_timer = Some(self.timers.schedule(TimerType::UpstreamKeepalive(id), delay, now));
    }

    /// Traffic was seen for `sg`: push back the keepalive expiry
    pub fn refresh_keepalive(&mut self, sg: SourceGroup, now: Instant) -> bool {
        self.now = now;
        let Some(id) = self.upstreams.find(&sg) else {
            return false;
        };
        let running = self
            .upstreams
            .get(id)
            .is_some_and(|up| up.keepalive_timer.is_some());
        if running {
            self.keepalive_start(id);
        }
        running
    }

    /// Keepalive expiry: a last-hop entry drops its LHR reference
    pub(crate) fn on_keepalive_timer(&mut self, id: UpstreamId) {
        let Some(up) = self.upstreams.get_mut(id) else {
            return;
        };
        if !up.flags.contains(UpstreamFlags::SRC_LHR) {
            return;
        }
        up.flags.remove(UpstreamFlags::SRC_LHR);
        let sg = up.sg;
        log_debug!(
            self.logger,
            Facility::Upstream,
            &format!("{} keepalive expired, dropping LHR reference", sg)
        );
        self.upstream_release(id);
    }

    pub fn upstream(&self, sg: &SourceGroup) -> Option<&Upstream> {
        self.upstreams.find(sg).and_then(|id| self.upstreams.get(id))
    }

    pub fn upstream_count(&self) -> usize {
        self.upstreams.len()
    }
}
