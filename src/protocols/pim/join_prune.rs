// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Downstream Join/Prune state machine (RFC 7761 4.5).
//!
//! Messages addressed to another router on the link never touch the
//! downstream state; for an upstream we are joined on they suppress our
//! own join or pull our join timer forward.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::actions::PimAction;
use super::assert::AssertState;
use super::error::PimError;
use super::ifchannel::{ChannelFlags, ChannelId, ChannelTimer, JoinState};
use super::interface::VifIndex;
use super::oil::OifFlags;
use super::sg::{SourceFlags, SourceGroup};
use super::upstream::{UpstreamFlags, UpstreamJoinState};
use super::PimCore;
use crate::logging::Facility;
use crate::{log_debug, log_warning};

/// Holdtime meaning "never expire"
pub const HOLDTIME_INFINITE: u16 = 0xFFFF;

/// One encoded source of a Join/Prune group record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedSource {
    pub source: Ipv4Addr,
    #[serde(default)]
    pub flags: SourceFlags,
}

impl EncodedSource {
    /// The key this entry refers to; WC selects the (*,G)
    pub fn sg(&self, group: Ipv4Addr) -> Result<SourceGroup, PimError> {
        if self.flags.contains(SourceFlags::WILDCARD) {
            Ok(SourceGroup::star_g(group))
        } else {
            SourceGroup::new(self.source, group)
        }
    }
}

/// Joins and prunes for one group of a Join/Prune message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPruneGroup {
    pub group: Ipv4Addr,
    #[serde(default)]
    pub joins: Vec<EncodedSource>,
    #[serde(default)]
    pub prunes: Vec<EncodedSource>,
}

fn holdtime_duration(holdtime: u16) -> Duration {
    Duration::from_secs(u64::from(holdtime))
}

impl PimCore {
    /// Process a whole Join/Prune message received from `neighbor`
    pub fn receive_join_prune(
        &mut self,
        interface: &str,
        neighbor: Ipv4Addr,
        upstream: Ipv4Addr,
        holdtime: u16,
        groups: &[JoinPruneGroup],
        now: Instant,
    ) -> bool {
        self.now = now;
        let Some(vif) = self.names.get(interface).copied() else {
            log_warning!(
                self.logger,
                Facility::IfChannel,
                &format!("join/prune on unknown interface {}", interface)
            );
            return false;
        };
        let Some(iface) = self.interfaces.get(&vif) else {
            return false;
        };
        if !iface.neighbors.contains_key(&neighbor) {
            log_warning!(
                self.logger,
                Facility::IfChannel,
                &format!("{} join/prune from non-neighbor {}", interface, neighbor)
            );
            return false;
        }
        let local = upstream == iface.primary_address;

        let mut acted = false;
        for record in groups {
            let mut session = false;
            for entry in &record.joins {
                let Ok(sg) = entry.sg(record.group) else {
                    log_warning!(
                        self.logger,
                        Facility::IfChannel,
                        &format!("{} join for invalid source {} in {}", interface, entry.source, record.group)
                    );
                    continue;
                };
                acted |= self.receive_join(interface, neighbor, upstream, sg, entry.flags, holdtime, now);

                // Join(*,G) opens the (S,G,rpt) refresh window for the rest of the group
                if local && sg.is_star_g() && !session {
                    if let Some(star) = self.find_on(vif, &sg) {
                        match self.begin_star_g_update(star) {
                            Ok(()) => session = true,
                            Err(e) => log_warning!(
                                self.logger,
                                Facility::IfChannel,
                                &format!("{} {}: {}", interface, sg, e)
                            ),
                        }
                    }
                }
            }
            for entry in &record.prunes {
                let Ok(sg) = entry.sg(record.group) else {
                    log_warning!(
                        self.logger,
                        Facility::IfChannel,
                        &format!("{} prune for invalid source {} in {}", interface, entry.source, record.group)
                    );
                    continue;
                };
                acted |= self.receive_prune(interface, upstream, sg, entry.flags, holdtime, now);
            }
            if session {
                if let Err(e) = self.end_star_g_update() {
                    log_warning!(self.logger, Facility::IfChannel, &format!("{}: {}", interface, e));
                }
            }
        }
        acted
    }

    /// Receive Join(S,G) (or (*,G), (S,G,rpt)) on `interface`
    #[allow(clippy::too_many_arguments)]
    pub fn receive_join(
        &mut self,
        interface: &str,
        neighbor: Ipv4Addr,
        upstream: Ipv4Addr,
        sg: SourceGroup,
        source_flags: SourceFlags,
        holdtime: u16,
        now: Instant,
    ) -> bool {
        self.now = now;
        let Some(vif) = self.active_vif(interface, &sg, "join") else {
            return false;
        };
        if let Some(acted) = self.nonlocal_upstream(vif, true, upstream, sg, source_flags, holdtime) {
            return acted;
        }
        self.join_add(vif, neighbor, sg, source_flags, holdtime);
        true
    }

    /// Receive Prune(S,G) (or (*,G), (S,G,rpt)) on `interface`
    pub fn receive_prune(
        &mut self,
        interface: &str,
        upstream: Ipv4Addr,
        sg: SourceGroup,
        source_flags: SourceFlags,
        holdtime: u16,
        now: Instant,
    ) -> bool {
        self.now = now;
        let Some(vif) = self.active_vif(interface, &sg, "prune") else {
            return false;
        };
        if let Some(acted) = self.nonlocal_upstream(vif, false, upstream, sg, source_flags, holdtime) {
            return acted;
        }
        self.prune_add(vif, sg, source_flags, holdtime)
    }

    /// None when `upstream` is us; otherwise whether the message fed back
    /// into our own upstream state
    fn nonlocal_upstream(
        &mut self,
        vif: VifIndex,
        is_join: bool,
        upstream: Ipv4Addr,
        sg: SourceGroup,
        source_flags: SourceFlags,
        holdtime: u16,
    ) -> Option<bool> {
        let local = self
            .interfaces
            .get(&vif)
            .is_some_and(|i| i.primary_address == upstream);
        if local {
            return None;
        }
        Some(self.check_recv_upstream(is_join, upstream, sg, source_flags, holdtime))
    }

    /// A Join/Prune for another router: react if it is our RPF'(S,G)
    fn check_recv_upstream(
        &mut self,
        is_join: bool,
        upstream: Ipv4Addr,
        sg: SourceGroup,
        source_flags: SourceFlags,
        holdtime: u16,
    ) -> bool {
        let Some(up) = self.upstream(&sg) else {
            return false;
        };
        if up.join_state != UpstreamJoinState::Joined {
            return false;
        }
        let rpf = up.rpf.neighbor;
        if rpf.is_unspecified() {
            log_warning!(self.logger, Facility::Upstream, &format!("{} RPF' not found", sg));
            return false;
        }
        if upstream != rpf {
            log_debug!(
                self.logger,
                Facility::Upstream,
                &format!("{} upstream {} not directed to RPF' {}", sg, upstream, rpf)
            );
            return false;
        }

        if is_join {
            self.emit(PimAction::JoinSuppress { sg, rpf, holdtime });
        } else {
            log_debug!(
                self.logger,
                Facility::Upstream,
                &format!(
                    "{} prune{} to RPF' {}, override",
                    sg,
                    if source_flags.contains(SourceFlags::RPT) { " (rpt)" } else { "" },
                    rpf
                )
            );
            self.emit(PimAction::JoinTimerOverride { sg, rpf });
        }
        true
    }

    fn join_add(&mut self, vif: VifIndex, neighbor: Ipv4Addr, sg: SourceGroup, flags: SourceFlags, holdtime: u16) {
        let id = self.channel_add(vif, sg, flags, UpstreamFlags::SRC_PIM);

        // A join directed at us ends our loser status on this interface
        if self.channels.get(&id).map(|c| c.assert_state) == Some(AssertState::Loser) {
            log_warning!(
                self.logger,
                Facility::Assert,
                &format!("assert loser received join for {} from {}", self.describe(id), neighbor)
            );
            self.assert_action_a5(id);
        }

        let h = holdtime_duration(holdtime);
        if self.batch_pending(id) {
            // Left for the end of the message
            let armed = self.channels.get(&id).is_some_and(|c| c.has_expiry_timer());
            if !armed && holdtime != HOLDTIME_INFINITE {
                self.arm_channel_timer(id, ChannelTimer::Expiry, h);
            }
            return;
        }

        let Some((state, upstream)) = self.channels.get(&id).map(|c| (c.join_state, c.upstream)) else {
            return;
        };
        match state {
            JoinState::NoInfo => {
                self.ifjoin_switch(id, JoinState::Join);
                if self.is_in_oiflist(id) {
                    self.inherited_olist(upstream);
                    self.forward_start(id);
                }
                self.note_last_hop(id);
            }
            JoinState::Join => {
                if self.expiry_remaining(id).is_some_and(|left| left > h) {
                    return;
                }
                self.cancel_channel_timer(id, ChannelTimer::Expiry);
            }
            JoinState::Prune => {
                if flags.contains(SourceFlags::RPT) {
                    self.cancel_channel_timer(id, ChannelTimer::Expiry);
                    self.ifjoin_switch(id, JoinState::NoInfo);
                    self.delete_on_noinfo(id);
                    return;
                }
                self.ifjoin_handler(id);
                if self.expiry_remaining(id).is_some_and(|left| left > h) {
                    return;
                }
                self.cancel_channel_timer(id, ChannelTimer::Expiry);
            }
            JoinState::PrunePending => {
                self.cancel_channel_timer(id, ChannelTimer::PrunePending);
                if flags.contains(SourceFlags::RPT) && sg.is_sg() {
                    self.cancel_channel_timer(id, ChannelTimer::Expiry);
                    self.ifjoin_switch(id, JoinState::NoInfo);
                    self.delete_on_noinfo(id);
                    return;
                }
                self.ifjoin_handler(id);
                if self.expiry_remaining(id).is_some_and(|left| left > h) {
                    return;
                }
                self.cancel_channel_timer(id, ChannelTimer::Expiry);
            }
            JoinState::PruneTmp | JoinState::PrunePendingTmp => {}
        }

        if holdtime != HOLDTIME_INFINITE {
            self.arm_channel_timer(id, ChannelTimer::Expiry, h);
        }
    }

    /// Back to Join from a prune state
    fn ifjoin_handler(&mut self, id: ChannelId) {
        self.ifjoin_switch(id, JoinState::Join);
        let Some(ch) = self.channels.get_mut(&id) else {
            return;
        };
        ch.flags.remove(ChannelFlags::S_G_RPT);
        let (vif, upstream) = (ch.vif, ch.upstream);
        if self.join_desired_interface(upstream, Some(id), None) {
            self.oil_add(upstream, vif, OifFlags::PROTO_PIM);
            self.update_join_desired(upstream);
        }
    }

    /// A join under a (*,G) with local receivers makes us last-hop router
    fn note_last_hop(&mut self, id: ChannelId) {
        let Some(upstream) = self.channels.get(&id).map(|c| c.upstream) else {
            return;
        };
        let Some(up) = self.upstreams.get(upstream) else {
            return;
        };
        let parent_wants = up
            .parent
            .and_then(|p| self.upstreams.get(p))
            .is_some_and(|p| p.flags.intersects(UpstreamFlags::CAN_BE_LHR));
        if parent_wants && !up.flags.contains(UpstreamFlags::SRC_LHR) {
            self.upstream_ref(upstream, UpstreamFlags::SRC_LHR);
            self.keepalive_start(upstream);
        }
    }

    fn prune_add(&mut self, vif: VifIndex, sg: SourceGroup, flags: SourceFlags, holdtime: u16) -> bool {
        let rpt = flags.contains(SourceFlags::RPT);
        if self.find_on(vif, &sg).is_none() && !rpt {
            log_debug!(
                self.logger,
                Facility::IfChannel,
                &format!("prune {} with no channel on vif {}", sg, vif)
            );
            return false;
        }
        let id = self.channel_add(vif, sg, flags, UpstreamFlags::SRC_PIM);
        let h = holdtime_duration(holdtime);

        if self.batch_pending(id) {
            if rpt {
                self.batch_refresh(id);
                self.restart_expiry(id, holdtime);
            }
            return true;
        }

        let Some((state, upstream)) = self.channels.get(&id).map(|c| (c.join_state, c.upstream)) else {
            return false;
        };
        match state {
            JoinState::NoInfo => {
                if !rpt {
                    self.delete_on_noinfo(id);
                    return true;
                }
                if !flags.contains(SourceFlags::WILDCARD) {
                    if let Some(ch) = self.channels.get_mut(&id) {
                        ch.flags.insert(ChannelFlags::S_G_RPT);
                    }
                }
                self.ifjoin_switch(id, JoinState::PrunePending);
                let delay = self.override_delay(vif);
                self.arm_channel_timer(id, ChannelTimer::PrunePending, delay);
                if holdtime != HOLDTIME_INFINITE {
                    self.arm_channel_timer(id, ChannelTimer::Expiry, h);
                }
                self.update_join_desired(upstream);
            }
            JoinState::Join => {
                self.cancel_channel_timer(id, ChannelTimer::PrunePending);
                self.ifjoin_switch(id, JoinState::PrunePending);
                let delay = self.override_delay(vif);
                self.arm_channel_timer(id, ChannelTimer::PrunePending, delay);
                self.update_join_desired(upstream);
            }
            JoinState::Prune => {
                if rpt {
                    self.cancel_channel_timer(id, ChannelTimer::PrunePending);
                    if !self.expiry_remaining(id).is_some_and(|left| left > h) {
                        self.restart_expiry(id, holdtime);
                    }
                }
            }
            JoinState::PrunePending | JoinState::PruneTmp | JoinState::PrunePendingTmp => {}
        }
        true
    }

    fn restart_expiry(&mut self, id: ChannelId, holdtime: u16) {
        self.cancel_channel_timer(id, ChannelTimer::Expiry);
        if holdtime != HOLDTIME_INFINITE {
            self.arm_channel_timer(id, ChannelTimer::Expiry, holdtime_duration(holdtime));
        }
    }

    /// J/P_Override_Interval with other routers on the link, else immediate
    fn override_delay(&self, vif: VifIndex) -> Duration {
        let neighbors = self.interfaces.get(&vif).map_or(0, |i| i.neighbor_count());
        if neighbors > 1 {
            self.config.jp_override_interval()
        } else {
            Duration::ZERO
        }
    }

    /// Prune-pending timer (PPT) expiry
    pub(crate) fn on_prune_pending(&mut self, id: ChannelId) {
        let Some(ch) = self.channels.get(&id) else {
            return;
        };
        if ch.join_state != JoinState::PrunePending {
            return;
        }
        let (vif, sg, upstream, parent) = (ch.vif, ch.sg, ch.upstream, ch.parent);

        if !ch.flags.contains(ChannelFlags::S_G_RPT) {
            let echo = self.interfaces.get(&vif).filter(|i| i.neighbor_count() > 1);
            if let Some(address) = echo.map(|i| i.primary_address) {
                self.emit(PimAction::SendJoinPrune {
                    vif,
                    neighbor: address,
                    sg,
                    is_join: false,
                });
            }
            self.ifjoin_to_noinfo(id);
            return;
        }

        self.ifjoin_switch(id, JoinState::Prune);
        let parent_rpf = parent
            .and_then(|p| self.channels.get(&p))
            .and_then(|p| self.upstreams.get(p.upstream))
            .map(|p| p.rpf);
        if let Some(rpf) = parent_rpf {
            match rpf.interface {
                Some(rpf_vif) if !rpf.neighbor.is_unspecified() => {
                    self.emit(PimAction::SendJoinPrune {
                        vif: rpf_vif,
                        neighbor: rpf.neighbor,
                        sg,
                        is_join: false,
                    });
                }
                _ => log_debug!(
                    self.logger,
                    Facility::IfChannel,
                    &format!("{} (rpt) pruned, no RPF toward the RP", self.describe(id))
                ),
            }
        }
        if self.oil_del(upstream, vif, OifFlags::PROTO_STAR).changed() {
            log_debug!(
                self.logger,
                Facility::Oil,
                &format!("{} (rpt) prune removed inherited vif {}", sg, vif)
            );
        }
        self.update_join_desired(upstream);
        self.mroute_install(upstream);
    }
}
