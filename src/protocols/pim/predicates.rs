// SPDX-License-Identifier: Apache-2.0 OR MIT
//! RFC 7761 state macros, evaluated against the current table.
//!
//! Every predicate takes channel ids and answers false for an id that no
//! longer resolves.

use super::assert::AssertMetric;
use super::ifchannel::{ChannelFlags, ChannelId, InterfaceChannel, JoinState, LocalMembership};
use super::interface::{PimInterface, VifIndex};
use super::upstream::{Upstream, UpstreamFlags, UpstreamId, UpstreamJoinState};
use super::PimCore;

impl PimCore {
    /// Channel, its interface and its upstream
    fn channel_context(&self, id: ChannelId) -> Option<(&InterfaceChannel, &PimInterface, &Upstream)> {
        let ch = self.channels.get(&id)?;
        let iface = self.interfaces.get(&ch.vif)?;
        let up = self.upstreams.get(ch.upstream)?;
        Some((ch, iface, up))
    }

    /// lost_assert(S,G,I): someone else won and beats our path to the source
    pub fn lost_assert(&self, id: ChannelId) -> bool {
        let Some((ch, iface, up)) = self.channel_context(id) else {
            return false;
        };
        if up.rpf.interface == Some(ch.vif) {
            return false;
        }
        if ch.assert_winner.is_unspecified() || ch.assert_winner == iface.primary_address {
            return false;
        }
        let spt = AssertMetric::spt(&up.rpf, iface.primary_address);
        ch.assert_winner_metric.better(&spt)
    }

    /// I in joins(S,G)
    pub fn joins(&self, id: ChannelId) -> bool {
        self.channels
            .get(&id)
            .is_some_and(|ch| matches!(ch.join_state, JoinState::Join | JoinState::PrunePending))
    }

    /// I in pim_include(S,G)
    pub fn pim_include(&self, id: ChannelId) -> bool {
        let Some((ch, iface, _)) = self.channel_context(id) else {
            return false;
        };
        if ch.local_membership != LocalMembership::Include {
            return false;
        }
        ch.assert_winner == iface.primary_address || (iface.i_am_dr() && !self.lost_assert(id))
    }

    pub fn joins_or_include(&self, id: ChannelId) -> bool {
        self.joins(id) || self.pim_include(id)
    }

    /// CouldAssert(S,G,I)
    pub fn could_assert(&self, id: ChannelId) -> bool {
        let Some((ch, _, up)) = self.channel_context(id) else {
            return false;
        };
        up.spt_bit && up.rpf.interface != Some(ch.vif) && self.joins_or_include(id)
    }

    /// my_assert_metric(S,G,I)
    pub fn my_assert_metric(&self, id: ChannelId) -> AssertMetric {
        match self.channel_context(id) {
            Some((ch, iface, up)) if ch.flags.contains(ChannelFlags::COULD_ASSERT) => {
                AssertMetric::spt(&up.rpf, iface.primary_address)
            }
            _ => AssertMetric::INFINITE,
        }
    }

    /// The channel's interface belongs in the entry's OIL
    pub fn is_in_oiflist(&self, id: ChannelId) -> bool {
        let Some((ch, _, up)) = self.channel_context(id) else {
            return false;
        };
        if up.join_state == UpstreamJoinState::NotJoined || up.rpf.interface == Some(ch.vif) {
            return false;
        }
        !self.lost_assert(id) && self.joins_or_include(id)
    }

    /// `vif` currently carries traffic of the upstream
    pub fn is_in_inherited_olist(&self, up: UpstreamId, vif: VifIndex) -> bool {
        self.upstreams
            .get(up)
            .and_then(|up| up.channel_oil.as_ref())
            .is_some_and(|oil| oil.contains(vif))
    }

    /// AssertTrackingDesired(S,G,I)
    pub fn assert_tracking_desired(&self, id: ChannelId) -> bool {
        let Some((ch, iface, up)) = self.channel_context(id) else {
            return false;
        };
        if self.joins(id) {
            return true;
        }
        if ch.local_membership == LocalMembership::Include
            && (iface.i_am_dr() || ch.assert_winner == iface.primary_address)
        {
            return true;
        }
        up.rpf.interface == Some(ch.vif) && up.flags.contains(UpstreamFlags::DR_JOIN_DESIRED)
    }

    /// Whether one interface, with its (S,G) and (*,G) channels, wants the entry
    pub fn join_desired_interface(
        &self,
        up: UpstreamId,
        ch: Option<ChannelId>,
        star: Option<ChannelId>,
    ) -> bool {
        debug_assert!(
            ch.and_then(|c| self.channels.get(&c))
                .map_or(true, |c| c.upstream == up),
            "channel evaluated against a foreign upstream"
        );
        if let Some(c) = ch {
            if self.is_sg_rpt(c) {
                return false;
            }
            if !self.lost_assert(c) && self.joins_or_include(c) {
                return true;
            }
        }
        match star {
            Some(s) => !self.lost_assert(s) && self.joins_or_include(s),
            None => false,
        }
    }

    /// Whether an (S,G) inherits the (*,G) state of the interface
    pub fn inherit_interface(
        &self,
        up: UpstreamId,
        ch: Option<ChannelId>,
        star: Option<ChannelId>,
    ) -> bool {
        if ch.is_some_and(|c| self.is_sg_rpt(c)) {
            return false;
        }
        self.join_desired_interface(up, None, star)
    }

    fn is_sg_rpt(&self, id: ChannelId) -> bool {
        self.channels
            .get(&id)
            .is_some_and(|ch| ch.flags.contains(ChannelFlags::S_G_RPT))
    }
}
