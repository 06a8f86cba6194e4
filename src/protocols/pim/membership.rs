// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Local membership (IGMP/MLD receivers, VXLAN termination) on channels.

use std::time::Instant;

use super::ifchannel::{ChannelFlags, ChannelId, LocalMembership};
use super::interface::VifIndex;
use super::oil::OifFlags;
use super::sg::{SourceFlags, SourceGroup};
use super::upstream::{UpstreamFlags, UpstreamId};
use super::PimCore;
use crate::log_debug;
use crate::logging::Facility;

impl PimCore {
    /// A local receiver joined `sg` on `interface`
    ///
    /// Returns false when the interface is unknown or not PIM-enabled. A
    /// (*,G) in the SSM range is accepted without creating any state.
    pub fn local_membership_add(
        &mut self,
        interface: &str,
        sg: SourceGroup,
        vxlan: bool,
        now: Instant,
    ) -> bool {
        self.now = now;
        let Some(vif) = self.active_vif(interface, &sg, "local membership") else {
            return false;
        };
        if sg.source_is_wildcard() && self.config.is_ssm(sg.group) {
            log_debug!(
                self.logger,
                Facility::IfChannel,
                &format!("{} local membership {} has no effect on SSM group", interface, sg)
            );
            return true;
        }

        let up_flags = if vxlan {
            UpstreamFlags::SRC_VXLAN_TERM
        } else {
            UpstreamFlags::SRC_IGMP
        };
        let id = self.channel_add(vif, sg, SourceFlags::empty(), up_flags);
        self.ifmembership_set(id, LocalMembership::Include);
        self.membership_forwarding(id);
        true
    }

    /// The last local receiver for `sg` on `interface` left
    pub fn local_membership_del(&mut self, interface: &str, sg: SourceGroup, now: Instant) -> bool {
        self.now = now;
        let Some(id) = self.find(interface, &sg) else {
            return false;
        };
        self.membership_remove(id);
        self.delete_on_noinfo(id);
        true
    }

    pub(crate) fn membership_remove(&mut self, id: ChannelId) {
        self.ifmembership_set(id, LocalMembership::NoInfo);
        self.membership_forwarding(id);
        self.drop_local_references(id);
    }

    /// Clear the IGMP/VXLAN origin of a channel whose receivers left; the
    /// upstream keeps its flags while another interface still includes it
    fn drop_local_references(&mut self, id: ChannelId) {
        let Some(ch) = self.channels.get_mut(&id) else {
            return;
        };
        ch.flags.remove(ChannelFlags::PROTO_IGMP);
        let upstream = ch.upstream;
        let still_included = self.upstreams.get(upstream).is_some_and(|up| {
            up.ifchannels.iter().any(|c| {
                self.channels
                    .get(c)
                    .is_some_and(|c| c.local_membership == LocalMembership::Include)
            })
        });
        if still_included {
            return;
        }
        if let Some(up) = self.upstreams.get_mut(upstream) {
            up.flags
                .remove(UpstreamFlags::SRC_IGMP | UpstreamFlags::SRC_VXLAN_TERM);
        }
    }

    /// Bring the OIL in line with the channel's local membership
    ///
    /// An (S,G) or (*,G) channel adds or clears its own local flag. A (*,G)
    /// also re-derives the inherited flag on each (S,G) of its group.
    pub(crate) fn membership_forwarding(&mut self, id: ChannelId) {
        let Some((vif, sg, upstream)) = self.channels.get(&id).map(|c| (c.vif, c.sg, c.upstream)) else {
            return;
        };
        if self.pim_include(id) {
            let flag = self.local_oif_flag(id);
            self.oil_add(upstream, vif, flag);
        } else {
            self.oil_del(upstream, vif, OifFlags::PROTO_IGMP | OifFlags::PROTO_VXLAN);
        }

        if sg.source_is_wildcard() {
            let sources: Vec<UpstreamId> = self
                .upstreams
                .get(upstream)
                .map(|up| up.sources.iter().copied().collect())
                .unwrap_or_default();
            for child in sources {
                self.star_inherit(child, vif, id);
            }
        }
        self.update_join_desired(upstream);
    }

    /// Re-derive one (S,G)'s inherited OIF on `vif` from the (*,G) channel `star`
    pub(crate) fn star_inherit(&mut self, child: UpstreamId, vif: VifIndex, star: ChannelId) {
        let Some(child_sg) = self.upstreams.get(child).map(|c| c.sg) else {
            return;
        };
        let child_ch = self.find_on(vif, &child_sg);
        if self.inherit_interface(child, child_ch, Some(star)) {
            self.oil_add(child, vif, OifFlags::PROTO_STAR);
            self.update_join_desired(child);
        } else if self.star_flag_set(child, vif) {
            self.oil_del_inherited(child, vif);
        }
    }

    fn star_flag_set(&self, id: UpstreamId, vif: VifIndex) -> bool {
        self.upstreams
            .get(id)
            .and_then(|up| up.channel_oil.as_ref())
            .is_some_and(|oil| oil.flags(vif).contains(OifFlags::PROTO_STAR))
    }
}
