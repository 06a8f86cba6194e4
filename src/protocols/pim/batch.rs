// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Batched (*,G,rpt) updates within one Join/Prune message.
//!
//! A Join(*,G) implicitly cancels every Prune(S,G,rpt) of the group that
//! the same message does not repeat. The session snapshots the (S,G,rpt)
//! children that are in Prune or PrunePending; prunes seen later in the
//! message take children out of the snapshot, and whatever is left at the
//! end of the group collapses to NoInfo.

use std::collections::BTreeMap;

use serde::Serialize;

use super::error::PimError;
use super::ifchannel::{ChannelFlags, ChannelId, ChannelTimer, JoinState};
use super::PimCore;
use crate::log_debug;
use crate::logging::Facility;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StarGUpdateSession {
    /// The (*,G) channel whose Join opened the session
    pub star: ChannelId,
    /// Children not yet refreshed, with their stored state at the start
    pub pending: BTreeMap<ChannelId, JoinState>,
}

impl PimCore {
    pub fn batch_in_progress(&self) -> bool {
        self.batch.is_some()
    }

    /// Open a session over the (S,G,rpt) children of `star`
    pub fn begin_star_g_update(&mut self, star: ChannelId) -> Result<(), PimError> {
        if let Some(session) = &self.batch {
            return Err(PimError::BatchInProgress(self.describe(session.star)));
        }
        let ch = self.channels.get(&star).ok_or(PimError::UnknownChannel(star))?;
        let pending: BTreeMap<ChannelId, JoinState> = ch
            .children
            .iter()
            .filter_map(|child| self.channels.get(child))
            .filter(|child| child.flags.contains(ChannelFlags::S_G_RPT))
            .filter(|child| matches!(child.join_state, JoinState::Prune | JoinState::PrunePending))
            .map(|child| (child.id, child.join_state))
            .collect();

        log_debug!(
            self.logger,
            Facility::IfChannel,
            &format!("{} update session, {} pending", self.describe(star), pending.len())
        );
        self.batch = Some(StarGUpdateSession { star, pending });
        Ok(())
    }

    /// Close the session; returns how many children fell back to NoInfo
    pub fn end_star_g_update(&mut self) -> Result<usize, PimError> {
        let session = self.batch.take().ok_or(PimError::NoBatchInProgress)?;
        let star = session.star;

        let mut collapsed = 0;
        for id in session.pending.into_keys() {
            let Some((vif, upstream)) = self.channels.get(&id).map(|c| (c.vif, c.upstream)) else {
                continue;
            };
            self.cancel_channel_timer(id, ChannelTimer::PrunePending);
            self.cancel_channel_timer(id, ChannelTimer::Expiry);
            if let Some(ch) = self.channels.get_mut(&id) {
                ch.flags.remove(ChannelFlags::S_G_RPT);
            }
            self.ifjoin_switch(id, JoinState::NoInfo);
            if self.channels.contains_key(&star) {
                self.star_inherit(upstream, vif, star);
            }
            self.update_join_desired(upstream);
            self.delete_on_noinfo(id);
            collapsed += 1;
        }

        if collapsed > 0 {
            if let Some(up) = self.channels.get(&star).map(|c| c.upstream) {
                self.send_upstream_join_prune(up, true);
            }
        }
        Ok(collapsed)
    }

    /// Join state as seen mid-message: pending children report a Tmp state
    pub fn effective_join_state(&self, id: ChannelId) -> Option<JoinState> {
        let ch = self.channels.get(&id)?;
        let pending = self
            .batch
            .as_ref()
            .is_some_and(|session| session.pending.contains_key(&id));
        Some(match (pending, ch.join_state) {
            (true, JoinState::Prune) => JoinState::PruneTmp,
            (true, JoinState::PrunePending) => JoinState::PrunePendingTmp,
            (_, state) => state,
        })
    }

    /// Whether `id` is pending in the open session
    pub(crate) fn batch_pending(&self, id: ChannelId) -> bool {
        self.batch
            .as_ref()
            .is_some_and(|session| session.pending.contains_key(&id))
    }

    /// A prune in the message refreshed a pending child
    pub(crate) fn batch_refresh(&mut self, id: ChannelId) -> Option<JoinState> {
        self.batch.as_mut()?.pending.remove(&id)
    }
}
