// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Outbound actions of the PIM core
//!
//! Transition functions never call the forwarding plane or the message
//! layer directly. Every side effect is recorded as a [`PimAction`] in the
//! core's [`HandlerResult`]; the caller drains it after each event and
//! dispatches it onto the two adapter traits.

use std::net::Ipv4Addr;

use serde::Serialize;

use super::assert::AssertMetric;
use super::interface::VifIndex;
use super::oil::OifFlags;
use super::sg::SourceGroup;

/// Side effects requested by the core
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PimAction {
    /// Flags newly set on an outgoing interface
    AddOif {
        sg: SourceGroup,
        vif: VifIndex,
        flags: OifFlags,
    },
    /// Flags cleared on an outgoing interface; `removed` when it left the OIL
    DelOif {
        sg: SourceGroup,
        vif: VifIndex,
        flags: OifFlags,
        removed: bool,
    },
    /// (*,G)-inherited flag cleared on an (S,G) outgoing interface
    DelInheritedOif {
        sg: SourceGroup,
        vif: VifIndex,
        removed: bool,
    },
    /// Push the entry to the forwarding plane
    MrouteInstall { sg: SourceGroup, iif: VifIndex },
    /// Withdraw the entry from the forwarding plane
    MrouteRemove { sg: SourceGroup },
    /// Upstream JoinDesired changed
    UpstreamJoinDesired { sg: SourceGroup, joined: bool },
    /// Send a Join or Prune for `sg` to `neighbor` out of `vif`
    SendJoinPrune {
        vif: VifIndex,
        neighbor: Ipv4Addr,
        sg: SourceGroup,
        is_join: bool,
    },
    /// Another router's Join to our RPF neighbor was seen: suppress ours
    JoinSuppress {
        sg: SourceGroup,
        rpf: Ipv4Addr,
        holdtime: u16,
    },
    /// Another router's Prune to our RPF neighbor was seen: override it
    JoinTimerOverride { sg: SourceGroup, rpf: Ipv4Addr },
    SendAssert {
        vif: VifIndex,
        sg: SourceGroup,
        metric: AssertMetric,
    },
    SendAssertCancel {
        vif: VifIndex,
        sg: SourceGroup,
        metric: AssertMetric,
    },
    /// First dual-active interface channel for the upstream
    MlagLocalAdd { sg: SourceGroup },
    /// Last dual-active interface channel for the upstream went away
    MlagLocalDel { sg: SourceGroup },
}

impl PimAction {
    pub fn sg(&self) -> SourceGroup {
        match self {
            PimAction::AddOif { sg, .. }
            | PimAction::DelOif { sg, .. }
            | PimAction::DelInheritedOif { sg, .. }
            | PimAction::MrouteInstall { sg, .. }
            | PimAction::MrouteRemove { sg }
            | PimAction::UpstreamJoinDesired { sg, .. }
            | PimAction::SendJoinPrune { sg, .. }
            | PimAction::JoinSuppress { sg, .. }
            | PimAction::JoinTimerOverride { sg, .. }
            | PimAction::SendAssert { sg, .. }
            | PimAction::SendAssertCancel { sg, .. }
            | PimAction::MlagLocalAdd { sg }
            | PimAction::MlagLocalDel { sg } => *sg,
        }
    }
}

/// Forwarding-plane collaborator
pub trait OilAdapter {
    fn add_oif(&mut self, sg: SourceGroup, vif: VifIndex, flags: OifFlags);
    fn del_oif(&mut self, sg: SourceGroup, vif: VifIndex, flags: OifFlags, removed: bool);
    fn del_inherited_oif(&mut self, sg: SourceGroup, vif: VifIndex, removed: bool);
    fn mroute_install(&mut self, sg: SourceGroup, iif: VifIndex);
    fn mroute_remove(&mut self, sg: SourceGroup);
}

/// Message-layer and aggregation collaborator
pub trait JoinPruneSender {
    fn send_join_prune(&mut self, vif: VifIndex, neighbor: Ipv4Addr, sg: SourceGroup, is_join: bool);
    fn update_join_desired(&mut self, sg: SourceGroup, joined: bool);
    fn join_suppress(&mut self, sg: SourceGroup, rpf: Ipv4Addr, holdtime: u16);
    fn join_timer_override(&mut self, sg: SourceGroup, rpf: Ipv4Addr);
    fn send_assert(&mut self, vif: VifIndex, sg: SourceGroup, metric: AssertMetric);
    fn send_assert_cancel(&mut self, vif: VifIndex, sg: SourceGroup, metric: AssertMetric);

    fn mlag_local_add(&mut self, _sg: SourceGroup) {}
    fn mlag_local_del(&mut self, _sg: SourceGroup) {}
}

/// Deliver one action to the collaborator that owns it
pub fn dispatch(action: &PimAction, oil: &mut dyn OilAdapter, jp: &mut dyn JoinPruneSender) {
    match *action {
        PimAction::AddOif { sg, vif, flags } => oil.add_oif(sg, vif, flags),
        PimAction::DelOif {
            sg,
            vif,
            flags,
            removed,
        } => oil.del_oif(sg, vif, flags, removed),
        PimAction::DelInheritedOif { sg, vif, removed } => oil.del_inherited_oif(sg, vif, removed),
        PimAction::MrouteInstall { sg, iif } => oil.mroute_install(sg, iif),
        PimAction::MrouteRemove { sg } => oil.mroute_remove(sg),
        PimAction::UpstreamJoinDesired { sg, joined } => jp.update_join_desired(sg, joined),
        PimAction::SendJoinPrune {
            vif,
            neighbor,
            sg,
            is_join,
        } => jp.send_join_prune(vif, neighbor, sg, is_join),
        PimAction::JoinSuppress { sg, rpf, holdtime } => jp.join_suppress(sg, rpf, holdtime),
        PimAction::JoinTimerOverride { sg, rpf } => jp.join_timer_override(sg, rpf),
        PimAction::SendAssert { vif, sg, metric } => jp.send_assert(vif, sg, metric),
        PimAction::SendAssertCancel { vif, sg, metric } => jp.send_assert_cancel(vif, sg, metric),
        PimAction::MlagLocalAdd { sg } => jp.mlag_local_add(sg),
        PimAction::MlagLocalDel { sg } => jp.mlag_local_del(sg),
    }
}

/// Actions accumulated while handling events
#[derive(Debug, Default)]
pub struct HandlerResult {
    pub actions: Vec<PimAction>,
}

impl HandlerResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_action(&mut self, action: PimAction) {
        self.actions.push(action);
    }

    /// Merge another result into this one
    pub fn merge(&mut self, other: HandlerResult) {
        self.actions.extend(other.actions);
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Move the accumulated actions out, leaving the result empty
    pub fn take(&mut self) -> Vec<PimAction> {
        std::mem::take(&mut self.actions)
    }

    /// Dispatch and clear everything accumulated so far
    pub fn dispatch_all(&mut self, oil: &mut dyn OilAdapter, jp: &mut dyn JoinPruneSender) -> usize {
        let actions = self.take();
        for action in &actions {
            dispatch(action, oil, jp);
        }
        actions.len()
    }
}
