// SPDX-License-Identifier: Apache-2.0 OR MIT
//! PIM-SM downstream core (RFC 7761).
//!
//! [`PimCore`] owns every interface, upstream entry, interface channel and
//! timer. Inbound events are methods that take the current time; each one
//! runs to completion and leaves its outbound requests in an action list
//! the caller drains with [`PimCore::take_actions`] or hands to adapters
//! with [`PimCore::dispatch`].

pub mod actions;
pub mod assert;
pub mod batch;
pub mod error;
pub mod event;
pub mod ifchannel;
pub mod interface;
pub mod join_prune;
pub mod membership;
pub mod oil;
mod predicates;
pub mod sg;
pub mod stats;
pub mod upstream;

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

pub use actions::{HandlerResult, JoinPruneSender, OilAdapter, PimAction};
pub use assert::{AssertMetric, AssertState};
pub use batch::StarGUpdateSession;
pub use error::PimError;
pub use event::PimEvent;
pub use ifchannel::{
    ChannelFlags, ChannelId, ChannelSummary, ChannelTimer, InterfaceChannel, JoinState,
    LocalMembership,
};
pub use interface::{InterfaceSummary, PimInterface, PimNeighbor, VifIndex};
pub use join_prune::{EncodedSource, JoinPruneGroup, HOLDTIME_INFINITE};
pub use oil::{ChannelOil, OifFlags, OilChange};
pub use sg::{SourceFlags, SourceGroup, WILDCARD};
pub use upstream::{Rpf, Upstream, UpstreamFlags, UpstreamId, UpstreamJoinState, UpstreamSummary};

use crate::config::CoreConfig;
use crate::logging::{Facility, Logger};
use crate::protocols::{TimerRequest, TimerToken, TimerType};
use crate::supervisor::timer_manager::TimerQueue;
use crate::{log_debug, log_warning};

use upstream::UpstreamRegistry;

/// The downstream state of one router
pub struct PimCore {
    pub(crate) config: CoreConfig,
    pub(crate) interfaces: BTreeMap<VifIndex, PimInterface>,
    pub(crate) names: HashMap<String, VifIndex>,
    pub(crate) upstreams: UpstreamRegistry,
    pub(crate) channels: BTreeMap<ChannelId, InterfaceChannel>,
    pub(crate) next_channel_id: u64,
    pub(crate) timers: TimerQueue,
    pub(crate) result: HandlerResult,
    pub(crate) batch: Option<StarGUpdateSession>,
    /// RPF supplied ahead of (or for) upstream entries
    pub(crate) rpf_table: BTreeMap<SourceGroup, Rpf>,
    pub(crate) logger: Logger,
    /// Time of the event being processed
    pub(crate) now: Instant,
}

impl PimCore {
    pub fn new(config: CoreConfig, logger: Logger, now: Instant) -> Self {
        let mut interfaces = BTreeMap::new();
        let mut names = HashMap::new();
        for iface in &config.interfaces {
            names.insert(iface.name.clone(), iface.vif_index);
            interfaces.insert(iface.vif_index, PimInterface::new(iface));
        }
        Self {
            config,
            interfaces,
            names,
            upstreams: UpstreamRegistry::new(),
            channels: BTreeMap::new(),
            next_channel_id: 1,
            timers: TimerQueue::new(),
            result: HandlerResult::new(),
            batch: None,
            rpf_table: BTreeMap::new(),
            logger,
            now,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn interface(&self, name: &str) -> Option<&PimInterface> {
        self.names.get(name).and_then(|vif| self.interfaces.get(vif))
    }

    pub fn interface_by_vif(&self, vif: VifIndex) -> Option<&PimInterface> {
        self.interfaces.get(&vif)
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &PimInterface> {
        self.interfaces.values()
    }

    pub fn upstreams(&self) -> impl Iterator<Item = &Upstream> {
        self.upstreams.iter()
    }

    /// Resolve an interface that may carry protocol state for `sg`
    pub(crate) fn active_vif(&self, name: &str, sg: &SourceGroup, what: &str) -> Option<VifIndex> {
        let Some(vif) = self.names.get(name).copied() else {
            log_warning!(
                self.logger,
                Facility::IfChannel,
                &format!("{} {} on unknown interface {}", what, sg, name)
            );
            return None;
        };
        let iface = self.interfaces.get(&vif)?;
        if !iface.pim_enabled {
            log_warning!(
                self.logger,
                Facility::IfChannel,
                &format!("{} {} on {}: PIM not enabled", what, sg, name)
            );
            return None;
        }
        if !iface.up {
            log_debug!(
                self.logger,
                Facility::IfChannel,
                &format!("{} {} on {}: interface down", what, sg, name)
            );
            return None;
        }
        Some(vif)
    }

    pub(crate) fn emit(&mut self, action: PimAction) {
        self.result.add_action(action);
    }

    /// Drain the actions produced since the last call
    pub fn take_actions(&mut self) -> Vec<PimAction> {
        self.result.take()
    }

    /// Hand pending actions to the adapters; returns how many were delivered
    pub fn dispatch(&mut self, oil: &mut dyn OilAdapter, jp: &mut dyn JoinPruneSender) -> usize {
        self.result.dispatch_all(oil, jp)
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Fire every timer due at `now`; returns how many handlers ran
    pub fn run_timers(&mut self, now: Instant) -> usize {
        self.now = now;
        let mut fired = 0;
        for request in self.timers.pop_expired(now) {
            if !self.claim_timer(&request) {
                log_debug!(
                    self.logger,
                    Facility::Timer,
                    &format!("stale {} {:?} dropped", request.token, request.timer_type)
                );
                continue;
            }
            log_debug!(
                self.logger,
                Facility::Timer,
                &format!("{} {:?} fired", request.token, request.timer_type)
            );
            match request.timer_type {
                TimerType::IfJoinExpiry(id) => self.on_join_expiry(id),
                TimerType::PrunePending(id) => self.on_prune_pending(id),
                TimerType::Assert(id) => self.on_assert_timer(id),
                TimerType::UpstreamKeepalive(id) => self.on_keepalive_timer(id),
                TimerType::NeighborExpiry { vif, neighbor } => self.on_neighbor_expiry(vif, neighbor),
            }
            fired += 1;
        }
        fired
    }

    /// Take the fired token out of its owner; false if the owner moved on
    fn claim_timer(&mut self, request: &TimerRequest) -> bool {
        let slot = match request.timer_type {
            TimerType::IfJoinExpiry(id) => self.channels.get_mut(&id).map(|c| &mut c.expiry_timer),
            TimerType::PrunePending(id) => self
                .channels
                .get_mut(&id)
                .map(|c| &mut c.prune_pending_timer),
            TimerType::Assert(id) => self.channels.get_mut(&id).map(|c| &mut c.assert_timer),
            TimerType::UpstreamKeepalive(id) => self.upstreams.get_mut(id).map(|u| &mut u.keepalive_timer),
            TimerType::NeighborExpiry { vif, neighbor } => self
                .interfaces
                .get_mut(&vif)
                .and_then(|i| i.neighbors.get_mut(&neighbor))
                .map(|n| &mut n.expiry_timer),
        };
        claim(slot, request.token)
    }

    /// Text dump of the channel table, one line per channel
    pub fn dump_channels(&self) -> Vec<String> {
        self.interfaces
            .values()
            .flat_map(|iface| {
                iface.channels.values().filter_map(|id| self.channels.get(id)).map(|ch| {
                    format!(
                        "{} {} join={} membership={:?} assert={} winner={} flags={:?}",
                        iface.name,
                        ch.sg,
                        self.effective_join_state(ch.id).unwrap_or(ch.join_state),
                        ch.local_membership,
                        ch.assert_state,
                        ch.assert_winner,
                        ch.flags
                    )
                })
            })
            .collect()
    }
}

fn claim(slot: Option<&mut Option<TimerToken>>, token: TimerToken) -> bool {
    match slot {
        Some(stored) if *stored == Some(token) => {
            *stored = None;
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterfaceConfig;
    use std::time::Duration;

    fn core() -> PimCore {
        let mut config = CoreConfig::default();
        config.interfaces.push(InterfaceConfig {
            name: "eth0".to_string(),
            vif_index: 1,
            address: "10.0.0.1".parse().unwrap(),
            pim_enabled: true,
            dr_priority: 1,
            dual_active: false,
        });
        config.interfaces.push(InterfaceConfig {
            name: "eth1".to_string(),
            vif_index: 2,
            address: "10.0.1.1".parse().unwrap(),
            pim_enabled: false,
            dr_priority: 1,
            dual_active: false,
        });
        PimCore::new(config, Logger::disabled(), Instant::now())
    }

    fn sg() -> SourceGroup {
        SourceGroup::new("10.1.1.1".parse().unwrap(), "239.1.1.1".parse().unwrap()).unwrap()
    }

    #[test]
    fn test_active_vif_filters() {
        let core = core();
        assert_eq!(core.active_vif("eth0", &sg(), "test"), Some(1));
        assert_eq!(core.active_vif("eth1", &sg(), "test"), None);
        assert_eq!(core.active_vif("eth9", &sg(), "test"), None);
    }

    #[test]
    fn test_stale_timer_is_dropped() {
        let mut core = core();
        let start = core.now;
        let id = core
            .get_or_create("eth0", sg(), SourceFlags::empty(), UpstreamFlags::empty())
            .unwrap();
        core.arm_channel_timer(id, ChannelTimer::Expiry, Duration::from_secs(5));
        // Re-arming replaces the token; only the second one may fire
        core.arm_channel_timer(id, ChannelTimer::Expiry, Duration::from_secs(10));
        assert_eq!(core.run_timers(start + Duration::from_secs(6)), 0);
        assert!(core.channel(id).is_some());

        assert_eq!(core.run_timers(start + Duration::from_secs(10)), 1);
        assert!(core.channel(id).is_none());
    }

    #[test]
    fn test_claim() {
        let mut slot = Some(TimerToken(3));
        assert!(!claim(Some(&mut slot), TimerToken(4)));
        assert!(claim(Some(&mut slot), TimerToken(3)));
        assert_eq!(slot, None);
        assert!(!claim(None, TimerToken(3)));
    }
}
