// SPDX-License-Identifier: Apache-2.0 OR MIT
//! PIM interfaces, neighbor tables and DR election.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::ifchannel::{ChannelId, LocalMembership};
use super::join_prune::HOLDTIME_INFINITE;
use super::sg::SourceGroup;
use super::PimCore;
use crate::config::InterfaceConfig;
use crate::logging::Facility;
use crate::protocols::{TimerToken, TimerType};
use crate::{log_info, log_notice, log_warning};

/// Multicast VIF index; identifies an interface inside the core
pub type VifIndex = u32;

/// Default DR priority (RFC 7761)
pub const DEFAULT_DR_PRIORITY: u32 = 1;

/// Hello holdtime assumed when a neighbor event carries none (3.5 x 30 s)
pub const DEFAULT_HELLO_HOLDTIME_SECS: u16 = 105;

/// PIM neighbor state
#[derive(Debug, Clone)]
pub struct PimNeighbor {
    /// Neighbor's IP address
    pub address: Ipv4Addr,
    /// DR priority from Hello
    pub dr_priority: u32,
    /// When the neighbor was last heard from
    pub last_seen: Instant,
    /// Liveness timer, None when the Hello holdtime was infinite
    pub(crate) expiry_timer: Option<TimerToken>,
}

/// Per-interface PIM state
#[derive(Debug)]
pub struct PimInterface {
    pub name: String,
    pub vif_index: VifIndex,
    /// Our IP address on this interface
    pub primary_address: Ipv4Addr,
    pub pim_enabled: bool,
    /// Operational state
    pub up: bool,
    /// Member of a multi-chassis link aggregation
    pub dual_active: bool,
    pub dr_priority: u32,
    /// PIM neighbors on this interface
    pub neighbors: HashMap<Ipv4Addr, PimNeighbor>,
    /// Current Designated Router (DR)
    pub designated_router: Option<Ipv4Addr>,
    /// Interface channels ordered by (group, source)
    pub(crate) channels: BTreeMap<SourceGroup, ChannelId>,
}

impl PimInterface {
    pub fn new(config: &InterfaceConfig) -> Self {
        let mut interface = Self {
            name: config.name.clone(),
            vif_index: config.vif_index,
            primary_address: config.address,
            pim_enabled: config.pim_enabled,
            up: true,
            dual_active: config.dual_active,
            dr_priority: config.dr_priority,
            neighbors: HashMap::new(),
            designated_router: None,
            channels: BTreeMap::new(),
        };
        interface.elect_dr();
        interface
    }

    /// Check if we are the DR on this interface
    pub fn i_am_dr(&self) -> bool {
        self.designated_router == Some(self.primary_address)
    }

    pub fn neighbor_count(&self) -> usize {
        self.neighbors.len()
    }

    /// Run DR election and return true if DR changed
    pub fn elect_dr(&mut self) -> bool {
        let old_dr = self.designated_router;

        // Collect all candidates: neighbors + ourselves
        let mut candidates: Vec<(u32, Ipv4Addr)> = self
            .neighbors
            .values()
            .map(|n| (n.dr_priority, n.address))
            .collect();
        candidates.push((self.dr_priority, self.primary_address));

        // Sort by (priority DESC, IP DESC) - highest wins
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));

        self.designated_router = candidates.first().map(|(_, ip)| *ip);
        self.designated_router != old_dr
    }

    /// Add or refresh a neighbor; returns the previous liveness timer, if any
    pub(crate) fn upsert_neighbor(
        &mut self,
        address: Ipv4Addr,
        dr_priority: u32,
        now: Instant,
    ) -> Option<TimerToken> {
        match self.neighbors.get_mut(&address) {
            Some(neighbor) => {
                neighbor.dr_priority = dr_priority;
                neighbor.last_seen = now;
                neighbor.expiry_timer.take()
            }
            None => {
                self.neighbors.insert(
                    address,
                    PimNeighbor {
                        address,
                        dr_priority,
                        last_seen: now,
                        expiry_timer: None,
                    },
                );
                None
            }
        }
    }

    /// Channel ids on this interface in (group, source) order
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.channels.values().copied().collect()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn summary(&self) -> InterfaceSummary {
        InterfaceSummary {
            name: self.name.clone(),
            vif_index: self.vif_index,
            address: self.primary_address,
            up: self.up,
            pim_enabled: self.pim_enabled,
            neighbors: self.neighbor_count(),
            designated_router: self.designated_router,
            channels: self.channel_count(),
        }
    }
}

/// Read-only view of an interface for display
#[derive(Debug, Clone, Serialize)]
pub struct InterfaceSummary {
    pub name: String,
    pub vif_index: VifIndex,
    pub address: Ipv4Addr,
    pub up: bool,
    pub pim_enabled: bool,
    pub neighbors: usize,
    pub designated_router: Option<Ipv4Addr>,
    pub channels: usize,
}

impl PimCore {
    /// Hello received: add or refresh a neighbor
    ///
    /// `holdtime` defaults to [`DEFAULT_HELLO_HOLDTIME_SECS`]; 0 removes the
    /// neighbor and 0xFFFF keeps it without a liveness timer.
    pub fn neighbor_up(
        &mut self,
        interface: &str,
        address: Ipv4Addr,
        dr_priority: u32,
        holdtime: Option<u16>,
        now: Instant,
    ) -> bool {
        self.now = now;
        let holdtime = holdtime.unwrap_or(DEFAULT_HELLO_HOLDTIME_SECS);
        if holdtime == 0 {
            return self.neighbor_down(interface, address, now);
        }
        let Some(vif) = self.names.get(interface).copied() else {
            log_warning!(
                self.logger,
                Facility::Interface,
                &format!("hello from {} on unknown interface {}", address, interface)
            );
            return false;
        };
        let Some(iface) = self.interfaces.get_mut(&vif) else {
            return false;
        };
        if !iface.up || address == iface.primary_address {
            return false;
        }
        let known = iface.neighbors.contains_key(&address);
        if let Some(old) = iface.upsert_neighbor(address, dr_priority, now) {
            self.timers.cancel(old);
        }
        if holdtime != HOLDTIME_INFINITE {
            let token = self.timers.schedule(
                TimerType::NeighborExpiry { vif, neighbor: address },
                Duration::from_secs(u64::from(holdtime)),
                now,
            );
            if let Some(n) = self
                .interfaces
                .get_mut(&vif)
                .and_then(|i| i.neighbors.get_mut(&address))
            {
                n.expiry_timer = Some(token);
            }
        }
        if !known {
            log_info!(
                self.logger,
                Facility::Interface,
                &format!("{} new neighbor {} priority {}", interface, address, dr_priority)
            );
        }
        self.reelect_dr(vif);
        true
    }

    /// Neighbor went away (Hello with holdtime 0 or external notification)
    pub fn neighbor_down(&mut self, interface: &str, address: Ipv4Addr, now: Instant) -> bool {
        self.now = now;
        let Some(vif) = self.names.get(interface).copied() else {
            return false;
        };
        let removed = self
            .interfaces
            .get_mut(&vif)
            .and_then(|i| i.neighbors.remove(&address));
        let Some(neighbor) = removed else {
            return false;
        };
        if let Some(token) = neighbor.expiry_timer {
            self.timers.cancel(token);
        }
        log_info!(
            self.logger,
            Facility::Interface,
            &format!("{} neighbor {} down", interface, address)
        );
        self.reelect_dr(vif);
        true
    }

    /// Neighbor liveness timer fired
    pub(crate) fn on_neighbor_expiry(&mut self, vif: VifIndex, address: Ipv4Addr) {
        let removed = self
            .interfaces
            .get_mut(&vif)
            .and_then(|i| i.neighbors.remove(&address));
        if removed.is_none() {
            return;
        }
        log_notice!(
            self.logger,
            Facility::Interface,
            &format!("neighbor {} on vif {} expired", address, vif)
        );
        self.reelect_dr(vif);
    }

    /// Re-run DR election; a new DR changes pim_include on every channel
    fn reelect_dr(&mut self, vif: VifIndex) {
        let Some(iface) = self.interfaces.get_mut(&vif) else {
            return;
        };
        if !iface.elect_dr() {
            return;
        }
        let dr = iface.designated_router;
        let name = iface.name.clone();
        let ids = iface.channel_ids();
        log_notice!(
            self.logger,
            Facility::Interface,
            &format!("{} DR is now {}", name, dr.map_or_else(|| "none".to_string(), |a| a.to_string()))
        );

        for id in &ids {
            self.reevaluate_assert(*id);
        }
        for id in ids {
            let included = self
                .channels
                .get(&id)
                .is_some_and(|c| c.local_membership == LocalMembership::Include);
            if included {
                self.membership_forwarding(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(address: &str, dr_priority: u32) -> PimInterface {
        PimInterface::new(&InterfaceConfig {
            name: "eth0".to_string(),
            vif_index: 1,
            address: address.parse().unwrap(),
            pim_enabled: true,
            dr_priority,
            dual_active: false,
        })
    }

    #[test]
    fn test_alone_on_link_is_dr() {
        let iface = iface("10.0.0.1", DEFAULT_DR_PRIORITY);
        assert!(iface.i_am_dr());
        assert_eq!(iface.neighbor_count(), 0);
    }

    #[test]
    fn test_dr_election_priority_then_address() {
        let mut iface = iface("10.0.0.5", 1);
        let now = Instant::now();

        iface.upsert_neighbor("10.0.0.9".parse().unwrap(), 1, now);
        assert!(iface.elect_dr());
        assert_eq!(iface.designated_router, Some("10.0.0.9".parse().unwrap()));

        iface.dr_priority = 10;
        assert!(iface.elect_dr());
        assert!(iface.i_am_dr());

        iface.upsert_neighbor("10.0.0.2".parse().unwrap(), 10, now);
        assert!(!iface.elect_dr());
        assert!(iface.i_am_dr());
    }

    #[test]
    fn test_upsert_refreshes_existing() {
        let mut iface = iface("10.0.0.1", 1);
        let now = Instant::now();
        let nbr: Ipv4Addr = "10.0.0.2".parse().unwrap();

        assert!(iface.upsert_neighbor(nbr, 1, now).is_none());
        iface.neighbors.get_mut(&nbr).unwrap().expiry_timer = Some(TimerToken(4));
        assert_eq!(iface.upsert_neighbor(nbr, 7, now), Some(TimerToken(4)));
        assert_eq!(iface.neighbors[&nbr].dr_priority, 7);
        assert_eq!(iface.neighbor_count(), 1);
    }
}
