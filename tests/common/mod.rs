// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Shared fixtures for the integration tests
#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use multicast_pim::logging::Logger;
use multicast_pim::protocols::pim::Rpf;
use multicast_pim::{CoreConfig, InterfaceConfig, PimAction, PimCore, SourceGroup};

pub const DOWNSTREAM: &str = "eth0";
pub const UPSTREAM: &str = "eth1";
pub const INFINITE: Option<u16> = Some(0xFFFF);

pub fn addr(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

pub fn sg(s: &str, g: &str) -> SourceGroup {
    SourceGroup::new(addr(s), addr(g)).unwrap()
}

pub fn star(g: &str) -> SourceGroup {
    SourceGroup::star_g(addr(g))
}

pub fn config() -> CoreConfig {
    let mut config = CoreConfig::default();
    for (name, vif, address) in [(DOWNSTREAM, 1, "10.0.0.1"), (UPSTREAM, 2, "10.0.1.1")] {
        config.interfaces.push(InterfaceConfig {
            name: name.to_string(),
            vif_index: vif,
            address: addr(address),
            pim_enabled: true,
            dr_priority: 1,
            dual_active: false,
        });
    }
    config
}

/// A core plus a movable clock
pub struct Harness {
    pub core: PimCore,
    pub start: Instant,
    pub now: Instant,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_logger(Logger::disabled())
    }

    pub fn with_logger(logger: Logger) -> Self {
        let start = Instant::now();
        Self {
            core: PimCore::new(config(), logger, start),
            start,
            now: start,
        }
    }

    /// Move the clock forward and fire whatever came due
    pub fn advance(&mut self, by: Duration) -> usize {
        self.now += by;
        self.core.run_timers(self.now)
    }

    pub fn secs(&mut self, secs: u64) -> usize {
        self.advance(Duration::from_secs(secs))
    }

    /// RPF of `key` points out of the upstream interface to 10.0.1.2
    pub fn rpf_upstream(&mut self, key: SourceGroup) {
        let rpf = Rpf {
            interface: Some(2),
            neighbor: addr("10.0.1.2"),
            metric_preference: 110,
            route_metric: 20,
        };
        assert!(self.core.set_rpf(key, rpf, self.now));
    }

    pub fn neighbor(&mut self, address: &str) {
        assert!(self
            .core
            .neighbor_up(DOWNSTREAM, addr(address), 1, INFINITE, self.now));
    }

    pub fn join(&mut self, key: SourceGroup, holdtime: u16) -> bool {
        self.core.receive_join(
            DOWNSTREAM,
            addr("10.0.0.2"),
            addr("10.0.0.1"),
            key,
            Default::default(),
            holdtime,
            self.now,
        )
    }

    pub fn prune(&mut self, key: SourceGroup, holdtime: u16) -> bool {
        self.core
            .receive_prune(DOWNSTREAM, addr("10.0.0.1"), key, Default::default(), holdtime, self.now)
    }

    pub fn actions(&mut self) -> Vec<PimAction> {
        self.core.take_actions()
    }
}
