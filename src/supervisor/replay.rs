// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Scenario replay on logical time
//!
//! A scenario is a config plus a list of timestamped events. Time only
//! moves when the driver says so: before each step every timer due at or
//! before the step fires, in deadline order, and after the last step the
//! clock runs on to `end_ms` (or until the queue is empty, bounded by
//! [`MAX_DRAIN`]).

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::CoreConfig;
use crate::logging::{Facility, Logger};
use crate::protocols::pim::{PimAction, PimCore, PimEvent};
use crate::{log_debug, log_info};

/// Upper bound on timer rounds run after the last step without `end_ms`
pub const MAX_DRAIN: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioStep {
    /// Milliseconds since the scenario start
    pub at_ms: u64,
    pub event: PimEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub config: CoreConfig,
    #[serde(default)]
    pub steps: Vec<ScenarioStep>,
    /// Stop the clock here; None drains the timer queue
    #[serde(default)]
    pub end_ms: Option<u64>,
}

impl Scenario {
    pub fn parse(content: &str) -> Result<Self> {
        json5::from_str(content).context("invalid scenario")
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading scenario {}", path.display()))?;
        Self::parse(&content)
    }
}

/// One action with the logical time it was produced at
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionRecord {
    pub at_ms: u64,
    #[serde(flatten)]
    pub action: PimAction,
}

/// Run `scenario` and return every action it produced, in order
pub fn run_scenario(scenario: Scenario, logger: Logger) -> Result<Vec<ActionRecord>> {
    scenario.config.validate()?;
    let mut last = 0;
    for (index, step) in scenario.steps.iter().enumerate() {
        if step.at_ms < last {
            bail!("step {} at {} ms goes back in time (previous {} ms)", index, step.at_ms, last);
        }
        last = step.at_ms;
    }
    if let Some(end) = scenario.end_ms {
        if end < last {
            bail!("end_ms {} is before the last step at {} ms", end, last);
        }
    }

    let start = Instant::now();
    let mut replay = Replay {
        core: PimCore::new(scenario.config, logger.clone(), start),
        start,
        records: Vec::new(),
    };

    for step in scenario.steps {
        let at = start + Duration::from_millis(step.at_ms);
        replay.advance_to(at);
        let name = step.event.name();
        let acted = replay.core.handle_event(step.event, at);
        log_debug!(
            logger,
            Facility::Supervisor,
            &format!("{} ms {} {}", step.at_ms, name, if acted { "applied" } else { "ignored" })
        );
        replay.collect(at);
    }

    match scenario.end_ms {
        Some(end) => replay.advance_to(start + Duration::from_millis(end)),
        None => replay.drain(),
    }
    log_info!(
        logger,
        Facility::Supervisor,
        &format!(
            "replay done: {} actions, {} channels left",
            replay.records.len(),
            replay.core.channel_count()
        )
    );
    Ok(replay.records)
}

struct Replay {
    core: PimCore,
    start: Instant,
    records: Vec<ActionRecord>,
}

impl Replay {
    /// Fire every timer due at or before `at`, each at its own deadline
    fn advance_to(&mut self, at: Instant) {
        while let Some(deadline) = self.core.next_deadline() {
            if deadline > at {
                break;
            }
            self.core.run_timers(deadline);
            self.collect(deadline);
        }
    }

    fn drain(&mut self) {
        for _ in 0..MAX_DRAIN {
            let Some(deadline) = self.core.next_deadline() else {
                return;
            };
            self.core.run_timers(deadline);
            self.collect(deadline);
        }
    }

    fn collect(&mut self, at: Instant) {
        let at_ms = at.saturating_duration_since(self.start).as_millis() as u64;
        self.records
            .extend(self.core.take_actions().into_iter().map(|action| ActionRecord { at_ms, action }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"{
        config: {
            interfaces: [
                { name: "eth0", vif_index: 1, address: "10.0.0.1" },
                { name: "eth1", vif_index: 2, address: "10.0.1.1" },
            ],
        },
        steps: [
            { at_ms: 0, event: { type: "set_rpf", sg: { source: "10.1.1.1", group: "239.1.1.1" },
                                 interface: "eth1", neighbor: "10.0.1.2" } },
            { at_ms: 0, event: { type: "neighbor_up", interface: "eth0", address: "10.0.0.2",
                                 holdtime: 65535 } },
            { at_ms: 10, event: { type: "join", interface: "eth0", neighbor: "10.0.0.2",
                                  upstream: "10.0.0.1",
                                  sg: { source: "10.1.1.1", group: "239.1.1.1" }, holdtime: 5 } },
        ],
    }"#;

    #[test]
    fn test_join_then_expiry() {
        let scenario = Scenario::parse(SCENARIO).unwrap();
        let records = run_scenario(scenario, Logger::disabled()).unwrap();

        let add = records
            .iter()
            .find(|r| matches!(r.action, PimAction::AddOif { vif: 1, .. }))
            .expect("join adds eth0");
        assert_eq!(add.at_ms, 10);

        let del = records
            .iter()
            .find(|r| matches!(r.action, PimAction::DelOif { vif: 1, removed: true, .. }))
            .expect("expiry removes eth0");
        assert_eq!(del.at_ms, 5010);
    }

    #[test]
    fn test_end_ms_stops_the_clock() {
        let mut scenario = Scenario::parse(SCENARIO).unwrap();
        scenario.end_ms = Some(1000);
        let records = run_scenario(scenario, Logger::disabled()).unwrap();
        assert!(records.iter().all(|r| r.at_ms <= 1000));
        assert!(!records
            .iter()
            .any(|r| matches!(r.action, PimAction::DelOif { vif: 1, .. })));
    }

    #[test]
    fn test_steps_must_not_go_back() {
        let mut scenario = Scenario::parse(SCENARIO).unwrap();
        scenario.steps[1].at_ms = 20;
        assert!(run_scenario(scenario, Logger::disabled()).is_err());
    }

    #[test]
    fn test_record_serializes_flat() {
        let record = ActionRecord {
            at_ms: 7,
            action: PimAction::MrouteRemove {
                sg: crate::protocols::pim::SourceGroup::star_g("239.1.1.1".parse().unwrap()),
            },
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["at_ms"], 7);
        assert_eq!(value["action"], "mroute_remove");
    }
}
