// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Runtime around the PIM core
//!
//! The core itself is synchronous. [`EventLoop`] owns it inside a tokio
//! task: events arrive on an mpsc channel, timer expiries are awaited with
//! `sleep_until` on the queue's next deadline, and both are processed one
//! at a time. Actions produced by each step are handed to the adapters
//! before the next step starts.

pub mod replay;
pub mod timer_manager;

pub use replay::{run_scenario, ActionRecord, Scenario, ScenarioStep};
pub use timer_manager::TimerQueue;

use std::net::Ipv4Addr;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::logging::{Facility, Logger};
use crate::protocols::pim::{
    AssertMetric, JoinPruneSender, OifFlags, OilAdapter, PimAction, PimCore, PimEvent,
    SourceGroup, VifIndex,
};
use crate::{log_debug, log_info};

/// Default capacity of the event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Counters reported when the loop exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct LoopStats {
    pub events: u64,
    pub rejected: u64,
    pub timers_fired: u64,
    pub actions: u64,
}

/// Serializes events and timer expiries for one [`PimCore`]
pub struct EventLoop<O: OilAdapter, J: JoinPruneSender> {
    core: PimCore,
    events: mpsc::Receiver<PimEvent>,
    oil: O,
    jp: J,
    logger: Logger,
    stats: LoopStats,
}

impl<O: OilAdapter, J: JoinPruneSender> EventLoop<O, J> {
    pub fn new(core: PimCore, events: mpsc::Receiver<PimEvent>, oil: O, jp: J, logger: Logger) -> Self {
        Self {
            core,
            events,
            oil,
            jp,
            logger,
            stats: LoopStats::default(),
        }
    }

    /// Run until the event channel closes; returns the core and counters
    pub async fn run(mut self) -> (PimCore, LoopStats) {
        log_info!(self.logger, Facility::Supervisor, "event loop started");
        loop {
            let deadline = self.core.next_deadline().map(Instant::from_std);
            let sleep = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.process_event(event),
                    None => break,
                },
                _ = sleep => self.process_timers(),
            }
        }
        log_info!(
            self.logger,
            Facility::Supervisor,
            &format!(
                "event loop stopped: {} events, {} timers, {} actions",
                self.stats.events, self.stats.timers_fired, self.stats.actions
            )
        );
        (self.core, self.stats)
    }

    fn process_event(&mut self, event: PimEvent) {
        let now = Instant::now().into_std();
        let name = event.name();
        // Expiries due before the event are handled first
        self.process_due(now);
        self.stats.events += 1;
        if !self.core.handle_event(event, now) {
            self.stats.rejected += 1;
            log_debug!(
                self.logger,
                Facility::Supervisor,
                &format!("{} event not acted on", name)
            );
        }
        self.flush();
    }

    fn process_timers(&mut self) {
        let now = Instant::now().into_std();
        self.process_due(now);
    }

    fn process_due(&mut self, now: std::time::Instant) {
        let fired = self.core.run_timers(now);
        self.stats.timers_fired += fired as u64;
        self.flush();
    }

    fn flush(&mut self) {
        let delivered = self.core.dispatch(&mut self.oil, &mut self.jp);
        self.stats.actions += delivered as u64;
    }
}

/// Adapter pair that forwards every action into a channel
///
/// One value can serve as both the OIL adapter and the Join/Prune sender;
/// clone it to get the second half.
#[derive(Debug, Clone)]
pub struct ActionForwarder {
    tx: mpsc::UnboundedSender<PimAction>,
}

impl ActionForwarder {
    pub fn new(tx: mpsc::UnboundedSender<PimAction>) -> Self {
        Self { tx }
    }

    fn forward(&self, action: PimAction) {
        // The receiver going away only means nobody is listening anymore
        let _ = self.tx.send(action);
    }
}

impl OilAdapter for ActionForwarder {
    fn add_oif(&mut self, sg: SourceGroup, vif: VifIndex, flags: OifFlags) {
        self.forward(PimAction::AddOif { sg, vif, flags });
    }

    fn del_oif(&mut self, sg: SourceGroup, vif: VifIndex, flags: OifFlags, removed: bool) {
        self.forward(PimAction::DelOif {
            sg,
            vif,
            flags,
            removed,
        });
    }

    fn del_inherited_oif(&mut self, sg: SourceGroup, vif: VifIndex, removed: bool) {
        self.forward(PimAction::DelInheritedOif { sg, vif, removed });
    }

    fn mroute_install(&mut self, sg: SourceGroup, iif: VifIndex) {
        self.forward(PimAction::MrouteInstall { sg, iif });
    }

    fn mroute_remove(&mut self, sg: SourceGroup) {
        self.forward(PimAction::MrouteRemove { sg });
    }
}

impl JoinPruneSender for ActionForwarder {
    fn send_join_prune(&mut self, vif: VifIndex, neighbor: Ipv4Addr, sg: SourceGroup, is_join: bool) {
        self.forward(PimAction::SendJoinPrune {
            vif,
            neighbor,
            sg,
            is_join,
        });
    }

    fn update_join_desired(&mut self, sg: SourceGroup, joined: bool) {
        self.forward(PimAction::UpstreamJoinDesired { sg, joined });
    }

    fn join_suppress(&mut self, sg: SourceGroup, rpf: Ipv4Addr, holdtime: u16) {
        self.forward(PimAction::JoinSuppress { sg, rpf, holdtime });
    }

    fn join_timer_override(&mut self, sg: SourceGroup, rpf: Ipv4Addr) {
        self.forward(PimAction::JoinTimerOverride { sg, rpf });
    }

    fn send_assert(&mut self, vif: VifIndex, sg: SourceGroup, metric: AssertMetric) {
        self.forward(PimAction::SendAssert { vif, sg, metric });
    }

    fn send_assert_cancel(&mut self, vif: VifIndex, sg: SourceGroup, metric: AssertMetric) {
        self.forward(PimAction::SendAssertCancel { vif, sg, metric });
    }

    fn mlag_local_add(&mut self, sg: SourceGroup) {
        self.forward(PimAction::MlagLocalAdd { sg });
    }

    fn mlag_local_del(&mut self, sg: SourceGroup) {
        self.forward(PimAction::MlagLocalDel { sg });
    }
}

/// Build a loop whose actions come out of the returned receiver
pub fn event_loop_with_channel(
    core: PimCore,
    logger: Logger,
) -> (
    mpsc::Sender<PimEvent>,
    mpsc::UnboundedReceiver<PimAction>,
    EventLoop<ActionForwarder, ActionForwarder>,
) {
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (action_tx, action_rx) = mpsc::unbounded_channel();
    let forwarder = ActionForwarder::new(action_tx);
    let event_loop = EventLoop::new(core, event_rx, forwarder.clone(), forwarder, logger);
    (event_tx, action_rx, event_loop)
}
