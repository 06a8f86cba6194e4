// SPDX-License-Identifier: Apache-2.0 OR MIT
//! The tokio event loop on paused time.

mod common;

use std::time::Duration;

use common::{addr, config, sg, DOWNSTREAM};
use multicast_pim::logging::Logger;
use multicast_pim::supervisor::event_loop_with_channel;
use multicast_pim::{PimAction, PimCore, PimEvent};

fn core() -> PimCore {
    PimCore::new(config(), Logger::disabled(), tokio::time::Instant::now().into_std())
}

fn setup_events() -> Vec<PimEvent> {
    let key = sg("10.1.1.1", "239.1.1.1");
    vec![
        PimEvent::SetRpf {
            sg: key,
            interface: Some("eth1".to_string()),
            neighbor: addr("10.0.1.2"),
            metric_preference: 110,
            route_metric: 20,
        },
        PimEvent::NeighborUp {
            interface: DOWNSTREAM.to_string(),
            address: addr("10.0.0.2"),
            dr_priority: 1,
            holdtime: Some(0xFFFF),
        },
        PimEvent::Join {
            interface: DOWNSTREAM.to_string(),
            neighbor: addr("10.0.0.2"),
            upstream: addr("10.0.0.1"),
            sg: key,
            flags: Default::default(),
            holdtime: 5,
        },
    ]
}

#[tokio::test(start_paused = true)]
async fn test_join_forwards_until_holdtime_runs_out() {
    let (tx, mut rx, event_loop) = event_loop_with_channel(core(), Logger::disabled());
    let handle = tokio::spawn(event_loop.run());

    for event in setup_events() {
        tx.send(event).await.unwrap();
    }
    tokio::time::sleep(Duration::from_secs(6)).await;
    drop(tx);
    let (core, stats) = handle.await.unwrap();

    let mut actions = Vec::new();
    while let Ok(action) = rx.try_recv() {
        actions.push(action);
    }
    let added = actions
        .iter()
        .position(|a| matches!(a, PimAction::AddOif { vif: 1, .. }))
        .expect("join adds the downstream interface");
    let removed = actions
        .iter()
        .position(|a| matches!(a, PimAction::DelOif { vif: 1, removed: true, .. }))
        .expect("expiry removes it again");
    assert!(added < removed);

    assert_eq!(stats.events, 3);
    assert_eq!(stats.rejected, 0);
    assert!(stats.timers_fired >= 1);
    assert_eq!(stats.actions, actions.len() as u64);
    assert_eq!(core.channel_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_events_are_counted() {
    let (tx, _rx, event_loop) = event_loop_with_channel(core(), Logger::disabled());
    let handle = tokio::spawn(event_loop.run());

    tx.send(PimEvent::MembershipClear {
        interface: "eth9".to_string(),
    })
    .await
    .unwrap();
    tx.send(PimEvent::ReleaseUpstream {
        sg: sg("10.1.1.1", "239.1.1.1"),
    })
    .await
    .unwrap();
    drop(tx);

    let (_, stats) = handle.await.unwrap();
    assert_eq!(stats.events, 2);
    assert_eq!(stats.rejected, 2);
}
