// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Downstream join/prune and local membership scenarios driven through the
//! public API with an explicit clock.

mod common;

use std::time::Duration;

use common::{addr, sg, star, Harness, DOWNSTREAM};
use multicast_pim::logging::Logger;
use multicast_pim::protocols::pim::{
    ChannelFlags, ChannelTimer, EncodedSource, JoinPruneGroup, Rpf, UpstreamFlags, UpstreamJoinState,
};
use multicast_pim::{JoinState, LocalMembership, OifFlags, PimAction, SourceFlags};

#[test]
fn test_join_forwards_until_expiry() {
    let mut h = Harness::new();
    let key = sg("10.1.1.1", "239.1.1.1");
    h.rpf_upstream(key);
    h.neighbor("10.0.0.2");

    assert!(h.join(key, 210));
    let id = h.core.find(DOWNSTREAM, &key).unwrap();
    assert_eq!(h.core.channel(id).unwrap().join_state, JoinState::Join);
    assert_eq!(
        h.core.timer_remaining(id, ChannelTimer::Expiry, h.now),
        Some(Duration::from_secs(210))
    );

    let actions = h.actions();
    assert!(actions.iter().any(|a| matches!(
        a,
        PimAction::AddOif { vif: 1, flags, .. } if flags.contains(OifFlags::PROTO_PIM)
    )));
    assert!(actions.contains(&PimAction::UpstreamJoinDesired { sg: key, joined: true }));
    assert!(actions.contains(&PimAction::SendJoinPrune {
        vif: 2,
        neighbor: addr("10.0.1.2"),
        sg: key,
        is_join: true,
    }));

    h.secs(209);
    assert!(h.core.find(DOWNSTREAM, &key).is_some());
    h.secs(1);
    assert!(h.core.find(DOWNSTREAM, &key).is_none());
    let actions = h.actions();
    assert!(actions.iter().any(|a| matches!(a, PimAction::DelOif { vif: 1, removed: true, .. })));
    assert!(actions.contains(&PimAction::UpstreamJoinDesired { sg: key, joined: false }));
    assert!(h.core.upstream(&key).is_none());
}

#[test]
fn test_shorter_holdtime_never_shortens_expiry() {
    let mut h = Harness::new();
    let key = sg("10.1.1.1", "239.1.1.1");
    h.rpf_upstream(key);

    h.join(key, 100);
    let id = h.core.find(DOWNSTREAM, &key).unwrap();
    h.secs(10);
    h.join(key, 50);
    assert_eq!(
        h.core.timer_remaining(id, ChannelTimer::Expiry, h.now),
        Some(Duration::from_secs(90))
    );

    h.secs(10);
    h.join(key, 200);
    assert_eq!(
        h.core.timer_remaining(id, ChannelTimer::Expiry, h.now),
        Some(Duration::from_secs(200))
    );
}

#[test]
fn test_infinite_holdtime_leaves_no_expiry() {
    let mut h = Harness::new();
    let key = sg("10.1.1.1", "239.1.1.1");
    h.rpf_upstream(key);

    h.join(key, 0xFFFF);
    let id = h.core.find(DOWNSTREAM, &key).unwrap();
    assert!(!h.core.channel(id).unwrap().has_expiry_timer());
    h.secs(100_000);
    assert_eq!(h.core.channel(id).unwrap().join_state, JoinState::Join);
}

#[test]
fn test_prune_waits_for_override_with_other_routers() {
    let mut h = Harness::new();
    let key = sg("10.1.1.1", "239.1.1.1");
    h.rpf_upstream(key);
    h.neighbor("10.0.0.2");
    h.neighbor("10.0.0.3");

    h.join(key, 210);
    h.secs(1);
    h.actions();
    assert!(h.prune(key, 210));

    let id = h.core.find(DOWNSTREAM, &key).unwrap();
    assert_eq!(h.core.channel(id).unwrap().join_state, JoinState::PrunePending);
    assert_eq!(
        h.core.timer_remaining(id, ChannelTimer::PrunePending, h.now),
        Some(Duration::from_millis(3000))
    );
    // Still forwarding while other routers may override
    assert!(h.core.upstream(&key).unwrap().channel_oil.as_ref().unwrap().contains(1));

    h.advance(Duration::from_millis(2999));
    assert!(h.core.find(DOWNSTREAM, &key).is_some());
    h.advance(Duration::from_millis(1));
    assert!(h.core.find(DOWNSTREAM, &key).is_none());

    let actions = h.actions();
    assert!(actions.contains(&PimAction::SendJoinPrune {
        vif: 1,
        neighbor: addr("10.0.0.1"),
        sg: key,
        is_join: false,
    }));
    assert!(actions.iter().any(|a| matches!(a, PimAction::DelOif { vif: 1, removed: true, .. })));
}

#[test]
fn test_prune_with_single_neighbor_is_immediate_without_echo() {
    let mut h = Harness::new();
    let key = sg("10.1.1.1", "239.1.1.1");
    h.rpf_upstream(key);
    h.neighbor("10.0.0.2");

    h.join(key, 210);
    h.prune(key, 210);
    let id = h.core.find(DOWNSTREAM, &key).unwrap();
    // Zero-delay timers still wait for the next timer run
    assert_eq!(h.core.channel(id).unwrap().join_state, JoinState::PrunePending);
    h.actions();

    assert_eq!(h.core.run_timers(h.now), 1);
    assert!(h.core.find(DOWNSTREAM, &key).is_none());
    assert!(!h
        .actions()
        .iter()
        .any(|a| matches!(a, PimAction::SendJoinPrune { vif: 1, .. })));
}

#[test]
fn test_join_overrides_pending_prune() {
    let mut h = Harness::new();
    let key = sg("10.1.1.1", "239.1.1.1");
    h.rpf_upstream(key);
    h.neighbor("10.0.0.2");
    h.neighbor("10.0.0.3");

    h.join(key, 210);
    h.prune(key, 210);
    h.secs(1);
    h.join(key, 210);

    let id = h.core.find(DOWNSTREAM, &key).unwrap();
    let ch = h.core.channel(id).unwrap();
    assert_eq!(ch.join_state, JoinState::Join);
    assert!(!ch.has_prune_pending_timer());
    h.secs(10);
    assert_eq!(h.core.channel(id).unwrap().join_state, JoinState::Join);
}

#[test]
fn test_prune_without_state_is_ignored() {
    let mut h = Harness::new();
    let key = sg("10.1.1.1", "239.1.1.1");
    assert!(!h.prune(key, 210));
    assert_eq!(h.core.channel_count(), 0);
}

#[test]
fn test_join_on_disabled_or_unknown_interface() {
    let (logger, log) = Logger::memory(32);
    let mut h = Harness::with_logger(logger);
    let key = sg("10.1.1.1", "239.1.1.1");
    assert!(!h.core.receive_join(
        "eth7",
        addr("10.0.0.2"),
        addr("10.0.0.1"),
        key,
        SourceFlags::empty(),
        210,
        h.now
    ));
    assert_eq!(h.core.channel_count(), 0);
    assert!(log.contains("unknown interface eth7"));
}

#[test]
fn test_star_g_membership_is_inherited_by_sources() {
    let mut h = Harness::new();
    let group = star("239.1.1.1");
    let key = sg("10.1.1.1", "239.1.1.1");
    h.rpf_upstream(key);

    assert!(h.core.local_membership_add(DOWNSTREAM, group, false, h.now));
    let star_id = h.core.find(DOWNSTREAM, &group).unwrap();
    assert_eq!(
        h.core.channel(star_id).unwrap().local_membership,
        LocalMembership::Include
    );

    h.core.hold_upstream(key, h.now);
    let actions = h.actions();
    assert!(actions.contains(&PimAction::AddOif {
        sg: key,
        vif: 1,
        flags: OifFlags::PROTO_STAR,
    }));
    assert_eq!(h.core.upstream(&key).unwrap().join_state, UpstreamJoinState::Joined);

    assert!(h.core.local_membership_del(DOWNSTREAM, group, h.now));
    let actions = h.actions();
    assert!(actions.contains(&PimAction::DelInheritedOif {
        sg: key,
        vif: 1,
        removed: true,
    }));
    assert!(h.core.find(DOWNSTREAM, &group).is_none());
    assert_eq!(h.core.upstream(&key).unwrap().join_state, UpstreamJoinState::NotJoined);
}

#[test]
fn test_late_star_g_membership_reaches_existing_source() {
    let mut h = Harness::new();
    let group = star("239.1.1.1");
    let key = sg("10.1.1.1", "239.1.1.1");
    h.rpf_upstream(key);
    h.core.hold_upstream(key, h.now);
    h.actions();

    h.core.local_membership_add(DOWNSTREAM, group, false, h.now);
    assert!(h.actions().contains(&PimAction::AddOif {
        sg: key,
        vif: 1,
        flags: OifFlags::PROTO_STAR,
    }));
}

#[test]
fn test_source_membership_adds_igmp_flag() {
    let mut h = Harness::new();
    let key = sg("10.1.1.1", "239.1.1.1");
    h.rpf_upstream(key);

    h.core.local_membership_add(DOWNSTREAM, key, false, h.now);
    assert!(h.actions().contains(&PimAction::AddOif {
        sg: key,
        vif: 1,
        flags: OifFlags::PROTO_IGMP,
    }));

    // A join on top keeps the interface when the receiver leaves
    h.join(key, 210);
    h.core.local_membership_del(DOWNSTREAM, key, h.now);
    let oil = h.core.upstream(&key).unwrap().channel_oil.clone().unwrap();
    assert_eq!(oil.flags(1), OifFlags::PROTO_PIM);
    let id = h.core.find(DOWNSTREAM, &key).unwrap();
    assert_eq!(h.core.channel(id).unwrap().local_membership, LocalMembership::NoInfo);
}

#[test]
fn test_ssm_star_g_membership_creates_nothing() {
    let mut h = Harness::new();
    assert!(h.core.local_membership_add(DOWNSTREAM, star("232.1.1.1"), false, h.now));
    assert_eq!(h.core.channel_count(), 0);
}

#[test]
fn test_membership_clear_keeps_joined_channels() {
    let mut h = Harness::new();
    let joined = sg("10.1.1.1", "239.1.1.1");
    let local = sg("10.1.1.2", "239.1.1.1");
    h.rpf_upstream(joined);
    h.rpf_upstream(local);
    h.join(joined, 210);
    h.core.local_membership_add(DOWNSTREAM, joined, false, h.now);
    h.core.local_membership_add(DOWNSTREAM, local, false, h.now);

    assert!(h.core.membership_clear(DOWNSTREAM, h.now));
    assert!(h.core.find(DOWNSTREAM, &local).is_none());
    let id = h.core.find(DOWNSTREAM, &joined).unwrap();
    let ch = h.core.channel(id).unwrap();
    assert_eq!(ch.local_membership, LocalMembership::NoInfo);
    assert_eq!(ch.join_state, JoinState::Join);
}

#[test]
fn test_interface_down_removes_everything() {
    let mut h = Harness::new();
    let a = sg("10.1.1.1", "239.1.1.1");
    let b = sg("10.1.1.2", "239.1.1.2");
    h.rpf_upstream(a);
    h.rpf_upstream(b);
    h.neighbor("10.0.0.2");
    h.join(a, 210);
    h.core.local_membership_add(DOWNSTREAM, b, false, h.now);
    assert_eq!(h.core.channels_on(DOWNSTREAM).len(), 2);

    assert!(h.core.interface_state_change(DOWNSTREAM, false, h.now));
    assert!(h.core.channels_on(DOWNSTREAM).is_empty());
    assert_eq!(h.core.interface(DOWNSTREAM).unwrap().neighbor_count(), 0);
    assert!(h.core.upstream(&a).is_none());
    assert!(h.core.upstream(&b).is_none());

    // Nothing is accepted until the interface comes back
    assert!(!h.join(a, 210));
    assert!(h.core.interface_state_change(DOWNSTREAM, true, h.now));
    assert!(h.join(a, 210));
}

fn jp_group(group: &str, joins: Vec<EncodedSource>, prunes: Vec<EncodedSource>) -> JoinPruneGroup {
    JoinPruneGroup {
        group: addr(group),
        joins,
        prunes,
    }
}

fn wildcard() -> EncodedSource {
    EncodedSource {
        source: addr("10.9.9.9"),
        flags: SourceFlags::RPT | SourceFlags::WILDCARD,
    }
}

fn rpt(source: &str) -> EncodedSource {
    EncodedSource {
        source: addr(source),
        flags: SourceFlags::RPT,
    }
}

#[test]
fn test_star_g_join_refreshes_or_cancels_rpt_prunes() {
    let mut h = Harness::new();
    h.neighbor("10.0.0.2");
    let group = star("239.1.1.1");
    let kept = sg("10.1.1.1", "239.1.1.1");
    let dropped = sg("10.1.1.2", "239.1.1.1");
    let nbr = addr("10.0.0.2");
    let me = addr("10.0.0.1");

    let first = vec![jp_group(
        "239.1.1.1",
        vec![wildcard()],
        vec![rpt("10.1.1.1"), rpt("10.1.1.2")],
    )];
    assert!(h.core.receive_join_prune(DOWNSTREAM, nbr, me, 210, &first, h.now));
    assert!(!h.core.batch_in_progress());
    // Single neighbor: the prune-pending timer fires on the next run
    h.core.run_timers(h.now);
    let star_id = h.core.find(DOWNSTREAM, &group).unwrap();
    for key in [kept, dropped] {
        let id = h.core.find(DOWNSTREAM, &key).unwrap();
        let ch = h.core.channel(id).unwrap();
        assert_eq!(ch.join_state, JoinState::Prune);
        assert!(ch.flags.contains(ChannelFlags::S_G_RPT));
        assert_eq!(ch.parent, Some(star_id));
    }

    h.secs(60);
    let second = vec![jp_group("239.1.1.1", vec![wildcard()], vec![rpt("10.1.1.1")])];
    assert!(h.core.receive_join_prune(DOWNSTREAM, nbr, me, 210, &second, h.now));

    let kept_id = h.core.find(DOWNSTREAM, &kept).unwrap();
    assert_eq!(h.core.channel(kept_id).unwrap().join_state, JoinState::Prune);
    assert_eq!(
        h.core.timer_remaining(kept_id, ChannelTimer::Expiry, h.now),
        Some(Duration::from_secs(210))
    );
    assert!(h.core.find(DOWNSTREAM, &dropped).is_none());
    assert_eq!(h.core.channel(star_id).unwrap().children.len(), 1);
}

#[test]
fn test_join_prune_from_stranger_is_dropped() {
    let mut h = Harness::new();
    let groups = vec![jp_group("239.1.1.1", vec![wildcard()], vec![])];
    assert!(!h
        .core
        .receive_join_prune(DOWNSTREAM, addr("10.0.0.9"), addr("10.0.0.1"), 210, &groups, h.now));
    assert_eq!(h.core.channel_count(), 0);
}

#[test]
fn test_join_for_other_upstream_suppresses_ours() {
    let mut h = Harness::new();
    let key = sg("10.1.1.1", "239.1.1.1");
    h.rpf_upstream(key);
    h.core.local_membership_add(DOWNSTREAM, key, false, h.now);
    h.actions();

    // Seen on the upstream LAN, addressed to our RPF neighbor
    assert!(h.core.receive_join(
        "eth1",
        addr("10.0.1.3"),
        addr("10.0.1.2"),
        key,
        SourceFlags::empty(),
        210,
        h.now
    ));
    assert_eq!(
        h.actions(),
        vec![PimAction::JoinSuppress {
            sg: key,
            rpf: addr("10.0.1.2"),
            holdtime: 210,
        }]
    );
    assert!(h.core.find("eth1", &key).is_none());
}

#[test]
fn test_prune_for_other_upstream_triggers_override() {
    let mut h = Harness::new();
    let key = sg("10.1.1.1", "239.1.1.1");
    h.rpf_upstream(key);
    h.core.local_membership_add(DOWNSTREAM, key, false, h.now);
    h.actions();

    assert!(h.core.receive_prune(
        "eth1",
        addr("10.0.1.2"),
        key,
        SourceFlags::empty(),
        210,
        h.now
    ));
    assert_eq!(
        h.actions(),
        vec![PimAction::JoinTimerOverride {
            sg: key,
            rpf: addr("10.0.1.2"),
        }]
    );
}

#[test]
fn test_membership_del_drops_last_hop_origin() {
    let mut h = Harness::new();
    let group = star("239.1.1.1");
    let first = sg("10.1.1.1", "239.1.1.1");
    let second = sg("10.1.1.2", "239.1.1.1");
    for key in [group, first, second] {
        h.rpf_upstream(key);
    }
    h.core.local_membership_add(DOWNSTREAM, group, false, h.now);
    h.join(group, 210);

    // Receivers present: a source join takes the last-hop reference
    h.join(first, 210);
    assert!(h.core.upstream(&first).unwrap().flags.contains(UpstreamFlags::SRC_LHR));

    assert!(h.core.local_membership_del(DOWNSTREAM, group, h.now));
    let star_id = h.core.find(DOWNSTREAM, &group).unwrap();
    let ch = h.core.channel(star_id).unwrap();
    assert_eq!(ch.local_membership, LocalMembership::NoInfo);
    assert!(!ch.flags.contains(ChannelFlags::PROTO_IGMP));
    assert!(ch.flags.contains(ChannelFlags::PROTO_PIM));
    let up = h.core.upstream(&group).unwrap();
    assert!(!up.flags.intersects(UpstreamFlags::CAN_BE_LHR));
    assert!(up.flags.contains(UpstreamFlags::SRC_PIM));

    h.join(second, 210);
    assert!(!h.core.upstream(&second).unwrap().flags.contains(UpstreamFlags::SRC_LHR));
}

#[test]
fn test_rpt_join_without_state_enters_join() {
    let mut h = Harness::new();
    let key = sg("10.1.1.1", "239.1.1.1");

    assert!(h.core.receive_join(
        DOWNSTREAM,
        addr("10.0.0.2"),
        addr("10.0.0.1"),
        key,
        SourceFlags::RPT,
        60,
        h.now
    ));
    let id = h.core.find(DOWNSTREAM, &key).unwrap();
    let ch = h.core.channel(id).unwrap();
    assert_eq!(ch.join_state, JoinState::Join);
    assert!(ch.flags.contains(ChannelFlags::S_G_RPT));
    assert_eq!(
        h.core.timer_remaining(id, ChannelTimer::Expiry, h.now),
        Some(Duration::from_secs(60))
    );
    // A shadow never forwards by itself
    assert!(!h.actions().iter().any(|a| matches!(a, PimAction::AddOif { .. })));

    h.secs(60);
    assert!(h.core.find(DOWNSTREAM, &key).is_none());
    assert!(h.core.upstream(&key).is_none());
}

#[test]
fn test_rpt_prune_pending_expiry_prunes_toward_rp() {
    let mut h = Harness::new();
    h.neighbor("10.0.0.2");
    let group = star("239.1.1.1");
    let key = sg("10.1.1.1", "239.1.1.1");
    h.rpf_upstream(group);
    // The source sits behind a different upstream router than the RP
    let rpf = Rpf {
        interface: Some(2),
        neighbor: addr("10.0.1.3"),
        metric_preference: 110,
        route_metric: 10,
    };
    assert!(h.core.set_rpf(key, rpf, h.now));

    let join = vec![jp_group("239.1.1.1", vec![wildcard()], vec![])];
    assert!(h
        .core
        .receive_join_prune(DOWNSTREAM, addr("10.0.0.2"), addr("10.0.0.1"), 210, &join, h.now));
    h.core.hold_upstream(key, h.now);
    assert!(h.actions().contains(&PimAction::AddOif {
        sg: key,
        vif: 1,
        flags: OifFlags::PROTO_STAR,
    }));

    assert!(h
        .core
        .receive_prune(DOWNSTREAM, addr("10.0.0.1"), key, SourceFlags::RPT, 210, h.now));
    let id = h.core.find(DOWNSTREAM, &key).unwrap();
    assert_eq!(h.core.channel(id).unwrap().join_state, JoinState::PrunePending);
    h.actions();

    // Single neighbor: no override window
    h.core.run_timers(h.now);
    let ch = h.core.channel(id).unwrap();
    assert_eq!(ch.join_state, JoinState::Prune);
    assert!(ch.has_expiry_timer());

    let actions = h.actions();
    assert!(actions.contains(&PimAction::SendJoinPrune {
        vif: 2,
        neighbor: addr("10.0.1.2"),
        sg: key,
        is_join: false,
    }));
    assert!(actions.iter().any(|a| matches!(
        a,
        PimAction::DelOif { sg, vif: 1, flags, removed: true }
            if *sg == key && flags.contains(OifFlags::PROTO_STAR)
    )));
    assert!(actions.contains(&PimAction::MrouteInstall { sg: key, iif: 2 }));
}

#[test]
fn test_star_join_expiry_clears_sources_before_own_oif() {
    let mut h = Harness::new();
    let group = star("239.1.1.1");
    let key = sg("10.1.1.1", "239.1.1.1");
    h.rpf_upstream(group);
    h.rpf_upstream(key);
    h.join(group, 60);
    h.core.hold_upstream(key, h.now);
    h.actions();

    h.secs(60);
    assert!(h.core.find(DOWNSTREAM, &group).is_none());
    let actions = h.actions();
    let position = |wanted: &PimAction| actions.iter().position(|a| a == wanted);
    let inherited = position(&PimAction::DelInheritedOif {
        sg: key,
        vif: 1,
        removed: true,
    })
    .unwrap();
    let own = actions
        .iter()
        .position(|a| matches!(a, PimAction::DelOif { sg, vif: 1, .. } if *sg == group))
        .unwrap();
    let desired = position(&PimAction::UpstreamJoinDesired {
        sg: group,
        joined: false,
    })
    .unwrap();
    assert!(inherited < own);
    assert!(own < desired);
}
