// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Counters for the PIM core.
//!
//! Exported through whatever `metrics` recorder the binary installs; with
//! none installed every call is a no-op.

use metrics::{counter, describe_counter, describe_gauge, gauge};

use super::assert::AssertState;
use super::ifchannel::JoinState;

pub fn describe_metrics() {
    describe_counter!("pim_ifchannels_created_total", "Interface channels created");
    describe_counter!("pim_ifchannels_deleted_total", "Interface channels deleted");
    describe_gauge!("pim_ifchannels", "Interface channels currently present");
    describe_counter!("pim_upstreams_created_total", "Upstream entries created");
    describe_counter!("pim_upstreams_deleted_total", "Upstream entries deleted");
    describe_gauge!("pim_upstreams", "Upstream entries currently present");
    describe_counter!("pim_join_transitions_total", "Downstream join state transitions by new state");
    describe_counter!("pim_assert_transitions_total", "Assert state transitions by new state");
    describe_counter!("pim_oil_added_total", "OIF flag additions");
    describe_counter!("pim_oil_removed_total", "OIF flag removals");
}

pub(crate) fn channel_created() {
    counter!("pim_ifchannels_created_total").increment(1);
    gauge!("pim_ifchannels").increment(1.0);
}

pub(crate) fn channel_deleted() {
    counter!("pim_ifchannels_deleted_total").increment(1);
    gauge!("pim_ifchannels").decrement(1.0);
}

pub(crate) fn upstream_created() {
    counter!("pim_upstreams_created_total").increment(1);
    gauge!("pim_upstreams").increment(1.0);
}

pub(crate) fn upstream_deleted() {
    counter!("pim_upstreams_deleted_total").increment(1);
    gauge!("pim_upstreams").decrement(1.0);
}

pub(crate) fn join_transition(state: JoinState) {
    counter!("pim_join_transitions_total", "state" => state.as_str()).increment(1);
}

pub(crate) fn assert_transition(state: AssertState) {
    counter!("pim_assert_transitions_total", "state" => state.as_str()).increment(1);
}

pub(crate) fn oif_added() {
    counter!("pim_oil_added_total").increment(1);
}

pub(crate) fn oif_removed() {
    counter!("pim_oil_removed_total").increment(1);
}
