//! Per-node protocol counters.
//!
//! Counters only, no I/O: the orchestrator samples these through
//! `Node::metrics()`.

use crate::wire::MsgType;

/// One counter per message kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KindCounters([u64; 10]);

impl KindCounters {
    fn index(kind: MsgType) -> usize {
        kind as u16 as usize - 1
    }

    pub fn record(&mut self, kind: MsgType) {
        self.0[Self::index(kind)] += 1;
    }

    pub fn get(&self, kind: MsgType) -> u64 {
        self.0[Self::index(kind)]
    }

    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }
}

/// Cumulative protocol metrics for one node.
#[derive(Clone, Debug, Default)]
pub struct NodeMetrics {
    /// Frames originated by this node, by kind.
    pub sent: KindCounters,
    /// Frames processed by this node, by kind.
    pub received: KindCounters,
    /// Frames re-emitted by the MPR forwarding path, by kind.
    pub forwarded: KindCounters,

    /// Frames dropped because they failed to decode.
    pub dropped_malformed: u64,
    /// Frames dropped by the dedup cache.
    pub dropped_duplicate: u64,
    /// Frames ignored because they addressed another node or session.
    pub dropped_unrelated: u64,

    /// Sessions that reached ALLOCATED.
    pub sessions_booked: u64,
    /// Sessions that ended in FAILED, any reason.
    pub sessions_failed: u64,
    /// JOIN_ACCEPT deadline expiries (consumer side).
    pub accept_timeouts: u64,
    /// ACK deadline expiries (provider side).
    pub ack_timeouts: u64,
    /// ACKACK deadline expiries (consumer side).
    pub ackack_timeouts: u64,
    /// Sessions cancelled by a role switch.
    pub role_switch_cancellations: u64,
    /// JOIN_OFFERs refused for capacity.
    pub capacity_refusals: u64,
    /// Times a member left its platoon after missed beacons.
    pub beacon_losses: u64,

    /// MPR set recomputations.
    pub mpr_recomputations: u64,
    /// Neighbors pruned for silence.
    pub neighbors_pruned: u64,
    /// Providers pruned for silence.
    pub providers_pruned: u64,
}
