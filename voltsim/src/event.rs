//! Event types and ordering for the discrete event simulation.

use std::cmp::Ordering;

use voltmesh::{NodeId, Position, Velocity};

/// Unique sequence number for deterministic ordering of same-time events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Scenario actions that can be scheduled during simulation.
#[derive(Debug, Clone)]
pub enum ScenarioAction {
    /// Partition the network into isolated groups.
    Partition { groups: Vec<Vec<NodeId>> },
    /// Heal all partitions (restore full connectivity).
    HealPartition,
    /// Disable a specific link.
    DisableLink { from: NodeId, to: NodeId },
    /// Enable a specific link.
    EnableLink { from: NodeId, to: NodeId },
    /// Set loss rate on a link.
    SetLossRate { from: NodeId, to: NodeId, rate: f64 },
    /// Take a network snapshot for metrics.
    TakeSnapshot,
}

/// Events in the discrete event simulation.
#[derive(Debug, Clone)]
pub enum Event {
    /// Deliver a frame to a node.
    FrameDelivery {
        to: NodeId,
        data: Vec<u8>,
        from: NodeId,
    },
    /// Periodic protocol tick for a node.
    Tick { node: NodeId },
    /// Mobility/energy push for a node.
    MobilityUpdate {
        node: NodeId,
        position: Position,
        velocity: Velocity,
        battery_kwh: f64,
    },
    /// Execute a scenario action.
    ScenarioAction(ScenarioAction),
}

/// A scheduled event with timestamp and sequence number for ordering.
#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    /// Simulation time the event fires at, seconds.
    pub time: f64,
    /// Tie-breaker for same-time events.
    pub seq: SequenceNumber,
    pub event: Event,
}

impl ScheduledEvent {
    pub fn new(time: f64, seq: SequenceNumber, event: Event) -> Self {
        Self { time, seq, event }
    }
}

// Ordering for a min-heap (BinaryHeap is a max-heap, so comparisons are
// reversed). Time uses total ordering on the raw bits, which is exact for
// the non-NaN times the simulator produces.
impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time.total_cmp(&other.time) == Ordering::Equal && self.seq == other.seq
    }
}

impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        match other.time.total_cmp(&self.time) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}
