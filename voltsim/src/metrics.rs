//! Metrics collection for simulation analysis.

use hashbrown::HashMap;
use voltmesh::{NodeId, NodeRole};

/// A snapshot of network-wide protocol state at a point in time.
#[derive(Debug, Clone)]
pub struct NetSnapshot {
    pub time: f64,
    pub neighbor_counts: HashMap<NodeId, usize>,
    pub provider_counts: HashMap<NodeId, usize>,
    pub roles: HashMap<NodeId, NodeRole>,
    pub sessions_booked: HashMap<NodeId, u64>,
}

impl NetSnapshot {
    pub fn new(time: f64) -> Self {
        Self {
            time,
            neighbor_counts: HashMap::new(),
            provider_counts: HashMap::new(),
            roles: HashMap::new(),
            sessions_booked: HashMap::new(),
        }
    }

    pub fn record_node(
        &mut self,
        node_id: NodeId,
        neighbors: usize,
        providers: usize,
        role: NodeRole,
        booked: u64,
    ) {
        self.neighbor_counts.insert(node_id, neighbors);
        self.provider_counts.insert(node_id, providers);
        self.roles.insert(node_id, role);
        self.sessions_booked.insert(node_id, booked);
    }

    /// True when every node sees `expected` neighbors.
    pub fn all_discovered(&self, expected: usize) -> bool {
        !self.neighbor_counts.is_empty()
            && self.neighbor_counts.values().all(|&c| c == expected)
    }

    pub fn total_booked(&self) -> u64 {
        self.sessions_booked.values().sum()
    }

    pub fn nodes_with_role(&self, role: NodeRole) -> usize {
        self.roles.values().filter(|r| **r == role).count()
    }
}

/// Simulation metrics collected over a run.
#[derive(Debug, Clone, Default)]
pub struct SimMetrics {
    /// Frames put on the air.
    pub frames_sent: u64,
    /// Frames lost to link loss or inactive links.
    pub frames_dropped: u64,
    /// Frames handed to a node's receive entry point.
    pub frames_delivered: u64,
    /// Snapshots taken at intervals or on request.
    pub snapshots: Vec<NetSnapshot>,
}

impl SimMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_snapshot(&mut self, snapshot: NetSnapshot) {
        self.snapshots.push(snapshot);
    }

    pub fn latest_snapshot(&self) -> Option<&NetSnapshot> {
        self.snapshots.last()
    }

    /// First time every node saw `expected` neighbors.
    pub fn discovery_time(&self, expected: usize) -> Option<f64> {
        self.snapshots
            .iter()
            .find(|s| s.all_discovered(expected))
            .map(|s| s.time)
    }
}

/// Result of running a simulation.
#[derive(Debug, Clone)]
pub struct SimulationResult {
    /// Final simulation time.
    pub end_time: f64,
    pub metrics: SimMetrics,
    /// Whether the event queue ran dry before the time limit.
    pub queue_exhausted: bool,
}

impl SimulationResult {
    pub fn all_discovered(&self, expected: usize) -> bool {
        self.metrics
            .latest_snapshot()
            .is_some_and(|s| s.all_discovered(expected))
    }

    pub fn total_booked(&self) -> u64 {
        self.metrics
            .latest_snapshot()
            .map(|s| s.total_booked())
            .unwrap_or(0)
    }
}
