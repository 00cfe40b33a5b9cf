//! Scenario builder: quick network setups for tests and experiments.

use voltmesh::context::NodeState;
use voltmesh::{NodeId, NodeRole, Position, ProtocolConfig};

use crate::node::SimNode;
use crate::sim::Simulator;
use crate::topology::Topology;

enum TopologyKind {
    FullyConnected,
    Chain,
    Highway { spacing_m: f64, range_m: f64 },
}

/// Builds a simulator with a line of vehicles and optional hubs.
pub struct ScenarioBuilder {
    vehicle_count: usize,
    seed: u64,
    topology: TopologyKind,
    loss_rate: f64,
    snapshot_interval: Option<f64>,
    config: ProtocolConfig,
    providers: usize,
    needy: usize,
    rreh_positions: Vec<Position>,
    destination: Option<Position>,
}

impl ScenarioBuilder {
    pub fn new(vehicle_count: usize) -> Self {
        Self {
            vehicle_count,
            seed: 0,
            topology: TopologyKind::FullyConnected,
            loss_rate: 0.0,
            snapshot_interval: None,
            config: ProtocolConfig::default(),
            providers: 0,
            needy: 0,
            rreh_positions: Vec::new(),
            destination: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_config(mut self, config: ProtocolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn fully_connected(mut self) -> Self {
        self.topology = TopologyKind::FullyConnected;
        self
    }

    pub fn chain_topology(mut self) -> Self {
        self.topology = TopologyKind::Chain;
        self
    }

    pub fn highway(mut self, spacing_m: f64, range_m: f64) -> Self {
        self.topology = TopologyKind::Highway { spacing_m, range_m };
        self
    }

    pub fn with_loss_rate(mut self, rate: f64) -> Self {
        self.loss_rate = rate;
        self
    }

    pub fn with_snapshot_interval(mut self, interval: f64) -> Self {
        self.snapshot_interval = Some(interval);
        self
    }

    /// Make the first `count` vehicles provider-capable with strong
    /// batteries.
    pub fn providers(mut self, count: usize) -> Self {
        self.providers = count;
        self
    }

    /// Make the last `count` vehicles energy-needy (low battery, far
    /// destination).
    pub fn needy(mut self, count: usize) -> Self {
        self.needy = count;
        self
    }

    /// Add a stationary hub at `position`.
    pub fn with_rreh(mut self, position: Position) -> Self {
        self.rreh_positions.push(position);
        self
    }

    /// Common destination for all vehicles.
    pub fn with_destination(mut self, destination: Position) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Vehicle ids count up from 1; hub ids continue after the vehicles.
    pub fn build(self) -> (Simulator, Vec<NodeId>) {
        let spacing = match self.topology {
            TopologyKind::Highway { spacing_m, .. } => spacing_m,
            _ => 100.0,
        };

        let mut states: Vec<NodeState> = Vec::new();
        for i in 0..self.vehicle_count {
            let id = [(i + 1) as u8; 6];
            let mut state = NodeState::new(id);
            state.position = (i as f64 * spacing, 0.0);
            state.velocity = (27.0, 0.0);
            state.destination = self.destination;
            if i < self.providers {
                state.provider_capable = true;
                state.battery_energy_kwh = 85.0;
                state.willingness = 6;
            }
            if i >= self.vehicle_count.saturating_sub(self.needy) {
                state.battery_energy_kwh = 15.0;
                state.destination =
                    Some(self.destination.unwrap_or((300_000.0, 0.0)));
            }
            states.push(state);
        }
        for (k, position) in self.rreh_positions.iter().enumerate() {
            let id = [(self.vehicle_count + k + 1) as u8; 6];
            let mut state = NodeState::new(id);
            state.role = NodeRole::Rreh;
            state.position = *position;
            states.push(state);
        }

        let ids: Vec<NodeId> = states.iter().map(|s| s.id).collect();
        let vehicle_ids = &ids[..self.vehicle_count];
        let mut topology = match self.topology {
            TopologyKind::FullyConnected => Topology::fully_connected(&ids),
            TopologyKind::Chain => Topology::chain(&ids),
            TopologyKind::Highway { spacing_m, range_m } => {
                let mut topo = Topology::highway(vehicle_ids, spacing_m, range_m);
                // Hubs hear every vehicle for simplicity.
                for hub in &ids[self.vehicle_count..] {
                    for v in vehicle_ids {
                        topo.add_link(*hub, *v, crate::topology::Link::default());
                    }
                }
                topo
            }
        };
        if self.loss_rate > 0.0 {
            topology.set_global_loss_rate(self.loss_rate);
        }

        let mut sim = Simulator::new(self.seed).with_topology(topology);
        if let Some(interval) = self.snapshot_interval {
            sim = sim.with_snapshot_interval(interval);
        }
        for state in states {
            sim.add_node(SimNode::new(self.config.clone(), state, 0.0));
        }
        (sim, ids)
    }

    /// Build and run in one go.
    pub fn run_for(self, duration: f64) -> crate::metrics::SimulationResult {
        let (mut sim, _) = self.build();
        sim.run_for(duration)
    }
}
