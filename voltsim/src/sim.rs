//! Discrete event simulator for voltmesh networks.
//!
//! A priority queue of events ordered by `(time, sequence)` drives the
//! nodes: pop the next event, advance simulation time, call the node's
//! entry point, collect its outgoing frames, and schedule deliveries over
//! the topology. Everything is deterministic for a given seed.

use std::collections::BinaryHeap;

use hashbrown::HashMap;
use voltmesh::NodeId;

use crate::event::{Event, ScenarioAction, ScheduledEvent, SequenceNumber};
use crate::metrics::{NetSnapshot, SimMetrics, SimulationResult};
use crate::node::SimNode;
use crate::topology::Topology;

/// Default protocol tick cadence for simulated nodes, seconds.
const DEFAULT_TICK_INTERVAL: f64 = 0.5;

/// Discrete event simulator.
pub struct Simulator {
    nodes: HashMap<NodeId, SimNode>,
    topology: Topology,
    current_time: f64,
    event_queue: BinaryHeap<ScheduledEvent>,
    metrics: SimMetrics,
    next_seq: u64,
    rng_state: u64,
    tick_interval: f64,
    snapshot_interval: Option<f64>,
    next_snapshot: Option<f64>,
}

impl Simulator {
    /// Create a simulator with the given loss-model RNG seed.
    pub fn new(seed: u64) -> Self {
        Self {
            nodes: HashMap::new(),
            topology: Topology::new(),
            current_time: 0.0,
            event_queue: BinaryHeap::new(),
            metrics: SimMetrics::new(),
            next_seq: 0,
            rng_state: seed,
            tick_interval: DEFAULT_TICK_INTERVAL,
            snapshot_interval: None,
            next_snapshot: None,
        }
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_tick_interval(mut self, interval: f64) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_snapshot_interval(mut self, interval: f64) -> Self {
        self.snapshot_interval = Some(interval);
        self.next_snapshot = Some(self.current_time + interval);
        self
    }

    /// Register a node and schedule its first tick at the current time.
    pub fn add_node(&mut self, node: SimNode) -> NodeId {
        let node_id = node.node_id();
        self.nodes.insert(node_id, node);
        self.schedule(self.current_time, Event::Tick { node: node_id });
        node_id
    }

    pub fn node(&self, id: &NodeId) -> Option<&SimNode> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &NodeId) -> Option<&mut SimNode> {
        self.nodes.get_mut(id)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn current_time(&self) -> f64 {
        self.current_time
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn topology_mut(&mut self) -> &mut Topology {
        &mut self.topology
    }

    pub fn metrics(&self) -> &SimMetrics {
        &self.metrics
    }

    /// Schedule an event.
    pub fn schedule(&mut self, time: f64, event: Event) {
        let seq = SequenceNumber::new(self.next_seq);
        self.next_seq += 1;
        self.event_queue.push(ScheduledEvent::new(time, seq, event));
    }

    pub fn schedule_action(&mut self, time: f64, action: ScenarioAction) {
        self.schedule(time, Event::ScenarioAction(action));
    }

    /// Run until `end_time`, processing every event up to it.
    pub fn run_until(&mut self, end_time: f64) -> SimulationResult {
        while let Some(event) = self.event_queue.peek() {
            if event.time > end_time {
                break;
            }
            let event = self.event_queue.pop().expect("peeked event exists");
            self.advance_time(event.time);
            self.process_event(event.event);
            self.maybe_take_snapshot();
        }

        self.advance_time(end_time);
        self.take_snapshot();

        SimulationResult {
            end_time: self.current_time,
            metrics: self.metrics.clone(),
            queue_exhausted: self.event_queue.peek().is_none(),
        }
    }

    pub fn run_for(&mut self, duration: f64) -> SimulationResult {
        self.run_until(self.current_time + duration)
    }

    fn advance_time(&mut self, time: f64) {
        if time > self.current_time {
            self.current_time = time;
        }
    }

    fn process_event(&mut self, event: Event) {
        match event {
            Event::FrameDelivery { to, data, from: _ } => {
                let now = self.current_time;
                if let Some(node) = self.nodes.get_mut(&to) {
                    node.handle_frame(&data, now);
                    self.metrics.frames_delivered += 1;
                }
                self.collect_outgoing(to);
            }
            Event::Tick { node } => {
                let now = self.current_time;
                if let Some(n) = self.nodes.get_mut(&node) {
                    n.handle_tick(now);
                } else {
                    return;
                }
                self.collect_outgoing(node);
                self.schedule(now + self.tick_interval, Event::Tick { node });
            }
            Event::MobilityUpdate {
                node,
                position,
                velocity,
                battery_kwh,
            } => {
                let now = self.current_time;
                if let Some(n) = self.nodes.get_mut(&node) {
                    n.handle_mobility(now, position, velocity, battery_kwh);
                }
                self.collect_outgoing(node);
            }
            Event::ScenarioAction(action) => self.execute_action(action),
        }
    }

    /// Drain a node's outgoing frames and put them on the air.
    fn collect_outgoing(&mut self, sender: NodeId) {
        let frames = match self.nodes.get_mut(&sender) {
            Some(node) => node.take_outgoing(),
            None => return,
        };
        for frame in frames {
            self.broadcast(sender, frame);
        }
    }

    /// Broadcast one frame to every reachable neighbor, applying loss and
    /// delay per link.
    fn broadcast(&mut self, sender: NodeId, data: Vec<u8>) {
        self.metrics.frames_sent += 1;
        let now = self.current_time;

        let neighbors = self.topology.neighbors(sender);
        let mut deliveries = Vec::with_capacity(neighbors.len());
        for neighbor in neighbors {
            let Some(link) = self.topology.get_link(sender, neighbor) else {
                continue;
            };
            if !link.active {
                continue;
            }
            let loss_rate = link.loss_rate;
            let delay = link.delay;
            if loss_rate > 0.0 && self.random_f64() < loss_rate {
                self.metrics.frames_dropped += 1;
                continue;
            }
            deliveries.push((neighbor, delay));
        }

        for (neighbor, delay) in deliveries {
            self.schedule(
                now + delay,
                Event::FrameDelivery {
                    to: neighbor,
                    data: data.clone(),
                    from: sender,
                },
            );
        }
    }

    fn execute_action(&mut self, action: ScenarioAction) {
        match action {
            ScenarioAction::Partition { groups } => self.topology.partition(&groups),
            ScenarioAction::HealPartition => self.topology.heal(),
            ScenarioAction::DisableLink { from, to } => {
                if let Some(link) = self.topology.get_link_mut(from, to) {
                    link.active = false;
                }
            }
            ScenarioAction::EnableLink { from, to } => {
                if let Some(link) = self.topology.get_link_mut(from, to) {
                    link.active = true;
                }
            }
            ScenarioAction::SetLossRate { from, to, rate } => {
                if let Some(link) = self.topology.get_link_mut(from, to) {
                    link.loss_rate = rate.clamp(0.0, 1.0);
                }
            }
            ScenarioAction::TakeSnapshot => self.take_snapshot(),
        }
    }

    fn maybe_take_snapshot(&mut self) {
        if let Some(next) = self.next_snapshot {
            if self.current_time >= next {
                self.take_snapshot();
                if let Some(interval) = self.snapshot_interval {
                    self.next_snapshot = Some(next + interval);
                }
            }
        }
    }

    /// Record current per-node protocol state.
    pub fn take_snapshot(&mut self) {
        let mut snapshot = NetSnapshot::new(self.current_time);
        for (node_id, node) in &self.nodes {
            snapshot.record_node(
                *node_id,
                node.neighbor_count(),
                node.provider_count(),
                node.role(),
                node.sessions_booked(),
            );
        }
        self.metrics.add_snapshot(snapshot);
    }

    /// Deterministic LCG in [0, 1) for the loss model.
    fn random_f64(&mut self) -> f64 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1);
        (self.rng_state >> 11) as f64 / (1u64 << 53) as f64
    }
}
