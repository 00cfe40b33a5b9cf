//! SimNode wrapper for simulated voltmesh nodes.

use voltmesh::consumer::ConsumerPhase;
use voltmesh::context::NodeState;
use voltmesh::{Node, NodeId, NodeRole, Position, ProtocolConfig, Velocity};

/// A voltmesh node inside the simulator.
pub struct SimNode {
    inner: Node,
    /// When the node was created.
    pub created_at: f64,
}

impl SimNode {
    pub fn new(config: ProtocolConfig, state: NodeState, created_at: f64) -> Self {
        let inner = Node::new(config, state).expect("scenario config must validate");
        Self { inner, created_at }
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.id()
    }

    pub fn inner(&self) -> &Node {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut Node {
        &mut self.inner
    }

    pub fn role(&self) -> NodeRole {
        self.inner.role()
    }

    pub fn neighbor_count(&self) -> usize {
        self.inner.neighbor_count()
    }

    pub fn has_neighbor(&self, id: &NodeId) -> bool {
        self.inner.has_neighbor(id)
    }

    pub fn provider_count(&self) -> usize {
        self.inner.provider_table().len()
    }

    pub fn consumer_phase(&self) -> ConsumerPhase {
        self.inner.consumer_phase()
    }

    pub fn sessions_booked(&self) -> u64 {
        self.inner.metrics().sessions_booked
    }

    /// Run a protocol tick. A halted node (time regression) stays silent.
    pub fn handle_tick(&mut self, now: f64) {
        let _ = self.inner.tick(now);
    }

    /// Deliver a raw frame.
    pub fn handle_frame(&mut self, data: &[u8], now: f64) {
        let _ = self.inner.receive(data, now);
    }

    /// Push a mobility/energy update.
    pub fn handle_mobility(
        &mut self,
        now: f64,
        position: Position,
        velocity: Velocity,
        battery_kwh: f64,
    ) {
        let _ = self
            .inner
            .apply_mobility_and_energy(now, position, velocity, battery_kwh);
    }

    /// Take all frames queued for the radio.
    pub fn take_outgoing(&mut self) -> Vec<Vec<u8>> {
        self.inner.take_outgoing()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simnode_creation() {
        let node = SimNode::new(ProtocolConfig::default(), NodeState::new([1; 6]), 0.0);
        assert_eq!(node.node_id(), [1; 6]);
        assert_eq!(node.role(), NodeRole::Consumer);
        assert_eq!(node.neighbor_count(), 0);
    }

    #[test]
    fn test_tick_emits_hello() {
        let mut node =
            SimNode::new(ProtocolConfig::default(), NodeState::new([1; 6]), 0.0);
        node.handle_tick(0.0);
        assert!(!node.take_outgoing().is_empty());
    }
}
