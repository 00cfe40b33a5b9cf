//! Wireless topology and link properties.

use hashbrown::HashMap;
use voltmesh::NodeId;

/// Properties of a link between two nodes.
#[derive(Debug, Clone)]
pub struct Link {
    /// Packet loss rate (0.0 to 1.0).
    pub loss_rate: f64,
    /// Propagation delay, seconds.
    pub delay: f64,
    /// Whether the link is currently active.
    pub active: bool,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            delay: 0.001,
            active: true,
        }
    }
}

impl Link {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_loss_rate(mut self, rate: f64) -> Self {
        self.loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_delay(mut self, delay: f64) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }
}

/// Connectivity between nodes. Links are bidirectional and stored under a
/// canonical (lower id first) key.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    links: HashMap<(NodeId, NodeId), Link>,
}

impl Topology {
    pub fn new() -> Self {
        Self {
            links: HashMap::new(),
        }
    }

    /// Every node hears every other node.
    pub fn fully_connected(nodes: &[NodeId]) -> Self {
        let mut topo = Self::new();
        for (i, &a) in nodes.iter().enumerate() {
            for &b in nodes.iter().skip(i + 1) {
                topo.add_link(a, b, Link::default());
            }
        }
        topo
    }

    /// Each node hears only its immediate neighbors in the slice order.
    pub fn chain(nodes: &[NodeId]) -> Self {
        let mut topo = Self::new();
        for window in nodes.windows(2) {
            topo.add_link(window[0], window[1], Link::default());
        }
        topo
    }

    /// Vehicles on a straight road with uniform spacing: nodes are
    /// connected while their index distance times `spacing_m` stays
    /// within `range_m`.
    pub fn highway(nodes: &[NodeId], spacing_m: f64, range_m: f64) -> Self {
        let mut topo = Self::new();
        for i in 0..nodes.len() {
            for j in (i + 1)..nodes.len() {
                let distance = (j - i) as f64 * spacing_m;
                if distance <= range_m {
                    topo.add_link(nodes[i], nodes[j], Link::default());
                }
            }
        }
        topo
    }

    pub fn add_link(&mut self, a: NodeId, b: NodeId, link: Link) {
        let key = Self::canonical_pair(a, b);
        self.links.insert(key, link);
    }

    pub fn get_link(&self, a: NodeId, b: NodeId) -> Option<&Link> {
        self.links.get(&Self::canonical_pair(a, b))
    }

    pub fn get_link_mut(&mut self, a: NodeId, b: NodeId) -> Option<&mut Link> {
        self.links.get_mut(&Self::canonical_pair(a, b))
    }

    pub fn is_connected(&self, a: NodeId, b: NodeId) -> bool {
        self.get_link(a, b).is_some_and(|link| link.active)
    }

    /// Nodes reachable from `node` over active links, in id order for
    /// deterministic delivery scheduling.
    pub fn neighbors(&self, node: NodeId) -> Vec<NodeId> {
        let mut result = Vec::new();
        for (&(a, b), link) in &self.links {
            if link.active {
                if a == node {
                    result.push(b);
                } else if b == node {
                    result.push(a);
                }
            }
        }
        result.sort();
        result
    }

    /// Disable all links crossing between partition groups.
    pub fn partition(&mut self, groups: &[Vec<NodeId>]) {
        for (&(a, b), link) in self.links.iter_mut() {
            let a_group = groups.iter().position(|g| g.contains(&a));
            let b_group = groups.iter().position(|g| g.contains(&b));
            if a_group != b_group {
                link.active = false;
            }
        }
    }

    /// Re-enable all links.
    pub fn heal(&mut self) {
        for link in self.links.values_mut() {
            link.active = true;
        }
    }

    pub fn set_global_loss_rate(&mut self, rate: f64) {
        let rate = rate.clamp(0.0, 1.0);
        for link in self.links.values_mut() {
            link.loss_rate = rate;
        }
    }

    fn canonical_pair(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
        if a < b {
            (a, b)
        } else {
            (b, a)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_nodes(count: usize) -> Vec<NodeId> {
        (0..count).map(|i| [(i + 1) as u8; 6]).collect()
    }

    #[test]
    fn test_fully_connected() {
        let nodes = make_nodes(3);
        let topo = Topology::fully_connected(&nodes);
        assert!(topo.is_connected(nodes[0], nodes[1]));
        assert!(topo.is_connected(nodes[0], nodes[2]));
        assert!(topo.is_connected(nodes[1], nodes[2]));
    }

    #[test]
    fn test_chain() {
        let nodes = make_nodes(4);
        let topo = Topology::chain(&nodes);
        assert!(topo.is_connected(nodes[0], nodes[1]));
        assert!(topo.is_connected(nodes[1], nodes[2]));
        assert!(topo.is_connected(nodes[2], nodes[3]));
        assert!(!topo.is_connected(nodes[0], nodes[2]));
        assert!(!topo.is_connected(nodes[0], nodes[3]));
    }

    #[test]
    fn test_highway_range() {
        // 100 m spacing, 150 m radio range: only adjacent vehicles hear
        // each other.
        let nodes = make_nodes(4);
        let topo = Topology::highway(&nodes, 100.0, 150.0);
        assert!(topo.is_connected(nodes[0], nodes[1]));
        assert!(!topo.is_connected(nodes[0], nodes[2]));

        // 250 m range covers two hops of spacing.
        let topo = Topology::highway(&nodes, 100.0, 250.0);
        assert!(topo.is_connected(nodes[0], nodes[2]));
        assert!(!topo.is_connected(nodes[0], nodes[3]));
    }

    #[test]
    fn test_partition_and_heal() {
        let nodes = make_nodes(4);
        let mut topo = Topology::fully_connected(&nodes);
        topo.partition(&[
            vec![nodes[0], nodes[1]],
            vec![nodes[2], nodes[3]],
        ]);
        assert!(topo.is_connected(nodes[0], nodes[1]));
        assert!(topo.is_connected(nodes[2], nodes[3]));
        assert!(!topo.is_connected(nodes[0], nodes[2]));
        assert!(!topo.is_connected(nodes[1], nodes[3]));

        topo.heal();
        assert!(topo.is_connected(nodes[0], nodes[2]));
    }

    #[test]
    fn test_neighbors_sorted() {
        let nodes = make_nodes(4);
        let topo = Topology::fully_connected(&nodes);
        let n = topo.neighbors(nodes[1]);
        assert_eq!(n, vec![nodes[0], nodes[2], nodes[3]]);
    }
}
