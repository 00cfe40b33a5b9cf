//! voltmesh - Core protocol engine for multi-hop VANET charging
//! coordination (MVCCP).
//!
//! Autonomous electric vehicles and roadside energy hubs discover each
//! other over a lossy multi-hop wireless medium and negotiate charging
//! sessions, including platoon-based wireless energy transfer.
//!
//! # Key Properties
//!
//! - Deterministic and simulation-time driven: the only clock is the one
//!   the orchestrator feeds through `tick`/`receive`
//! - QoS-weighted OLSR neighbor discovery with MPR selection
//! - TTL-bounded provider-announcement flooding restricted to MPRs with
//!   duplicate suppression
//! - A four-way charging handshake (JOIN_OFFER → JOIN_ACCEPT → ACK →
//!   ACKACK) across consumer, platoon-head and RREH state machines
//! - Intra-platoon energy routing over a distance-derived edge graph
//!
//! # Example
//!
//! ```
//! use voltmesh::{Node, NodeState, ProtocolConfig};
//!
//! let mut node = Node::new(ProtocolConfig::default(), NodeState::new([1; 6])).unwrap();
//!
//! // Drive the node from your discrete-event loop:
//! node.tick(0.0).unwrap();
//! for frame in node.take_outgoing() {
//!     // hand to the PHY sink / deliver to peers
//!     let _ = frame;
//! }
//! ```
//!
//! # Module Structure
//!
//! - [`types`] - Identifiers, roles, errors, planar geometry
//! - [`wire`] - Header + TLV wire format
//! - [`config`] - Protocol configuration surface
//! - [`context`] - Simulation clock, local node state, frame egress
//! - [`neighbor`] / [`mpr`] - Layer A neighbor discovery and MPR selection
//! - [`announce`] - Layer B provider announcement dissemination
//! - [`session`] / [`role`] / [`consumer`] / [`head`] / [`rreh`] - Layer C
//!   charging coordination
//! - [`platoon`] - Layer D platoon coordination
//! - [`node`] - Entry points and dispatch

pub mod announce;
pub mod config;
pub mod consumer;
pub mod context;
pub mod head;
pub mod metrics;
pub mod mpr;
pub mod neighbor;
pub mod node;
pub mod platoon;
pub mod role;
pub mod rreh;
pub mod session;
pub mod types;
pub mod wire;

// Re-export main types at crate root
pub use config::{ProtocolConfig, TtlMode};
pub use context::NodeState;
pub use metrics::NodeMetrics;
pub use node::Node;
pub use session::{Session, SessionId, SessionState};
pub use types::{
    Error, FailReason, NodeId, NodeRole, OperationalState, PlatoonId, Position,
    ProviderType, Velocity,
};
pub use wire::{DecodeError, Frame, Header, Message, MsgType};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_creation() {
        let node = Node::new(ProtocolConfig::default(), NodeState::new([1; 6])).unwrap();
        assert_eq!(node.id(), [1; 6]);
        assert_eq!(node.current_time(), 0.0);
        assert_eq!(node.role(), NodeRole::Consumer);
        assert!(!node.is_halted());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ProtocolConfig {
            hello_interval: -1.0,
            ..ProtocolConfig::default()
        };
        assert!(Node::new(config, NodeState::new([1; 6])).is_err());
    }

    #[test]
    fn test_inert_without_ticks() {
        // A node that never ticks emits nothing: no background timers.
        let mut node =
            Node::new(ProtocolConfig::default(), NodeState::new([1; 6])).unwrap();
        assert!(node.take_outgoing().is_empty());
    }
}
