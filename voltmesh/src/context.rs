//! Shared context: simulation clock, local node state, frame egress.
//!
//! Simulation time only ever moves through [`Context::update_time`], which
//! every entry point calls first with the event's own timestamp. There is
//! no wall clock anywhere in this crate; a clock that never ticks keeps
//! every state machine inert.

use crate::config::ProtocolConfig;
use crate::metrics::NodeMetrics;
use crate::types::{
    distance_km, normalize, Error, NodeId, NodeRole, Position, Velocity,
};
use crate::wire::{Frame, Message};

/// Local physical and protocol state of this node.
///
/// Mutated only by `apply_mobility_and_energy` (the mobility collaborator's
/// push) and by the RoleManager; receive handlers never write it.
#[derive(Clone, Debug)]
pub struct NodeState {
    pub id: NodeId,
    pub position: Position,
    pub velocity: Velocity,

    pub battery_capacity_kwh: f64,
    pub battery_energy_kwh: f64,
    pub min_energy_kwh: f64,
    pub max_transfer_rate_in: f64,
    pub max_transfer_rate_out: f64,
    pub battery_health: f64,

    pub willingness: u8,
    pub provider_capable: bool,
    pub destination: Option<Position>,
    pub role: NodeRole,

    // Advertised QoS metrics.
    pub etx: f64,
    pub jitter_ms: f64,
    pub lane_weight: f64,
    pub link_stability: f64,
}

impl NodeState {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            position: (0.0, 0.0),
            velocity: (0.0, 0.0),
            battery_capacity_kwh: 100.0,
            battery_energy_kwh: 50.0,
            min_energy_kwh: 10.0,
            max_transfer_rate_in: 50.0,
            max_transfer_rate_out: 50.0,
            battery_health: 1.0,
            willingness: 3,
            provider_capable: false,
            destination: None,
            role: NodeRole::Consumer,
            etx: 1.0,
            jitter_ms: 0.0,
            lane_weight: 0.5,
            link_stability: 1.0,
        }
    }

    /// Battery fill level as a fraction in [0, 1].
    pub fn battery_pct(&self) -> f64 {
        if self.battery_capacity_kwh <= 0.0 {
            return 0.0;
        }
        (self.battery_energy_kwh / self.battery_capacity_kwh).clamp(0.0, 1.0)
    }

    /// Energy in kWh to drive to `target`.
    pub fn energy_to(&self, target: Position, config: &ProtocolConfig) -> f64 {
        distance_km(self.position, target) * config.energy_consumption_rate_kwh_per_km
    }

    /// Energy in kWh to reach the destination; 0 with no destination set.
    pub fn energy_to_destination(&self, config: &ProtocolConfig) -> f64 {
        match self.destination {
            Some(dest) => self.energy_to(dest, config),
            None => 0.0,
        }
    }

    /// Energy available for sharing: what remains above the trip need and
    /// the reserve. Negative when the node cannot reach its destination.
    pub fn shareable_energy(&self, config: &ProtocolConfig) -> f64 {
        self.battery_energy_kwh - self.energy_to_destination(config) - self.min_energy_kwh
    }

    /// A node needs charge when its shareable energy is negative.
    pub fn needs_charge(&self, config: &ProtocolConfig) -> bool {
        self.shareable_energy(config) < 0.0
    }

    pub fn can_reach_destination(&self, config: &ProtocolConfig) -> bool {
        self.battery_energy_kwh
            >= self.energy_to_destination(config) + self.min_energy_kwh
    }

    /// Unit heading toward the destination; (0, 0) without one.
    pub fn direction_vector(&self) -> (f64, f64) {
        match self.destination {
            Some((dx, dy)) => {
                normalize((dx - self.position.0, dy - self.position.1))
            }
            None => (0.0, 0.0),
        }
    }
}

/// Shared context handed to every layer.
pub struct Context {
    pub config: ProtocolConfig,
    pub state: NodeState,
    pub metrics: NodeMetrics,
    current_time: f64,
    halted: bool,
    next_seq: u32,
    outgoing: Vec<Vec<u8>>,
}

impl Context {
    pub fn new(config: ProtocolConfig, state: NodeState) -> Self {
        Self {
            config,
            state,
            metrics: NodeMetrics::default(),
            current_time: 0.0,
            halted: false,
            next_seq: 0,
            outgoing: Vec::new(),
        }
    }

    /// Current simulation time in seconds.
    pub fn current_time(&self) -> f64 {
        self.current_time
    }

    /// Advance simulation time. The only way time moves.
    ///
    /// A regression is fatal: the orchestrator broke its ordering contract,
    /// and this node refuses to execute afterwards.
    pub fn update_time(&mut self, t: f64) -> Result<(), Error> {
        if self.halted {
            return Err(Error::Halted);
        }
        if t < self.current_time {
            self.halted = true;
            return Err(Error::TimeRegression {
                now: self.current_time,
                event: t,
            });
        }
        self.current_time = t;
        Ok(())
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Next per-originator sequence number, monotonically increasing.
    pub fn next_seq(&mut self) -> u32 {
        self.next_seq = self.next_seq.wrapping_add(1) & crate::types::MAX_SEQUENCE_NUMBER;
        self.next_seq
    }

    /// Sequence number carried by the most recently originated frame.
    pub fn last_seq(&self) -> u32 {
        self.next_seq
    }

    /// Encode and queue an originated frame.
    pub fn emit(&mut self, ttl: u8, body: Message) {
        let seq = self.next_seq();
        let kind = body.kind();
        let frame = Frame::new(ttl, seq, self.state.id, body);
        self.outgoing.push(frame.encode_to_vec());
        self.metrics.sent.record(kind);
    }

    /// Queue an already-encoded frame (the forwarding path).
    pub fn emit_raw(&mut self, bytes: Vec<u8>, kind: crate::wire::MsgType) {
        self.outgoing.push(bytes);
        self.metrics.forwarded.record(kind);
    }

    /// Drain frames queued for the PHY sink.
    pub fn take_outgoing(&mut self) -> Vec<Vec<u8>> {
        core::mem::take(&mut self.outgoing)
    }

    /// Number of frames waiting for the sink.
    pub fn pending_outgoing(&self) -> usize {
        self.outgoing.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Context {
        Context::new(ProtocolConfig::default(), NodeState::new([1; 6]))
    }

    #[test]
    fn test_time_starts_at_zero() {
        let c = ctx();
        assert_eq!(c.current_time(), 0.0);
    }

    #[test]
    fn test_time_advances_monotonically() {
        let mut c = ctx();
        c.update_time(1.0).unwrap();
        c.update_time(1.0).unwrap(); // equal is allowed
        c.update_time(2.5).unwrap();
        assert_eq!(c.current_time(), 2.5);
    }

    #[test]
    fn test_time_regression_is_fatal() {
        let mut c = ctx();
        c.update_time(5.0).unwrap();
        assert_eq!(
            c.update_time(4.0),
            Err(Error::TimeRegression {
                now: 5.0,
                event: 4.0
            })
        );
        // Halted from here on, even for valid times.
        assert_eq!(c.update_time(6.0), Err(Error::Halted));
        assert!(c.is_halted());
    }

    #[test]
    fn test_seq_monotonic() {
        let mut c = ctx();
        let a = c.next_seq();
        let b = c.next_seq();
        assert!(b > a);
    }

    #[test]
    fn test_shareable_energy() {
        let config = ProtocolConfig::default();
        let mut state = NodeState::new([1; 6]);
        state.battery_energy_kwh = 50.0;
        state.min_energy_kwh = 10.0;
        // 100 km to destination at 0.15 kWh/km = 15 kWh
        state.position = (0.0, 0.0);
        state.destination = Some((100_000.0, 0.0));
        let shareable = state.shareable_energy(&config);
        assert!((shareable - 25.0).abs() < 1e-9);
        assert!(!state.needs_charge(&config));

        state.battery_energy_kwh = 20.0;
        assert!(state.needs_charge(&config));
    }

    #[test]
    fn test_direction_vector() {
        let mut state = NodeState::new([1; 6]);
        state.position = (0.0, 0.0);
        state.destination = Some((3.0, 4.0));
        let d = state.direction_vector();
        assert!((d.0 - 0.6).abs() < 1e-12 && (d.1 - 0.8).abs() < 1e-12);
        state.destination = None;
        assert_eq!(state.direction_vector(), (0.0, 0.0));
    }

    #[test]
    fn test_emit_queues_frames() {
        let mut c = ctx();
        c.emit(
            1,
            Message::Ack(crate::wire::Ack {
                consumer_id: [1; 6],
                provider_id: [2; 6],
            }),
        );
        assert_eq!(c.pending_outgoing(), 1);
        let frames = c.take_outgoing();
        assert_eq!(frames.len(), 1);
        assert_eq!(c.pending_outgoing(), 0);
        assert_eq!(c.metrics.sent.get(crate::wire::MsgType::Ack), 1);
    }
}
