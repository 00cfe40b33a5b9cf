//! Charging session records shared by the Layer C state machines.

use crate::types::{FailReason, NodeId, Position};

/// Session identity, derived from the JOIN_OFFER that opened it. Both
/// endpoints derive the same id independently: the consumer from its own
/// offer, the provider from the offer's header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId {
    pub consumer: NodeId,
    pub provider: NodeId,
    pub seq: u32,
}

/// Lifecycle of a charging session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Offer built, not yet answered.
    PendingOffer,
    /// Consumer waiting for JOIN_ACCEPT.
    PendingAccept,
    /// Provider waiting for ACK.
    PendingAck,
    /// Consumer waiting for ACKACK.
    PendingAckAck,
    /// Both endpoints consider the session booked.
    Allocated,
    /// Consumer moving toward the meeting point.
    Travel,
    /// Energy transfer in progress.
    Charging,
    Done,
    Failed,
}

/// One charging session, consumer or provider side.
#[derive(Clone, Debug)]
pub struct Session {
    pub id: SessionId,
    pub required_energy_kwh: f64,
    pub meeting_point: Position,
    pub state: SessionState,
    /// Absolute simulation deadline of the pending handshake step.
    pub deadline: Option<f64>,
    pub fail_reason: Option<FailReason>,
    pub bandwidth_kw: f64,
    pub duration_s: f64,
}

impl Session {
    pub fn new(id: SessionId, required_energy_kwh: f64, meeting_point: Position) -> Self {
        Self {
            id,
            required_energy_kwh,
            meeting_point,
            state: SessionState::PendingOffer,
            deadline: None,
            fail_reason: None,
            bandwidth_kw: 0.0,
            duration_s: 0.0,
        }
    }

    /// Move to a pending state with an absolute deadline.
    pub fn wait(&mut self, state: SessionState, deadline: f64) {
        self.state = state;
        self.deadline = Some(deadline);
    }

    /// The handshake completed; the booking holds on both ends.
    pub fn allocate(&mut self) {
        self.state = SessionState::Allocated;
        self.deadline = None;
    }

    pub fn fail(&mut self, reason: FailReason) {
        self.state = SessionState::Failed;
        self.deadline = None;
        self.fail_reason = Some(reason);
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, SessionState::Done | SessionState::Failed)
    }

    /// Pending means a handshake step is in flight with a live deadline.
    pub fn is_pending(&self) -> bool {
        matches!(
            self.state,
            SessionState::PendingOffer
                | SessionState::PendingAccept
                | SessionState::PendingAck
                | SessionState::PendingAckAck
        )
    }

    pub fn deadline_passed(&self, now: f64) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }
}
