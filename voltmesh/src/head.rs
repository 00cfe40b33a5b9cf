//! Layer C, provider side: offer collection and the booking handshake for
//! platoon heads and standalone mobile providers.
//!
//! Offers accumulate during an offer window, get scored, and the winner is
//! walked through JOIN_ACCEPT → ACK → ACKACK one at a time until slots or
//! energy run out. A lost ACK returns the slot to the pool.

use std::collections::BTreeMap;

use hashbrown::HashMap;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::session::{Session, SessionId, SessionState};
use crate::types::{
    dot, normalize, short_id, FailReason, NodeId, PlatoonId, Position,
};
use crate::wire::{AckAck, Header, JoinAccept, JoinOffer, Message};

/// Offers a provider can honor right now; assembled by the node from its
/// own state or its platoon.
#[derive(Clone, Debug)]
pub struct ProviderCapacity {
    pub available_slots: usize,
    pub shareable_kwh: f64,
    pub meeting_point: Position,
    pub bandwidth_kw: f64,
    pub direction: (f64, f64),
    /// Platoon identity and roster, for heads.
    pub platoon: Option<(PlatoonId, Vec<NodeId>)>,
}

/// Negotiation status of the provider machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderPhase {
    /// Advertising, no window open.
    Announce,
    /// Collecting JOIN_OFFERs until the window closes.
    WaitOffers,
    /// JOIN_ACCEPT sent, waiting for the consumer's ACK.
    WaitAck,
    /// At least one session allocated; still accepts offers while
    /// capacity remains.
    Charge,
}

/// A JOIN_OFFER waiting for selection.
#[derive(Clone, Debug)]
struct PendingOffer {
    offer_seq: u32,
    energy_required_kwh: f64,
    position: Position,
    trajectory: Position,
}

/// Provider-side Layer C state.
pub struct ProviderSide {
    phase: ProviderPhase,
    /// Collected offers, in consumer-id order for deterministic ties.
    pending: BTreeMap<NodeId, PendingOffer>,
    window_start: f64,
    current_target: Option<NodeId>,
    ack_deadline: f64,
    /// Booked sessions by consumer.
    sessions: HashMap<NodeId, Session>,
}

/// A consumer whose booking completed; heads add it to the platoon.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BookedConsumer {
    pub consumer_id: NodeId,
    pub energy_required_kwh: f64,
    pub position: Position,
}

impl ProviderSide {
    pub fn new() -> Self {
        Self {
            phase: ProviderPhase::Announce,
            pending: BTreeMap::new(),
            window_start: 0.0,
            current_target: None,
            ack_deadline: 0.0,
            sessions: HashMap::new(),
        }
    }

    pub fn phase(&self) -> ProviderPhase {
        self.phase
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn session_for(&self, consumer: &NodeId) -> Option<&Session> {
        self.sessions.get(consumer)
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| !s.is_terminal())
            .count()
    }

    /// Periodic work: window management, selection, ACK deadlines.
    pub fn tick(&mut self, ctx: &mut Context, capacity: &ProviderCapacity) {
        let now = ctx.current_time();
        match self.phase {
            ProviderPhase::Announce => {
                if capacity.available_slots > 0 {
                    self.phase = ProviderPhase::WaitOffers;
                    self.window_start = now;
                }
            }
            ProviderPhase::WaitOffers => {
                if now - self.window_start >= ctx.config.offer_window {
                    if self.pending.is_empty() {
                        self.phase = self.idle_phase();
                    } else {
                        self.select(ctx, capacity);
                    }
                }
            }
            ProviderPhase::WaitAck => {
                if now >= self.ack_deadline {
                    self.on_ack_timeout(ctx, capacity);
                }
            }
            ProviderPhase::Charge => {
                if capacity.available_slots > 0 && !self.pending.is_empty() {
                    self.select(ctx, capacity);
                }
            }
        }
    }

    fn idle_phase(&self) -> ProviderPhase {
        if self.active_session_count() > 0 {
            ProviderPhase::Charge
        } else {
            ProviderPhase::Announce
        }
    }

    /// Collect a JOIN_OFFER addressed to this provider.
    pub fn handle_join_offer(
        &mut self,
        ctx: &mut Context,
        header: &Header,
        offer: &JoinOffer,
        capacity: &ProviderCapacity,
    ) {
        if offer.provider_id != ctx.state.id {
            ctx.metrics.dropped_unrelated += 1;
            return;
        }
        // Refusing is silent: the consumer's own deadline recovers it.
        if capacity.available_slots == 0 {
            ctx.metrics.capacity_refusals += 1;
            debug!(
                consumer = %short_id(&offer.consumer_id),
                "offer refused, no capacity"
            );
            return;
        }
        if self.sessions.contains_key(&offer.consumer_id)
            || self.pending.contains_key(&offer.consumer_id)
        {
            return; // duplicate or already booked
        }

        let now = ctx.current_time();
        self.pending.insert(
            offer.consumer_id,
            PendingOffer {
                offer_seq: header.seq_num,
                energy_required_kwh: offer.energy_required_kwh as f64,
                position: (offer.position.0 as f64, offer.position.1 as f64),
                trajectory: (offer.trajectory.0 as f64, offer.trajectory.1 as f64),
            },
        );
        info!(consumer = %short_id(&offer.consumer_id), "rx join offer");

        if self.phase == ProviderPhase::Announce {
            self.phase = ProviderPhase::WaitOffers;
            self.window_start = now;
        }
    }

    /// Route-alignment and energy score; only positive scores get accepted.
    fn score_offer(&self, offer: &PendingOffer, capacity: &ProviderCapacity) -> f64 {
        let mut score = 100.0;
        let consumer_dir = normalize((
            offer.trajectory.0 - offer.position.0,
            offer.trajectory.1 - offer.position.1,
        ));
        if consumer_dir != (0.0, 0.0) && capacity.direction != (0.0, 0.0) {
            score += dot(capacity.direction, consumer_dir) * 50.0;
        }
        if offer.energy_required_kwh > capacity.shareable_kwh {
            score -= 50.0;
        }
        score
    }

    /// Close the window: accept the best-scoring offer.
    fn select(&mut self, ctx: &mut Context, capacity: &ProviderCapacity) {
        if capacity.available_slots == 0 {
            self.pending.clear();
            self.phase = self.idle_phase();
            return;
        }

        // BTreeMap iteration is id-ordered, so equal scores keep the
        // lowest consumer id.
        let mut best: Option<(NodeId, f64)> = None;
        for (id, offer) in &self.pending {
            let score = self.score_offer(offer, capacity);
            if score <= 0.0 {
                continue;
            }
            let better = match best {
                None => true,
                Some((_, best_score)) => score > best_score,
            };
            if better {
                best = Some((*id, score));
            }
        }

        let Some((winner, score)) = best else {
            self.pending.clear();
            self.phase = self.idle_phase();
            return;
        };
        debug!(consumer = %short_id(&winner), score, "offer selected");
        self.send_accept(ctx, winner, capacity);
    }

    fn send_accept(&mut self, ctx: &mut Context, consumer: NodeId, capacity: &ProviderCapacity) {
        let Some(offer) = self.pending.get(&consumer) else {
            return;
        };
        let now = ctx.current_time();

        let duration_s = if capacity.bandwidth_kw > 0.0 {
            offer.energy_required_kwh / capacity.bandwidth_kw * 3600.0
        } else {
            0.0
        };
        let (platoon_id, members) = match &capacity.platoon {
            Some((pid, roster)) => (Some(*pid), roster.clone()),
            None => (None, Vec::new()),
        };

        ctx.emit(
            1,
            Message::JoinAccept(JoinAccept {
                provider_id: ctx.state.id,
                consumer_id: consumer,
                meeting_point: (
                    capacity.meeting_point.0 as f32,
                    capacity.meeting_point.1 as f32,
                ),
                bandwidth_kw: capacity.bandwidth_kw as f32,
                duration_s: duration_s as f32,
                platoon_id,
                members,
            }),
        );
        info!(consumer = %short_id(&consumer), "tx join accept");

        self.current_target = Some(consumer);
        self.ack_deadline = now + ctx.config.join_accept_timeout;
        self.phase = ProviderPhase::WaitAck;
    }

    /// ACK from the selected consumer: reply ACKACK, book the session.
    /// Returns the booked consumer so heads can grow their platoon.
    pub fn handle_ack(
        &mut self,
        ctx: &mut Context,
        consumer_id: &NodeId,
        provider_id: &NodeId,
    ) -> Option<BookedConsumer> {
        if self.phase != ProviderPhase::WaitAck {
            return None;
        }
        if *provider_id != ctx.state.id || Some(*consumer_id) != self.current_target {
            ctx.metrics.dropped_unrelated += 1;
            return None;
        }
        let offer = self.pending.remove(consumer_id)?;

        ctx.emit(
            1,
            Message::AckAck(AckAck {
                provider_id: ctx.state.id,
                consumer_id: *consumer_id,
            }),
        );

        let mut session = Session::new(
            SessionId {
                consumer: *consumer_id,
                provider: ctx.state.id,
                seq: offer.offer_seq,
            },
            offer.energy_required_kwh,
            offer.position,
        );
        session.allocate();
        self.sessions.insert(*consumer_id, session);
        ctx.metrics.sessions_booked += 1;
        info!(consumer = %short_id(consumer_id), "session booked, tx ackack");

        self.current_target = None;
        // Remaining offers get selected on the next tick from Charge.
        self.phase = ProviderPhase::Charge;
        Some(BookedConsumer {
            consumer_id: *consumer_id,
            energy_required_kwh: offer.energy_required_kwh,
            position: offer.position,
        })
    }

    fn on_ack_timeout(&mut self, ctx: &mut Context, capacity: &ProviderCapacity) {
        if let Some(target) = self.current_target.take() {
            warn!(consumer = %short_id(&target), "ack timed out");
            self.pending.remove(&target);
            ctx.metrics.ack_timeouts += 1;
            ctx.metrics.sessions_failed += 1;
        }
        // Capacity returns to the pool; try the remaining offers.
        if self.pending.is_empty() {
            self.phase = self.idle_phase();
        } else {
            self.select(ctx, capacity);
        }
    }

    /// Session ended externally (charging done or consumer left).
    pub fn complete_session(&mut self, consumer: &NodeId) {
        if let Some(session) = self.sessions.get_mut(consumer) {
            session.state = SessionState::Done;
        }
        self.sessions.remove(consumer);
        if self.active_session_count() == 0 && self.phase == ProviderPhase::Charge {
            self.phase = ProviderPhase::Announce;
        }
    }

    /// Cancel all pending negotiation; used on role switches.
    pub fn cancel_all(&mut self, ctx: &mut Context, reason: FailReason) {
        let had_pending = self.current_target.is_some() || !self.pending.is_empty();
        for session in self.sessions.values_mut() {
            if !session.is_terminal() {
                session.fail(reason);
                ctx.metrics.sessions_failed += 1;
            }
        }
        if had_pending && reason == FailReason::RoleSwitched {
            ctx.metrics.role_switch_cancellations += 1;
        }
        self.pending.clear();
        self.sessions.clear();
        self.current_target = None;
        self.phase = ProviderPhase::Announce;
    }
}

impl Default for ProviderSide {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use crate::context::NodeState;
    use crate::wire::{Frame, MsgType, WireLimits};

    fn head_ctx() -> Context {
        let mut state = NodeState::new([2; 6]);
        state.battery_energy_kwh = 80.0;
        Context::new(ProtocolConfig::default(), state)
    }

    fn capacity(slots: usize) -> ProviderCapacity {
        ProviderCapacity {
            available_slots: slots,
            shareable_kwh: 40.0,
            meeting_point: (1000.0, 0.0),
            bandwidth_kw: 50.0,
            direction: (1.0, 0.0),
            platoon: Some(([7; 6], vec![[2; 6]])),
        }
    }

    fn offer_from(consumer: u8, energy: f32) -> (Header, JoinOffer) {
        (
            Header {
                msg_type: MsgType::JoinOffer,
                ttl: 1,
                seq_num: 42,
                sender_id: [consumer; 6],
                payload_len: 0,
            },
            JoinOffer {
                consumer_id: [consumer; 6],
                provider_id: [2; 6],
                energy_required_kwh: energy,
                position: (900.0, 0.0),
                trajectory: (9000.0, 0.0),
                meeting_point: (1000.0, 0.0),
            },
        )
    }

    #[test]
    fn test_window_opens_with_capacity() {
        let mut ctx = head_ctx();
        let mut side = ProviderSide::new();
        side.tick(&mut ctx, &capacity(3));
        assert_eq!(side.phase(), ProviderPhase::WaitOffers);

        let mut side2 = ProviderSide::new();
        side2.tick(&mut ctx, &capacity(0));
        assert_eq!(side2.phase(), ProviderPhase::Announce);
    }

    #[test]
    fn test_offer_collected_then_accepted_after_window() {
        let mut ctx = head_ctx();
        let mut side = ProviderSide::new();
        side.tick(&mut ctx, &capacity(3));

        let (header, offer) = offer_from(5, 20.0);
        side.handle_join_offer(&mut ctx, &header, &offer, &capacity(3));
        assert_eq!(side.pending_count(), 1);

        // Window still open: nothing sent yet.
        side.tick(&mut ctx, &capacity(3));
        assert!(ctx.take_outgoing().is_empty());

        // offer_window = 3.0 s.
        ctx.update_time(3.0).unwrap();
        side.tick(&mut ctx, &capacity(3));
        assert_eq!(side.phase(), ProviderPhase::WaitAck);
        let out = ctx.take_outgoing();
        assert_eq!(out.len(), 1);
        let frame = Frame::decode(&out[0], &WireLimits::default()).unwrap();
        assert_eq!(frame.header.msg_type, MsgType::JoinAccept);
        match frame.body {
            Message::JoinAccept(a) => {
                assert_eq!(a.consumer_id, [5; 6]);
                assert_eq!(a.platoon_id, Some([7; 6]));
                assert!(a.duration_s > 0.0);
            }
            other => panic!("expected JoinAccept, got {:?}", other),
        }
    }

    #[test]
    fn test_ack_books_session_and_reports_member() {
        let mut ctx = head_ctx();
        let mut side = ProviderSide::new();
        side.tick(&mut ctx, &capacity(3));
        let (header, offer) = offer_from(5, 20.0);
        side.handle_join_offer(&mut ctx, &header, &offer, &capacity(3));
        ctx.update_time(3.0).unwrap();
        side.tick(&mut ctx, &capacity(3));
        ctx.take_outgoing();

        ctx.update_time(3.2).unwrap();
        let booked = side.handle_ack(&mut ctx, &[5; 6], &[2; 6]).unwrap();
        assert_eq!(booked.consumer_id, [5; 6]);
        assert!((booked.energy_required_kwh - 20.0).abs() < 1e-6);

        let out = ctx.take_outgoing();
        assert_eq!(out.len(), 1);
        let frame = Frame::decode(&out[0], &WireLimits::default()).unwrap();
        assert_eq!(frame.header.msg_type, MsgType::AckAck);

        assert_eq!(side.phase(), ProviderPhase::Charge);
        let session = side.session_for(&[5; 6]).unwrap();
        assert_eq!(session.state, SessionState::Allocated);
        assert_eq!(session.id.seq, 42);
        assert_eq!(ctx.metrics.sessions_booked, 1);
    }

    #[test]
    fn test_ack_timeout_returns_capacity() {
        let mut ctx = head_ctx();
        let mut side = ProviderSide::new();
        side.tick(&mut ctx, &capacity(3));
        let (header, offer) = offer_from(5, 20.0);
        side.handle_join_offer(&mut ctx, &header, &offer, &capacity(3));
        ctx.update_time(3.0).unwrap();
        side.tick(&mut ctx, &capacity(3));
        ctx.take_outgoing();

        // join_accept_timeout = 5.0 after the accept at t=3.0.
        ctx.update_time(8.0).unwrap();
        side.tick(&mut ctx, &capacity(3));
        assert_eq!(ctx.metrics.ack_timeouts, 1);
        assert_eq!(side.phase(), ProviderPhase::Announce);
        assert_eq!(side.pending_count(), 0);
        assert_eq!(side.active_session_count(), 0);
    }

    #[test]
    fn test_no_capacity_refuses_silently() {
        let mut ctx = head_ctx();
        let mut side = ProviderSide::new();
        let (header, offer) = offer_from(5, 20.0);
        side.handle_join_offer(&mut ctx, &header, &offer, &capacity(0));
        assert_eq!(side.pending_count(), 0);
        assert_eq!(ctx.metrics.capacity_refusals, 1);
        assert!(ctx.take_outgoing().is_empty());
    }

    #[test]
    fn test_misaddressed_offer_ignored() {
        let mut ctx = head_ctx();
        let mut side = ProviderSide::new();
        let (header, mut offer) = offer_from(5, 20.0);
        offer.provider_id = [99; 6];
        side.handle_join_offer(&mut ctx, &header, &offer, &capacity(3));
        assert_eq!(side.pending_count(), 0);
        assert_eq!(ctx.metrics.dropped_unrelated, 1);
    }

    #[test]
    fn test_best_offer_wins_alignment() {
        let mut ctx = head_ctx();
        let mut side = ProviderSide::new();
        side.tick(&mut ctx, &capacity(3));

        // Consumer 5 heads the same way; consumer 4 the opposite way.
        let (h5, o5) = offer_from(5, 20.0);
        let (h4, mut o4) = offer_from(4, 20.0);
        o4.trajectory = (-9000.0, 0.0);
        side.handle_join_offer(&mut ctx, &h5, &o5, &capacity(3));
        side.handle_join_offer(&mut ctx, &h4, &o4, &capacity(3));

        ctx.update_time(3.0).unwrap();
        side.tick(&mut ctx, &capacity(3));
        let out = ctx.take_outgoing();
        let frame = Frame::decode(&out[0], &WireLimits::default()).unwrap();
        match frame.body {
            Message::JoinAccept(a) => assert_eq!(a.consumer_id, [5; 6]),
            other => panic!("expected JoinAccept, got {:?}", other),
        }
    }

    #[test]
    fn test_cancel_all_on_role_switch() {
        let mut ctx = head_ctx();
        let mut side = ProviderSide::new();
        side.tick(&mut ctx, &capacity(3));
        let (header, offer) = offer_from(5, 20.0);
        side.handle_join_offer(&mut ctx, &header, &offer, &capacity(3));

        side.cancel_all(&mut ctx, FailReason::RoleSwitched);
        assert_eq!(side.phase(), ProviderPhase::Announce);
        assert_eq!(side.pending_count(), 0);
        assert_eq!(ctx.metrics.role_switch_cancellations, 1);
    }
}
