//! Layer C, RREH side: a stationary hub with a FIFO admission queue.
//!
//! Same handshake shape as the mobile provider but no selection policy:
//! consumers are served in arrival order. GRID_STATUS broadcasts carry the
//! hub's power budget and queue estimate; operational-state degradations
//! emit one immediately.

use std::collections::VecDeque;

use hashbrown::HashMap;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::session::{Session, SessionId, SessionState};
use crate::types::{short_id, FailReason, NodeId, OperationalState, Position};
use crate::wire::{AckAck, GridStatus, Header, JoinAccept, JoinOffer, Message};

/// Upper bound on queued consumers; beyond it offers are refused.
const MAX_QUEUE: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RrehPhase {
    /// Broadcasting status, waiting for capacity to open a window.
    Announce,
    /// Collecting offers.
    WaitOffers,
    /// JOIN_ACCEPT sent to the queue head, waiting for ACK.
    WaitAck,
    /// At least one active charging session.
    ChargeSession,
    /// Queue empty, sessions idle.
    Idle,
}

#[derive(Clone, Debug)]
struct QueuedConsumer {
    consumer_id: NodeId,
    offer_seq: u32,
    energy_required_kwh: f64,
    position: Position,
}

/// RREH Layer C state.
pub struct Rreh {
    phase: RrehPhase,
    queue: VecDeque<QueuedConsumer>,
    sessions: HashMap<NodeId, Session>,
    window_start: f64,
    current_target: Option<NodeId>,
    ack_deadline: f64,
    last_grid_status: Option<f64>,

    pub operational_state: OperationalState,
    pub renewable_fraction: f64,
    pub available_power_kw: f64,
    pub max_sessions: u8,
}

impl Rreh {
    pub fn new() -> Self {
        Self {
            phase: RrehPhase::Announce,
            queue: VecDeque::new(),
            sessions: HashMap::new(),
            window_start: 0.0,
            current_target: None,
            ack_deadline: 0.0,
            last_grid_status: None,
            operational_state: OperationalState::Normal,
            renewable_fraction: 1.0,
            available_power_kw: 150.0,
            max_sessions: 4,
        }
    }

    pub fn phase(&self) -> RrehPhase {
        self.phase
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_for(&self, consumer: &NodeId) -> Option<&Session> {
        self.sessions.get(consumer)
    }

    fn has_capacity(&self) -> bool {
        (self.sessions.len() as u8) < self.max_sessions
            && self.operational_state.accepts_sessions()
    }

    /// Wait estimate for a newly arriving consumer: zero while a slot is
    /// free, otherwise sessions times the average session length.
    pub fn queue_time(&self, ctx: &Context) -> f64 {
        if self.has_capacity() {
            return 0.0;
        }
        let estimate =
            self.sessions.len() as f64 * ctx.config.rreh_avg_session_duration;
        estimate.min(ctx.config.max_acceptable_queue_time)
    }

    /// Periodic work. `neighbor_count` feeds the GRID_STATUS TTL policy.
    pub fn tick(&mut self, ctx: &mut Context, neighbor_count: usize) {
        let now = ctx.current_time();
        self.broadcast_if_due(ctx, neighbor_count, now);

        match self.phase {
            RrehPhase::Announce => {
                if self.has_capacity() {
                    self.phase = RrehPhase::WaitOffers;
                    self.window_start = now;
                }
            }
            RrehPhase::WaitOffers => {
                if now - self.window_start >= ctx.config.offer_window {
                    if self.queue.is_empty() {
                        self.phase = RrehPhase::Idle;
                    } else {
                        self.serve_next(ctx);
                    }
                }
            }
            RrehPhase::WaitAck => {
                if now >= self.ack_deadline {
                    self.on_ack_timeout(ctx);
                }
            }
            RrehPhase::ChargeSession | RrehPhase::Idle => {
                if self.has_capacity() && !self.queue.is_empty() {
                    self.serve_next(ctx);
                }
            }
        }
    }

    fn broadcast_if_due(&mut self, ctx: &mut Context, neighbor_count: usize, now: f64) {
        let due = match self.last_grid_status {
            None => true,
            Some(last) => now - last >= ctx.config.grid_status_interval,
        };
        if due {
            self.emit_grid_status(ctx, neighbor_count);
            self.last_grid_status = Some(now);
        }
    }

    fn emit_grid_status(&self, ctx: &mut Context, neighbor_count: usize) {
        let queue_time = self.queue_time(ctx);
        let ttl = ctx.config.effective_pa_ttl(neighbor_count);
        let hub_id = ctx.state.id;
        ctx.emit(
            ttl,
            Message::GridStatus(GridStatus {
                hub_id,
                renewable_fraction: self.renewable_fraction as f32,
                available_power_kw: self.available_power_kw as f32,
                max_sessions: self.max_sessions,
                queue_time_s: queue_time as f32,
                operational_state: self.operational_state,
                previous_hop: hub_id,
            }),
        );
    }

    /// Change the operational state. Degradations announce immediately.
    pub fn set_operational_state(
        &mut self,
        ctx: &mut Context,
        neighbor_count: usize,
        state: OperationalState,
    ) {
        if state == self.operational_state {
            return;
        }
        self.operational_state = state;
        info!(state = ?state, "operational state changed");
        if !state.accepts_sessions() || state == OperationalState::Congested {
            self.emit_grid_status(ctx, neighbor_count);
            self.last_grid_status = Some(ctx.current_time());
        }
    }

    /// Queue a JOIN_OFFER addressed to this hub, in arrival order.
    pub fn handle_join_offer(&mut self, ctx: &mut Context, header: &Header, offer: &JoinOffer) {
        if offer.provider_id != ctx.state.id {
            ctx.metrics.dropped_unrelated += 1;
            return;
        }
        if !self.operational_state.accepts_sessions() || self.queue.len() >= MAX_QUEUE {
            ctx.metrics.capacity_refusals += 1;
            debug!(
                consumer = %short_id(&offer.consumer_id),
                "offer refused, queue closed"
            );
            return;
        }
        if self.sessions.contains_key(&offer.consumer_id)
            || self
                .queue
                .iter()
                .any(|q| q.consumer_id == offer.consumer_id)
        {
            return;
        }

        self.queue.push_back(QueuedConsumer {
            consumer_id: offer.consumer_id,
            offer_seq: header.seq_num,
            energy_required_kwh: offer.energy_required_kwh as f64,
            position: (offer.position.0 as f64, offer.position.1 as f64),
        });
        info!(
            consumer = %short_id(&offer.consumer_id),
            queue_pos = self.queue.len(),
            "rx join offer"
        );

        if self.phase == RrehPhase::Idle {
            self.serve_next_if_capacity(ctx);
        }
    }

    fn serve_next_if_capacity(&mut self, ctx: &mut Context) {
        if self.has_capacity() && !self.queue.is_empty() {
            self.serve_next(ctx);
        }
    }

    /// FIFO: accept the consumer at the head of the queue.
    fn serve_next(&mut self, ctx: &mut Context) {
        let Some(front) = self.queue.front().cloned() else {
            return;
        };
        let now = ctx.current_time();
        let duration_s = if self.available_power_kw > 0.0 {
            front.energy_required_kwh / self.available_power_kw * 3600.0
        } else {
            0.0
        };
        let hub = ctx.state.id;
        let meeting = ctx.state.position;
        ctx.emit(
            1,
            Message::JoinAccept(JoinAccept {
                provider_id: hub,
                consumer_id: front.consumer_id,
                meeting_point: (meeting.0 as f32, meeting.1 as f32),
                bandwidth_kw: self.available_power_kw as f32,
                duration_s: duration_s as f32,
                platoon_id: None,
                members: Vec::new(),
            }),
        );
        info!(consumer = %short_id(&front.consumer_id), "tx join accept");

        self.current_target = Some(front.consumer_id);
        self.ack_deadline = now + ctx.config.join_accept_timeout;
        self.phase = RrehPhase::WaitAck;
    }

    /// ACK from the consumer being served: confirm and start the session.
    pub fn handle_ack(&mut self, ctx: &mut Context, consumer_id: &NodeId, provider_id: &NodeId) {
        if self.phase != RrehPhase::WaitAck {
            return;
        }
        if *provider_id != ctx.state.id || Some(*consumer_id) != self.current_target {
            ctx.metrics.dropped_unrelated += 1;
            return;
        }
        let Some(pos) = self
            .queue
            .iter()
            .position(|q| q.consumer_id == *consumer_id)
        else {
            return;
        };
        let Some(queued) = self.queue.remove(pos) else {
            return;
        };

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
                seq: queued.offer_seq,
            },
            queued.energy_required_kwh,
            queued.position,
        );
        session.state = SessionState::Charging;
        self.sessions.insert(*consumer_id, session);
        ctx.metrics.sessions_booked += 1;
        info!(consumer = %short_id(consumer_id), "session started, tx ackack");

        self.current_target = None;
        // Anyone still queued is served from here on the following ticks.
        self.phase = RrehPhase::ChargeSession;
    }

    fn on_ack_timeout(&mut self, ctx: &mut Context) {
        if let Some(target) = self.current_target.take() {
            warn!(consumer = %short_id(&target), "ack timed out");
            self.queue.retain(|q| q.consumer_id != target);
            ctx.metrics.ack_timeouts += 1;
            ctx.metrics.sessions_failed += 1;
        }
        self.phase = if self.queue.is_empty() {
            if self.sessions.is_empty() {
                RrehPhase::Idle
            } else {
                RrehPhase::ChargeSession
            }
        } else {
            // Next in line is served on the following tick.
            RrehPhase::Idle
        };
    }

    /// Charging finished; free the slot.
    pub fn complete_session(&mut self, consumer: &NodeId) {
        if self.sessions.remove(consumer).is_some() {
            debug!(consumer = %short_id(consumer), "session complete");
        }
        if self.sessions.is_empty() && self.phase == RrehPhase::ChargeSession {
            self.phase = RrehPhase::Idle;
        }
    }

    /// Cancel everything pending (used if the hub is torn down).
    pub fn cancel_all(&mut self, ctx: &mut Context, reason: FailReason) {
        for session in self.sessions.values_mut() {
            if !session.is_terminal() {
                session.fail(reason);
                ctx.metrics.sessions_failed += 1;
            }
        }
        self.queue.clear();
        self.sessions.clear();
        self.current_target = None;
        self.phase = RrehPhase::Announce;
    }
}

impl Default for Rreh {
    fn default() -> Self {
        Self::new()
    }
}
