//! Layer C, consumer side: provider discovery, ranking, and the four-way
//! booking handshake.
//!
//! The machine walks DISCOVER → EVALUATE → SEND_OFFER → WAIT_ACCEPT → ACK
//! → WAIT_ACKACK → ALLOCATED → TRAVEL → CHARGE → LEAVE. Send states are
//! transient; deadlines on the wait states are absolute simulation times
//! checked on every tick.

use hashbrown::HashMap;
use tracing::{debug, info, warn};

use crate::announce::{ProviderEntry, ProviderTable};
use crate::context::Context;
use crate::platoon::PlatoonEntry;
use crate::session::{Session, SessionId, SessionState};
use crate::types::{
    distance_km, dot, short_id, FailReason, NodeId, PlatoonId, Position, ProviderType,
};
use crate::wire::{Ack, JoinAccept, JoinOffer, Message};

/// Consumer phases. `SendOffer` and `SendAck` never persist across an
/// entry point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumerPhase {
    Discover,
    Evaluate,
    SendOffer,
    WaitAccept,
    SendAck,
    WaitAckAck,
    Allocated,
    Travel,
    Charge,
    Leave,
}

/// Everything the policy computed about one candidate.
#[derive(Clone, Debug)]
pub struct ProviderEvaluation {
    pub provider_id: NodeId,
    pub is_rreh: bool,
    pub position: Position,
    pub direct_cost: f64,
    pub provider_cost: f64,
    pub detour_cost: f64,
    pub detour_pct: f64,
    pub route_alignment: f64,
    pub queue_penalty: f64,
    pub green_bonus: f64,
    pub total_cost: f64,
}

/// Consumer-side Layer C state.
pub struct Consumer {
    phase: ConsumerPhase,
    session: Option<Session>,
    /// Providers that recently failed a handshake, with expiry times.
    blacklist: HashMap<NodeId, f64>,
    /// Platoon join details from the accepted provider, if it was a head.
    accepted_platoon: Option<(PlatoonId, NodeId)>,
}

impl Consumer {
    pub fn new() -> Self {
        Self {
            phase: ConsumerPhase::Discover,
            session: None,
            blacklist: HashMap::new(),
            accepted_platoon: None,
        }
    }

    pub fn phase(&self) -> ConsumerPhase {
        self.phase
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// A session is in flight or booked; blocks a switch to provider roles.
    pub fn session_active(&self) -> bool {
        matches!(
            self.phase,
            ConsumerPhase::WaitAccept
                | ConsumerPhase::WaitAckAck
                | ConsumerPhase::Allocated
                | ConsumerPhase::Travel
                | ConsumerPhase::Charge
        )
    }

    /// Periodic work: deadlines first, then phase progress.
    pub fn tick(
        &mut self,
        ctx: &mut Context,
        providers: &ProviderTable,
        platoons: &[PlatoonEntry],
    ) {
        let now = ctx.current_time();
        self.expire_blacklist(now);

        match self.phase {
            ConsumerPhase::Discover => self.run_discover(ctx, providers, platoons),
            ConsumerPhase::Evaluate => self.run_evaluate(ctx, providers, platoons),
            ConsumerPhase::WaitAccept => {
                if self.session.as_ref().is_some_and(|s| s.deadline_passed(now)) {
                    self.on_accept_timeout(ctx, providers);
                    // Re-enter EVALUATE immediately with the shrunk table.
                    self.run_evaluate(ctx, providers, platoons);
                }
            }
            ConsumerPhase::WaitAckAck => {
                if self.session.as_ref().is_some_and(|s| s.deadline_passed(now)) {
                    self.on_ackack_timeout(ctx, providers);
                }
            }
            // Travel/charge/leave progress on mobility pushes, not ticks.
            _ => {}
        }
    }

    fn run_discover(
        &mut self,
        ctx: &mut Context,
        providers: &ProviderTable,
        platoons: &[PlatoonEntry],
    ) {
        if !ctx.state.needs_charge(&ctx.config) {
            return;
        }
        let now = ctx.current_time();
        let any = self
            .candidates(ctx, providers, platoons)
            .into_iter()
            .any(|c| !self.is_blacklisted(&c.provider_id, now));
        if any {
            self.phase = ConsumerPhase::Evaluate;
        }
    }

    fn run_evaluate(
        &mut self,
        ctx: &mut Context,
        providers: &ProviderTable,
        platoons: &[PlatoonEntry],
    ) {
        let now = ctx.current_time();
        let candidates: Vec<ProviderEntry> = self
            .candidates(ctx, providers, platoons)
            .into_iter()
            .filter(|c| !self.is_blacklisted(&c.provider_id, now))
            .collect();

        let Some(best) = self.select_best(ctx, &candidates) else {
            self.phase = ConsumerPhase::Discover;
            return;
        };

        info!(
            provider = %short_id(&best.provider_id),
            rreh = best.is_rreh,
            detour_kwh = best.detour_cost,
            total_cost = best.total_cost,
            "provider selected"
        );

        self.phase = ConsumerPhase::SendOffer;
        self.send_offer(ctx, &best);
    }

    /// Merge the provider table with platoons discovered through
    /// PLATOON_ANNOUNCE that the table has not seen.
    fn candidates(
        &self,
        ctx: &Context,
        providers: &ProviderTable,
        platoons: &[PlatoonEntry],
    ) -> Vec<ProviderEntry> {
        let mut out: Vec<ProviderEntry> = providers
            .all()
            .into_iter()
            .filter(|p| p.provider_id != ctx.state.id && p.has_capacity())
            .collect();
        for p in platoons {
            if p.head_id == ctx.state.id || p.available_slots == 0 {
                continue;
            }
            if out.iter().any(|e| e.provider_id == p.head_id) {
                continue;
            }
            out.push(ProviderEntry {
                provider_id: p.head_id,
                provider_type: ProviderType::PlatoonHead,
                position: p.position,
                destination: p.destination,
                direction: p.direction,
                platoon_size: 0,
                available_slots: p.available_slots,
                energy_available_kwh: p.surplus_energy_kwh,
                renewable_fraction: 0.0,
                last_seen: p.last_seen,
                queue_time_s: 0.0,
                operational_state: crate::types::OperationalState::Normal,
                available_power_kw: 0.0,
                max_sessions: 1,
            });
        }
        out.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        out
    }

    /// Energy this consumer must book: deficit to finish the trip plus a
    /// small charging buffer.
    fn energy_required(&self, ctx: &Context) -> f64 {
        let state = &ctx.state;
        let needed = state.energy_to_destination(&ctx.config) + state.min_energy_kwh;
        let deficit = (needed - state.battery_energy_kwh).max(0.0);
        deficit + 5.0
    }

    /// Evaluate one candidate against the policy.
    pub fn evaluate(&self, ctx: &Context, provider: &ProviderEntry) -> ProviderEvaluation {
        let state = &ctx.state;
        let config = &ctx.config;

        let direct_cost = state.energy_to_destination(config);
        let to_provider = state.energy_to(provider.position, config);
        let onward = match state.destination {
            Some(dest) => {
                distance_km(provider.position, dest) * config.energy_consumption_rate_kwh_per_km
            }
            None => 0.0,
        };
        let provider_cost = to_provider + onward;
        let detour_cost = provider_cost - direct_cost;
        let detour_pct = if direct_cost > 0.0 {
            detour_cost / direct_cost
        } else if detour_cost <= 0.0 {
            0.0
        } else {
            f64::INFINITY
        };

        let route_alignment = dot(state.direction_vector(), provider.direction);
        let is_rreh = provider.is_rreh();
        let queue_penalty = if is_rreh {
            provider.queue_time_s * config.queue_time_weight
        } else {
            0.0
        };
        let green_bonus = provider.renewable_fraction * config.green_bonus_weight;
        let total_cost = detour_cost + queue_penalty - green_bonus;

        ProviderEvaluation {
            provider_id: provider.provider_id,
            is_rreh,
            position: provider.position,
            direct_cost,
            provider_cost,
            detour_cost,
            detour_pct,
            route_alignment,
            queue_penalty,
            green_bonus,
            total_cost,
        }
    }

    /// Battery urgency: how far the battery reaches relative to the trip.
    /// Below 1.0 the destination is out of range without charging.
    fn urgency_ratio(&self, ctx: &Context) -> f64 {
        let state = &ctx.state;
        let Some(dest) = state.destination else {
            return f64::INFINITY;
        };
        let range_km =
            state.battery_energy_kwh / ctx.config.energy_consumption_rate_kwh_per_km;
        let dist_km = distance_km(state.position, dest);
        if dist_km < f64::EPSILON {
            return f64::INFINITY;
        }
        range_km / dist_km
    }

    /// Detour tolerance grows as the battery gets desperate.
    fn dynamic_threshold(&self, ctx: &Context) -> f64 {
        let urgency = self.urgency_ratio(ctx);
        let config = &ctx.config;
        if urgency < config.urgency_critical {
            config.threshold_critical
        } else if urgency < config.urgency_low {
            config.threshold_low
        } else {
            config.threshold_healthy
        }
    }

    /// Pick the best candidate. RREHs win while their detour stays inside
    /// the dynamic threshold; otherwise the cheapest total cost wins, with
    /// a platoon fallback on critical battery. Ties break on provider id.
    fn select_best(
        &self,
        ctx: &Context,
        candidates: &[ProviderEntry],
    ) -> Option<ProviderEvaluation> {
        let evaluations: Vec<ProviderEvaluation> =
            candidates.iter().map(|c| self.evaluate(ctx, c)).collect();
        if evaluations.is_empty() {
            return None;
        }

        let cheaper = |a: &ProviderEvaluation, b: &ProviderEvaluation| {
            a.total_cost
                .total_cmp(&b.total_cost)
                .then_with(|| a.provider_id.cmp(&b.provider_id))
        };
        let best_rreh = evaluations
            .iter()
            .filter(|e| e.is_rreh)
            .min_by(|a, b| cheaper(a, b))
            .cloned();
        let best_mobile = evaluations
            .iter()
            .filter(|e| !e.is_rreh)
            .min_by(|a, b| cheaper(a, b))
            .cloned();

        match (best_rreh, best_mobile) {
            (Some(rreh), None) => Some(rreh),
            (None, mobile) => mobile,
            (Some(rreh), Some(mobile)) => {
                let threshold = self.dynamic_threshold(ctx);
                if rreh.detour_pct <= threshold {
                    return Some(rreh);
                }
                if mobile.total_cost < rreh.total_cost {
                    return Some(mobile);
                }
                if self.urgency_ratio(ctx) < ctx.config.urgency_critical {
                    return Some(mobile);
                }
                Some(rreh)
            }
        }
    }

    fn send_offer(&mut self, ctx: &mut Context, best: &ProviderEvaluation) {
        let now = ctx.current_time();
        let energy = self.energy_required(ctx);
        let state = &ctx.state;
        let trajectory = state.destination.unwrap_or(state.position);

        let offer = JoinOffer {
            consumer_id: state.id,
            provider_id: best.provider_id,
            energy_required_kwh: energy as f32,
            position: (state.position.0 as f32, state.position.1 as f32),
            trajectory: (trajectory.0 as f32, trajectory.1 as f32),
            meeting_point: (best.position.0 as f32, best.position.1 as f32),
        };
        ctx.emit(1, Message::JoinOffer(offer));

        // The emitted frame's seq identifies the session on both ends.
        let seq = ctx.last_seq();
        let mut session = Session::new(
            SessionId {
                consumer: ctx.state.id,
                provider: best.provider_id,
                seq,
            },
            energy,
            best.position,
        );
        session.wait(
            SessionState::PendingAccept,
            now + ctx.config.join_accept_timeout,
        );
        self.session = Some(session);
        self.phase = ConsumerPhase::WaitAccept;

        info!(
            provider = %short_id(&best.provider_id),
            energy_kwh = energy,
            "tx join offer"
        );
    }

    /// JOIN_ACCEPT from the provider we offered to.
    pub fn handle_join_accept(&mut self, ctx: &mut Context, accept: &JoinAccept) {
        if self.phase != ConsumerPhase::WaitAccept {
            return;
        }
        if accept.consumer_id != ctx.state.id {
            ctx.metrics.dropped_unrelated += 1;
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if accept.provider_id != session.id.provider {
            ctx.metrics.dropped_unrelated += 1;
            debug!(
                from = %short_id(&accept.provider_id),
                "accept from wrong provider"
            );
            return;
        }

        session.meeting_point = (
            accept.meeting_point.0 as f64,
            accept.meeting_point.1 as f64,
        );
        session.bandwidth_kw = accept.bandwidth_kw as f64;
        session.duration_s = accept.duration_s as f64;
        self.accepted_platoon = accept
            .platoon_id
            .map(|pid| (pid, accept.provider_id));

        info!(provider = %short_id(&accept.provider_id), "rx join accept");

        self.phase = ConsumerPhase::SendAck;
        let now = ctx.current_time();
        let provider = session.id.provider;
        let consumer = session.id.consumer;
        session.wait(
            SessionState::PendingAckAck,
            now + ctx.config.join_accept_timeout,
        );
        ctx.emit(
            1,
            Message::Ack(Ack {
                consumer_id: consumer,
                provider_id: provider,
            }),
        );
        self.phase = ConsumerPhase::WaitAckAck;
    }

    /// ACKACK closes the handshake: the booking holds on both ends.
    /// Returns platoon join details when the provider was a platoon head.
    pub fn handle_ackack(
        &mut self,
        ctx: &mut Context,
        provider_id: &NodeId,
        consumer_id: &NodeId,
    ) -> Option<(PlatoonId, NodeId)> {
        if self.phase != ConsumerPhase::WaitAckAck {
            return None;
        }
        if *consumer_id != ctx.state.id {
            ctx.metrics.dropped_unrelated += 1;
            return None;
        }
        let Some(session) = self.session.as_mut() else {
            return None;
        };
        if *provider_id != session.id.provider {
            ctx.metrics.dropped_unrelated += 1;
            return None;
        }

        session.allocate();
        self.phase = ConsumerPhase::Allocated;
        ctx.metrics.sessions_booked += 1;
        info!(provider = %short_id(provider_id), "session booked");
        self.accepted_platoon.take()
    }

    fn on_accept_timeout(&mut self, ctx: &mut Context, providers: &ProviderTable) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let provider = session.id.provider;
        session.fail(FailReason::AcceptTimeout);
        ctx.metrics.accept_timeouts += 1;
        ctx.metrics.sessions_failed += 1;

        // The silent provider leaves the table and rests on the blacklist
        // so the next PA does not immediately re-select it.
        providers.remove(&provider);
        let until = ctx.current_time() + ctx.config.blacklist_duration;
        self.blacklist.insert(provider, until);

        warn!(provider = %short_id(&provider), "join accept timed out");
        self.session = None;
        self.phase = ConsumerPhase::Evaluate;
    }

    fn on_ackack_timeout(&mut self, ctx: &mut Context, providers: &ProviderTable) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let provider = session.id.provider;
        session.fail(FailReason::AckAckTimeout);
        ctx.metrics.ackack_timeouts += 1;
        ctx.metrics.sessions_failed += 1;

        providers.remove(&provider);
        let until = ctx.current_time() + ctx.config.blacklist_duration;
        self.blacklist.insert(provider, until);

        warn!(provider = %short_id(&provider), "ackack timed out");
        self.session = None;
        self.accepted_platoon = None;
        self.phase = ConsumerPhase::Discover;
    }

    /// Cancel whatever is pending; used on role switches.
    pub fn cancel(&mut self, ctx: &mut Context, reason: FailReason) {
        if let Some(session) = self.session.as_mut() {
            if session.is_pending() || session.state == SessionState::Allocated {
                session.fail(reason);
                ctx.metrics.sessions_failed += 1;
                if reason == FailReason::RoleSwitched {
                    ctx.metrics.role_switch_cancellations += 1;
                }
            }
        }
        self.session = None;
        self.accepted_platoon = None;
        self.phase = ConsumerPhase::Discover;
    }

    /// Mobility collaborator reached the meeting point etc.
    pub fn start_travel(&mut self) {
        if self.phase == ConsumerPhase::Allocated {
            if let Some(s) = self.session.as_mut() {
                s.state = SessionState::Travel;
            }
            self.phase = ConsumerPhase::Travel;
        }
    }

    pub fn start_charging(&mut self) {
        if self.phase == ConsumerPhase::Travel {
            if let Some(s) = self.session.as_mut() {
                s.state = SessionState::Charging;
            }
            self.phase = ConsumerPhase::Charge;
        }
    }

    /// Session over: record it and return to discovery.
    pub fn finish_charging(&mut self) {
        if self.phase == ConsumerPhase::Charge {
            if let Some(s) = self.session.as_mut() {
                s.state = SessionState::Done;
            }
            self.phase = ConsumerPhase::Leave;
            self.session = None;
            self.blacklist.clear();
            self.phase = ConsumerPhase::Discover;
        }
    }

    fn is_blacklisted(&self, id: &NodeId, now: f64) -> bool {
        self.blacklist.get(id).is_some_and(|until| now < *until)
    }

    fn expire_blacklist(&mut self, now: f64) {
        self.blacklist.retain(|_, until| now < *until);
    }
}

impl Default for Consumer {
    fn default() -> Self {
        Self::new()
    }
}
