//! The protocol node: entry points and message dispatch.
//!
//! A node is a pure state machine driven by an external discrete-event
//! scheduler through `tick(t)` and `receive(frame, t)`, plus the mobility
//! collaborator's `apply_mobility_and_energy`. Both entry points advance
//! simulation time first; layers then run in the fixed order A, B, C, D.
//! Outbound frames accumulate internally and are drained with
//! `take_outgoing`.

use tracing::debug;

use crate::announce::{ProviderAnnouncements, ProviderTable};
use crate::config::{ConfigError, ProtocolConfig};
use crate::consumer::{Consumer, ConsumerPhase};
use crate::context::{Context, NodeState};
use crate::head::{ProviderCapacity, ProviderSide};
use crate::metrics::NodeMetrics;
use crate::neighbor::NeighborDiscovery;
use crate::platoon::{PlatoonCoordination, PlatoonEvent};
use crate::rreh::Rreh;
use crate::role::{self, RoleInputs};
use crate::session::Session;
use crate::types::{Error, FailReason, NodeId, NodeRole, Position, ProviderType, Velocity};
use crate::wire::{Frame, Message, PaEntry};

/// One protocol participant.
pub struct Node {
    ctx: Context,
    neighbors: NeighborDiscovery,
    announcements: ProviderAnnouncements,
    consumer: Consumer,
    provider: ProviderSide,
    rreh: Option<Rreh>,
    platoons: PlatoonCoordination,
}

impl Node {
    /// Build a node. The configuration is validated once here and is
    /// immutable afterwards.
    pub fn new(config: ProtocolConfig, state: NodeState) -> Result<Self, ConfigError> {
        config.validate()?;
        let rreh = (state.role == NodeRole::Rreh).then(Rreh::new);
        let dedup = config.dedup_cache_size;
        Ok(Self {
            ctx: Context::new(config, state),
            neighbors: NeighborDiscovery::new(),
            announcements: ProviderAnnouncements::new(dedup),
            consumer: Consumer::new(),
            provider: ProviderSide::new(),
            rreh,
            platoons: PlatoonCoordination::new(),
        })
    }

    // --- Inbound entry points ---

    /// Periodic tick from the orchestrator.
    pub fn tick(&mut self, t_now: f64) -> Result<(), Error> {
        self.ctx.update_time(t_now)?;

        // Role transitions happen at the tick boundary, before the layers
        // run, so the whole tick sees one role.
        self.run_role_manager();

        // Layer A: neighbor discovery.
        self.neighbors.tick(&mut self.ctx);

        // Layer B: provider announcements.
        let mpr_active = self.neighbors.is_mpr_active();
        let neighbor_count = self.neighbors.neighbor_count();
        let provider_neighbors = self.neighbors.provider_neighbors();
        let self_entry = self.self_pa_entry();
        self.announcements.tick(
            &mut self.ctx,
            mpr_active,
            neighbor_count,
            &provider_neighbors,
            self_entry,
        );

        // Layer C: the active role's charging machine.
        match self.ctx.state.role {
            NodeRole::Consumer => {
                let platoon_entries = self.platoons.table.entries();
                self.consumer
                    .tick(&mut self.ctx, &self.announcements.table, &platoon_entries);
            }
            NodeRole::PlatoonHead | NodeRole::MobileProvider => {
                let capacity = self.provider_capacity();
                self.provider.tick(&mut self.ctx, &capacity);
            }
            NodeRole::Rreh => {
                if let Some(rreh) = self.rreh.as_mut() {
                    rreh.tick(&mut self.ctx, neighbor_count);
                }
            }
            NodeRole::PlatoonMember => {}
        }

        // Layer D: platoon coordination.
        if let Some(event) = self.platoons.tick(&mut self.ctx) {
            self.apply_platoon_event(event);
        }
        Ok(())
    }

    /// Raw frame delivery from the PHY sink.
    pub fn receive(&mut self, frame: &[u8], event_time: f64) -> Result<(), Error> {
        self.ctx.update_time(event_time)?;

        let limits = self.ctx.config.wire_limits();
        let decoded = match Frame::decode(frame, &limits) {
            Ok(f) => f,
            Err(err) => {
                self.ctx.metrics.dropped_malformed += 1;
                debug!(?err, len = frame.len(), "drop malformed frame");
                return Ok(());
            }
        };
        let header = decoded.header;
        if header.sender_id == self.ctx.state.id {
            return Ok(()); // our own broadcast reflected back
        }
        self.ctx.metrics.received.record(header.msg_type);

        match &decoded.body {
            Message::Hello(hello) => {
                self.neighbors.handle_hello(&mut self.ctx, &header, hello);
            }
            Message::Pa(pa) => {
                let mpr_active = self.neighbors.is_mpr_active();
                let fresh = self.announcements.process_forwardable(
                    &mut self.ctx,
                    frame,
                    &header,
                    &pa.previous_hop,
                    mpr_active,
                );
                if fresh {
                    self.announcements.apply_pa(&mut self.ctx, pa);
                }
            }
            Message::GridStatus(gs) => {
                let mpr_active = self.neighbors.is_mpr_active();
                let fresh = self.announcements.process_forwardable(
                    &mut self.ctx,
                    frame,
                    &header,
                    &gs.previous_hop,
                    mpr_active,
                );
                if fresh {
                    self.announcements.apply_grid_status(&mut self.ctx, gs);
                }
            }
            Message::PlatoonAnnounce(ann) => {
                let mpr_active = self.neighbors.is_mpr_active();
                let fresh = self.announcements.process_forwardable(
                    &mut self.ctx,
                    frame,
                    &header,
                    &ann.previous_hop,
                    mpr_active,
                );
                if fresh {
                    self.platoons.handle_announce(&mut self.ctx, ann);
                }
            }
            Message::JoinOffer(offer) => match self.ctx.state.role {
                NodeRole::PlatoonHead | NodeRole::MobileProvider => {
                    let capacity = self.provider_capacity();
                    self.provider
                        .handle_join_offer(&mut self.ctx, &header, offer, &capacity);
                }
                NodeRole::Rreh => {
                    if let Some(rreh) = self.rreh.as_mut() {
                        rreh.handle_join_offer(&mut self.ctx, &header, offer);
                    }
                }
                _ => {
                    self.ctx.metrics.dropped_unrelated += 1;
                }
            },
            Message::JoinAccept(accept) => {
                self.consumer.handle_join_accept(&mut self.ctx, accept);
            }
            Message::Ack(ack) => match self.ctx.state.role {
                NodeRole::PlatoonHead | NodeRole::MobileProvider => {
                    let booked = self.provider.handle_ack(
                        &mut self.ctx,
                        &ack.consumer_id,
                        &ack.provider_id,
                    );
                    if let Some(booked) = booked {
                        if self.ctx.state.role == NodeRole::PlatoonHead {
                            self.platoons.admit_member(&self.ctx, &booked);
                        }
                    }
                }
                NodeRole::Rreh => {
                    if let Some(rreh) = self.rreh.as_mut() {
                        rreh.handle_ack(&mut self.ctx, &ack.consumer_id, &ack.provider_id);
                    }
                }
                _ => {
                    self.ctx.metrics.dropped_unrelated += 1;
                }
            },
            Message::AckAck(ackack) => {
                let joined = self.consumer.handle_ackack(
                    &mut self.ctx,
                    &ackack.provider_id,
                    &ackack.consumer_id,
                );
                if let Some((platoon_id, head_id)) = joined {
                    let now = self.ctx.current_time();
                    self.platoons.join_platoon(platoon_id, head_id, now);
                    self.ctx.state.role = NodeRole::PlatoonMember;
                }
            }
            Message::PlatoonBeacon(beacon) => {
                if let Some(event) = self.platoons.handle_beacon(&mut self.ctx, beacon) {
                    self.apply_platoon_event(event);
                }
            }
            Message::PlatoonStatus(status) => {
                self.platoons.handle_status(&mut self.ctx, status);
            }
        }
        Ok(())
    }

    /// Authoritative mobility/energy push from the mobility simulator.
    pub fn apply_mobility_and_energy(
        &mut self,
        t_now: f64,
        position: Position,
        velocity: Velocity,
        battery_kwh: f64,
    ) -> Result<(), Error> {
        self.ctx.update_time(t_now)?;
        let state = &mut self.ctx.state;
        state.position = position;
        state.velocity = velocity;
        state.battery_energy_kwh = battery_kwh.clamp(0.0, state.battery_capacity_kwh);
        Ok(())
    }

    // --- Role plumbing ---

    fn run_role_manager(&mut self) {
        let inputs = RoleInputs {
            in_platoon_as_member: self.platoons.in_platoon_as_member(),
            consumer_session_active: self.consumer.session_active(),
        };
        let Some((old, new)) = role::tick(&mut self.ctx, inputs) else {
            return;
        };

        // The departed role's pending work dies with it.
        match old {
            NodeRole::Consumer => {
                self.consumer.cancel(&mut self.ctx, FailReason::RoleSwitched);
            }
            NodeRole::PlatoonHead => {
                self.provider.cancel_all(&mut self.ctx, FailReason::RoleSwitched);
                // A departing head hands its platoon to the strongest
                // member before ceding, staying aboard unless it needs
                // charge itself. Only with no fit member does the platoon
                // dissolve (members then recover through beacon loss).
                let stay = !self.ctx.state.needs_charge(&self.ctx.config);
                match self.platoons.hand_off_platoon(&mut self.ctx, stay) {
                    Some(_) if stay => {
                        self.ctx.state.role = NodeRole::PlatoonMember;
                    }
                    Some(_) => {}
                    None => self.platoons.stop_platoon(),
                }
            }
            NodeRole::MobileProvider => {
                self.provider.cancel_all(&mut self.ctx, FailReason::RoleSwitched);
            }
            _ => {}
        }
        if new == NodeRole::PlatoonHead {
            self.platoons.start_platoon(&self.ctx);
        }
    }

    fn apply_platoon_event(&mut self, event: PlatoonEvent) {
        match event {
            PlatoonEvent::LeftPlatoon => {
                // Standalone again; the booked session died with the
                // beacons. The role manager refines this next tick.
                self.consumer.cancel(&mut self.ctx, FailReason::StaleBeacon);
                self.ctx.state.role = NodeRole::Consumer;
            }
            PlatoonEvent::PromotedToHead => {
                // The charging session that brought this node into the
                // platoon ended with the old head's tenure.
                self.consumer.cancel(&mut self.ctx, FailReason::RoleSwitched);
                self.ctx.state.role = NodeRole::PlatoonHead;
            }
            PlatoonEvent::HandedOffTo(_) => {
                self.provider.cancel_all(&mut self.ctx, FailReason::RoleSwitched);
                self.ctx.state.role = NodeRole::PlatoonMember;
            }
        }
    }

    /// The local PA entry, when this node currently provides energy.
    fn self_pa_entry(&self) -> Option<PaEntry> {
        let state = &self.ctx.state;
        let shareable = state.shareable_energy(&self.ctx.config);
        if !state.provider_capable || shareable <= 0.0 {
            return None;
        }
        let (provider_type, platoon_size, available_slots) = match state.role {
            NodeRole::PlatoonHead => {
                let platoon = self.platoons.platoon()?;
                (
                    ProviderType::PlatoonHead,
                    platoon.len() as u8,
                    platoon.available_slots(self.ctx.config.platoon_max_size) as u8,
                )
            }
            NodeRole::MobileProvider => (ProviderType::MobileProvider, 0, 0),
            _ => return None,
        };
        let destination = state.destination.unwrap_or(state.position);
        let direction = state.direction_vector();
        Some(PaEntry {
            provider_id: state.id,
            provider_type,
            position: (state.position.0 as f32, state.position.1 as f32),
            destination: (destination.0 as f32, destination.1 as f32),
            direction: (direction.0 as f32, direction.1 as f32),
            platoon_size,
            available_slots,
            energy_available_kwh: shareable as f32,
            renewable_fraction: 0.0,
        })
    }

    /// What the provider machine can promise right now.
    fn provider_capacity(&self) -> ProviderCapacity {
        let state = &self.ctx.state;
        let shareable = state.shareable_energy(&self.ctx.config).max(0.0);
        match state.role {
            NodeRole::PlatoonHead => {
                let (slots, platoon) = match self.platoons.platoon() {
                    Some(p) => (
                        p.available_slots(self.ctx.config.platoon_max_size),
                        Some((p.platoon_id, p.member_ids())),
                    ),
                    None => (0, None),
                };
                ProviderCapacity {
                    available_slots: slots,
                    shareable_kwh: shareable,
                    meeting_point: state.position,
                    bandwidth_kw: state.max_transfer_rate_out,
                    direction: state.direction_vector(),
                    platoon,
                }
            }
            NodeRole::MobileProvider => ProviderCapacity {
                available_slots: usize::from(self.provider.active_session_count() == 0),
                shareable_kwh: shareable,
                meeting_point: state.position,
                bandwidth_kw: state.max_transfer_rate_out,
                direction: state.direction_vector(),
                platoon: None,
            },
            _ => ProviderCapacity {
                available_slots: 0,
                shareable_kwh: 0.0,
                meeting_point: state.position,
                bandwidth_kw: 0.0,
                direction: (0.0, 0.0),
                platoon: None,
            },
        }
    }

    // --- Observation surface ---

    pub fn id(&self) -> NodeId {
        self.ctx.state.id
    }

    pub fn current_time(&self) -> f64 {
        self.ctx.current_time()
    }

    pub fn is_halted(&self) -> bool {
        self.ctx.is_halted()
    }

    pub fn role(&self) -> NodeRole {
        self.ctx.state.role
    }

    pub fn state(&self) -> &NodeState {
        &self.ctx.state
    }

    pub fn metrics(&self) -> &NodeMetrics {
        &self.ctx.metrics
    }

    /// Drain frames queued for the PHY sink.
    pub fn take_outgoing(&mut self) -> Vec<Vec<u8>> {
        self.ctx.take_outgoing()
    }

    pub fn neighbor_count(&self) -> usize {
        self.neighbors.neighbor_count()
    }

    pub fn has_neighbor(&self, id: &NodeId) -> bool {
        self.neighbors.contains(id)
    }

    pub fn neighbor_last_hello(&self, id: &NodeId) -> Option<f64> {
        self.neighbors.last_hello_time(id)
    }

    pub fn mpr_set(&self) -> std::collections::BTreeSet<NodeId> {
        self.neighbors.mpr_set()
    }

    pub fn is_mpr_active(&self) -> bool {
        self.neighbors.is_mpr_active()
    }

    pub fn provider_table(&self) -> &ProviderTable {
        &self.announcements.table
    }

    pub fn consumer_phase(&self) -> ConsumerPhase {
        self.consumer.phase()
    }

    pub fn consumer_session(&self) -> Option<&Session> {
        self.consumer.session()
    }

    pub fn provider_session_for(&self, consumer: &NodeId) -> Option<&Session> {
        self.provider.session_for(consumer)
    }

    pub fn platoons(&self) -> &PlatoonCoordination {
        &self.platoons
    }

    pub fn rreh(&self) -> Option<&Rreh> {
        self.rreh.as_ref()
    }

    pub fn rreh_mut(&mut self) -> Option<&mut Rreh> {
        self.rreh.as_mut()
    }

    /// Test/driver hooks for the mobility-driven session phases.
    pub fn consumer_start_travel(&mut self) {
        self.consumer.start_travel();
    }

    pub fn consumer_start_charging(&mut self) {
        self.consumer.start_charging();
    }

    pub fn consumer_finish_charging(&mut self) {
        self.consumer.finish_charging();
    }
}
