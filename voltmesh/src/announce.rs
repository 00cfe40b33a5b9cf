//! Layer B: provider announcement dissemination.
//!
//! MPR-active nodes originate PAs aggregating the providers they know and
//! forward PAs, GRID_STATUS and PLATOON_ANNOUNCE frames at most once per
//! `(originator, seq)`. Forwarding works on the raw frame bytes: only the
//! ttl byte and the PREVIOUS_HOP value change, so payloads survive the
//! trip untouched.

use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::context::Context;
use crate::neighbor::NeighborEntry;
use crate::types::{
    short_id, NodeId, OperationalState, Position, ProviderType,
};
use crate::wire::{forwarded_copy, GridStatus, Header, Message, Pa, PaEntry};

/// One known energy provider.
#[derive(Clone, Debug)]
pub struct ProviderEntry {
    pub provider_id: NodeId,
    pub provider_type: ProviderType,
    pub position: Position,
    pub destination: Position,
    pub direction: (f64, f64),
    pub platoon_size: u8,
    pub available_slots: u8,
    pub energy_available_kwh: f64,
    pub renewable_fraction: f64,
    pub last_seen: f64,

    // RREH detail learned from GRID_STATUS.
    pub queue_time_s: f64,
    pub operational_state: OperationalState,
    pub available_power_kw: f64,
    pub max_sessions: u8,
}

impl ProviderEntry {
    pub fn is_rreh(&self) -> bool {
        self.provider_type == ProviderType::Rreh
    }

    pub fn has_capacity(&self) -> bool {
        if self.is_rreh() {
            self.operational_state.accepts_sessions()
        } else {
            self.available_slots > 0 || self.provider_type == ProviderType::MobileProvider
        }
    }
}

/// Table of known providers, pruned after `provider_timeout` of silence.
pub struct ProviderTable {
    entries: RwLock<HashMap<NodeId, ProviderEntry>>,
}

impl ProviderTable {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Direct insert, used by the layer internals and tests.
    pub(crate) fn insert(&self, entry: ProviderEntry) {
        self.entries.write().insert(entry.provider_id, entry);
    }

    fn upsert_pa(&self, entry: &PaEntry, now: f64) {
        let mut entries = self.entries.write();
        let prev = entries.get(&entry.provider_id);
        let (queue_time_s, operational_state, available_power_kw, max_sessions) = prev
            .map(|p| {
                (
                    p.queue_time_s,
                    p.operational_state,
                    p.available_power_kw,
                    p.max_sessions,
                )
            })
            .unwrap_or((0.0, OperationalState::Normal, 0.0, 1));
        entries.insert(
            entry.provider_id,
            ProviderEntry {
                provider_id: entry.provider_id,
                provider_type: entry.provider_type,
                position: (entry.position.0 as f64, entry.position.1 as f64),
                destination: (entry.destination.0 as f64, entry.destination.1 as f64),
                direction: (entry.direction.0 as f64, entry.direction.1 as f64),
                platoon_size: entry.platoon_size,
                available_slots: entry.available_slots,
                energy_available_kwh: entry.energy_available_kwh as f64,
                renewable_fraction: entry.renewable_fraction as f64,
                last_seen: now,
                queue_time_s,
                operational_state,
                available_power_kw,
                max_sessions,
            },
        );
    }

    fn upsert_grid_status(&self, gs: &GridStatus, now: f64) {
        let mut entries = self.entries.write();
        let position = entries
            .get(&gs.hub_id)
            .map(|p| p.position)
            .unwrap_or((0.0, 0.0));
        let prev = entries.get(&gs.hub_id);
        let (destination, direction) = prev
            .map(|p| (p.destination, p.direction))
            .unwrap_or((position, (0.0, 0.0)));
        entries.insert(
            gs.hub_id,
            ProviderEntry {
                provider_id: gs.hub_id,
                provider_type: ProviderType::Rreh,
                position,
                destination,
                direction,
                platoon_size: 0,
                available_slots: 0,
                energy_available_kwh: gs.available_power_kw as f64,
                renewable_fraction: gs.renewable_fraction as f64,
                last_seen: now,
                queue_time_s: gs.queue_time_s as f64,
                operational_state: gs.operational_state,
                available_power_kw: gs.available_power_kw as f64,
                max_sessions: gs.max_sessions,
            },
        );
    }

    pub fn get(&self, id: &NodeId) -> Option<ProviderEntry> {
        self.entries.read().get(id).cloned()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.entries.read().contains_key(id)
    }

    /// All live providers in id order.
    pub fn all(&self) -> Vec<ProviderEntry> {
        let entries = self.entries.read();
        let mut out: Vec<ProviderEntry> = entries.values().cloned().collect();
        out.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        out
    }

    pub fn remove(&self, id: &NodeId) -> bool {
        self.entries.write().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop entries older than `timeout`. Returns how many went.
    pub fn prune(&self, now: f64, timeout: f64) -> usize {
        let mut entries = self.entries.write();
        let stale: Vec<NodeId> = entries
            .iter()
            .filter(|(_, e)| now - e.last_seen > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            entries.remove(id);
        }
        stale.len()
    }
}

impl Default for ProviderTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded duplicate-suppression cache keyed on `(originator, seq)`.
///
/// At capacity the entry with the oldest insertion time is evicted.
pub struct DedupCache {
    inner: RwLock<HashMap<(NodeId, u32), f64>>,
    capacity: usize,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Returns true when the key is fresh; inserts it in that case.
    pub fn check_and_insert(&self, originator: NodeId, seq: u32, now: f64) -> bool {
        let mut inner = self.inner.write();
        if inner.contains_key(&(originator, seq)) {
            return false;
        }
        if inner.len() >= self.capacity {
            if let Some(oldest) = inner
                .iter()
                .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(k, _)| *k)
            {
                inner.remove(&oldest);
            }
        }
        inner.insert((originator, seq), now);
        true
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// Layer B state.
pub struct ProviderAnnouncements {
    pub table: ProviderTable,
    dedup: DedupCache,
    last_pa: Option<f64>,
}

impl ProviderAnnouncements {
    pub fn new(dedup_capacity: usize) -> Self {
        Self {
            table: ProviderTable::new(),
            dedup: DedupCache::new(dedup_capacity),
            last_pa: None,
        }
    }

    /// Periodic work: prune the table; originate a PA when MPR-active and
    /// due. `self_entry` is the local provider advertisement, if any.
    pub fn tick(
        &mut self,
        ctx: &mut Context,
        mpr_active: bool,
        neighbor_count: usize,
        provider_neighbors: &[NeighborEntry],
        self_entry: Option<PaEntry>,
    ) {
        let now = ctx.current_time();
        let pruned = self.table.prune(now, ctx.config.provider_timeout);
        ctx.metrics.providers_pruned += pruned as u64;

        if !mpr_active {
            return;
        }
        let due = match self.last_pa {
            None => true,
            Some(last) => now - last >= ctx.config.pa_interval,
        };
        if !due {
            return;
        }

        let mut entries: Vec<PaEntry> = Vec::new();
        if let Some(entry) = self_entry {
            entries.push(entry);
        }
        for n in provider_neighbors {
            entries.push(PaEntry {
                provider_id: n.id,
                provider_type: ProviderType::MobileProvider,
                position: (n.position.0 as f32, n.position.1 as f32),
                destination: (0.0, 0.0),
                direction: (n.direction.0 as f32, n.direction.1 as f32),
                platoon_size: 0,
                available_slots: 0,
                energy_available_kwh: n.energy_available_kwh as f32,
                renewable_fraction: 0.0,
            });
        }
        if entries.is_empty() {
            return;
        }

        let ttl = ctx.config.effective_pa_ttl(neighbor_count);
        let self_id = ctx.state.id;
        ctx.emit(
            ttl,
            Message::Pa(Pa {
                entries,
                previous_hop: self_id,
            }),
        );
        self.last_pa = Some(now);
    }

    /// Shared dedup + forwarding for the multi-hop kinds. Returns true
    /// when the frame is fresh and its content should be applied.
    pub fn process_forwardable(
        &self,
        ctx: &mut Context,
        raw: &[u8],
        header: &Header,
        previous_hop: &NodeId,
        mpr_active: bool,
    ) -> bool {
        let now = ctx.current_time();
        if !self
            .dedup
            .check_and_insert(header.sender_id, header.seq_num, now)
        {
            ctx.metrics.dropped_duplicate += 1;
            debug!(
                originator = %short_id(&header.sender_id),
                seq = header.seq_num,
                "drop duplicate"
            );
            return false;
        }

        let self_id = ctx.state.id;
        if mpr_active && *previous_hop != self_id {
            if let Some(fwd) = forwarded_copy(raw, &self_id) {
                debug!(
                    originator = %short_id(&header.sender_id),
                    ttl = fwd[crate::wire::Header::TTL_OFFSET],
                    "fwd"
                );
                ctx.emit_raw(fwd, header.msg_type);
            }
        }
        true
    }

    /// Ingest a fresh PA: upsert every advertised provider.
    pub fn apply_pa(&self, ctx: &mut Context, pa: &Pa) {
        let now = ctx.current_time();
        for entry in &pa.entries {
            if entry.provider_id == ctx.state.id {
                continue;
            }
            self.table.upsert_pa(entry, now);
            debug!(
                provider = %short_id(&entry.provider_id),
                energy = entry.energy_available_kwh,
                "rx pa entry"
            );
        }
    }

    /// Ingest a fresh GRID_STATUS: upsert the hub as an RREH provider.
    pub fn apply_grid_status(&self, ctx: &mut Context, gs: &GridStatus) {
        if gs.hub_id == ctx.state.id {
            return;
        }
        let now = ctx.current_time();
        self.table.upsert_grid_status(gs, now);
        debug!(
            hub = %short_id(&gs.hub_id),
            power = gs.available_power_kw,
            queue = gs.queue_time_s,
            "rx grid status"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use crate::context::NodeState;
    use crate::wire::{Frame, MsgType, WireLimits};

    fn ctx(id: u8) -> Context {
        Context::new(ProtocolConfig::default(), NodeState::new([id; 6]))
    }

    fn pa_frame(originator: u8, seq: u32, ttl: u8) -> Vec<u8> {
        Frame::new(
            ttl,
            seq,
            [originator; 6],
            Message::Pa(Pa {
                entries: vec![PaEntry {
                    provider_id: [originator; 6],
                    provider_type: ProviderType::MobileProvider,
                    position: (0.0, 0.0),
                    destination: (0.0, 0.0),
                    direction: (0.0, 0.0),
                    platoon_size: 0,
                    available_slots: 0,
                    energy_available_kwh: 30.0,
                    renewable_fraction: 0.0,
                }],
                previous_hop: [originator; 6],
            }),
        )
        .encode_to_vec()
    }

    fn decode_pa(raw: &[u8]) -> (Header, Pa) {
        let frame = Frame::decode(raw, &WireLimits::default()).unwrap();
        match frame.body {
            Message::Pa(pa) => (frame.header, pa),
            other => panic!("expected Pa, got {:?}", other),
        }
    }

    #[test]
    fn test_dedup_cache_suppresses() {
        let cache = DedupCache::new(16);
        assert!(cache.check_and_insert([1; 6], 7, 0.0));
        assert!(!cache.check_and_insert([1; 6], 7, 1.0));
        assert!(cache.check_and_insert([1; 6], 8, 1.0));
        assert!(cache.check_and_insert([2; 6], 7, 1.0));
    }

    #[test]
    fn test_dedup_cache_bounded() {
        let cache = DedupCache::new(2);
        assert!(cache.check_and_insert([1; 6], 1, 0.0));
        assert!(cache.check_and_insert([1; 6], 2, 1.0));
        assert!(cache.check_and_insert([1; 6], 3, 2.0)); // evicts (1,1)
        assert_eq!(cache.len(), 2);
        // The oldest key was evicted, so it reads as fresh again.
        assert!(cache.check_and_insert([1; 6], 1, 3.0));
    }

    #[test]
    fn test_fresh_pa_updates_table_and_forwards() {
        let mut ctx = ctx(9);
        let layer = ProviderAnnouncements::new(100);
        let raw = pa_frame(1, 7, 4);
        let (header, pa) = decode_pa(&raw);

        let fresh = layer.process_forwardable(&mut ctx, &raw, &header, &pa.previous_hop, true);
        assert!(fresh);
        layer.apply_pa(&mut ctx, &pa);

        assert!(layer.table.contains(&[1; 6]));
        // Forwarded copy queued with decremented ttl and our hop id.
        let out = ctx.take_outgoing();
        assert_eq!(out.len(), 1);
        let (fheader, fpa) = decode_pa(&out[0]);
        assert_eq!(fheader.ttl, 3);
        assert_eq!(fheader.sender_id, [1; 6]); // originator stable
        assert_eq!(fpa.previous_hop, [9; 6]);
        assert_eq!(ctx.metrics.forwarded.get(MsgType::Pa), 1);
    }

    #[test]
    fn test_duplicate_pa_dropped() {
        let mut ctx = ctx(9);
        let layer = ProviderAnnouncements::new(100);
        let raw = pa_frame(1, 7, 4);
        let (header, pa) = decode_pa(&raw);

        assert!(layer.process_forwardable(&mut ctx, &raw, &header, &pa.previous_hop, true));
        ctx.take_outgoing();
        // Replay: same (originator, seq).
        assert!(!layer.process_forwardable(&mut ctx, &raw, &header, &pa.previous_hop, true));
        assert!(ctx.take_outgoing().is_empty());
        assert_eq!(ctx.metrics.dropped_duplicate, 1);
    }

    #[test]
    fn test_non_mpr_does_not_forward() {
        let mut ctx = ctx(9);
        let layer = ProviderAnnouncements::new(100);
        let raw = pa_frame(1, 7, 4);
        let (header, pa) = decode_pa(&raw);

        assert!(layer.process_forwardable(&mut ctx, &raw, &header, &pa.previous_hop, false));
        assert!(ctx.take_outgoing().is_empty());
    }

    #[test]
    fn test_ttl_one_not_forwarded() {
        let mut ctx = ctx(9);
        let layer = ProviderAnnouncements::new(100);
        let raw = pa_frame(1, 7, 1);
        let (header, pa) = decode_pa(&raw);

        assert!(layer.process_forwardable(&mut ctx, &raw, &header, &pa.previous_hop, true));
        // Fresh (content applies) but nothing re-emitted.
        assert!(ctx.take_outgoing().is_empty());
    }

    #[test]
    fn test_provider_pruned_after_timeout() {
        let mut ctx = ctx(9);
        let mut layer = ProviderAnnouncements::new(100);
        let raw = pa_frame(1, 7, 4);
        let (header, pa) = decode_pa(&raw);
        layer.process_forwardable(&mut ctx, &raw, &header, &pa.previous_hop, false);
        layer.apply_pa(&mut ctx, &pa);
        assert!(layer.table.contains(&[1; 6]));

        ctx.update_time(11.0).unwrap(); // provider_timeout = 10.0
        layer.tick(&mut ctx, false, 0, &[], None);
        assert!(!layer.table.contains(&[1; 6]));
        assert_eq!(ctx.metrics.providers_pruned, 1);
    }

    #[test]
    fn test_mpr_active_originates_pa() {
        let mut ctx = ctx(9);
        ctx.state.provider_capable = true;
        let mut layer = ProviderAnnouncements::new(100);
        let self_entry = PaEntry {
            provider_id: [9; 6],
            provider_type: ProviderType::MobileProvider,
            position: (0.0, 0.0),
            destination: (0.0, 0.0),
            direction: (0.0, 0.0),
            platoon_size: 0,
            available_slots: 0,
            energy_available_kwh: 15.0,
            renewable_fraction: 0.0,
        };
        layer.tick(&mut ctx, true, 3, &[], Some(self_entry));
        let out = ctx.take_outgoing();
        assert_eq!(out.len(), 1);
        let (header, pa) = decode_pa(&out[0]);
        assert_eq!(header.ttl, 4); // fixed mode default
        assert_eq!(pa.entries.len(), 1);
        assert_eq!(pa.previous_hop, [9; 6]);

        // Within the same interval nothing more is sent.
        layer.tick(&mut ctx, true, 3, &[], None);
        assert!(ctx.take_outgoing().is_empty());
    }

    #[test]
    fn test_inactive_node_originates_nothing() {
        let mut ctx = ctx(9);
        let mut layer = ProviderAnnouncements::new(100);
        layer.tick(&mut ctx, false, 3, &[], None);
        assert!(ctx.take_outgoing().is_empty());
    }

    #[test]
    fn test_grid_status_upserts_rreh() {
        let mut ctx = ctx(9);
        let layer = ProviderAnnouncements::new(100);
        let gs = GridStatus {
            hub_id: [5; 6],
            renewable_fraction: 0.9,
            available_power_kw: 120.0,
            max_sessions: 4,
            queue_time_s: 600.0,
            operational_state: OperationalState::Congested,
            previous_hop: [5; 6],
        };
        layer.apply_grid_status(&mut ctx, &gs);
        let entry = layer.table.get(&[5; 6]).unwrap();
        assert!(entry.is_rreh());
        assert!(entry.has_capacity());
        assert_eq!(entry.max_sessions, 4);
        assert!((entry.queue_time_s - 600.0).abs() < 1e-6);
    }
}
