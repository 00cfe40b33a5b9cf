//! Layer A: neighbor discovery.
//!
//! Periodic HELLO exchange maintains the one-hop table and the derived
//! two-hop view; the MPR set is recomputed after every table change.
//! Entries silent for longer than `neighbor_timeout` are pruned.

use std::collections::BTreeSet;

use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::context::Context;
use crate::mpr;
use crate::types::{short_id, LinkStatus, NodeId, Position, Velocity, MAX_HELLO_NEIGHBORS};
use crate::wire::{Header, Hello, HelloNeighbor, LinkMetrics, Message, NodeAttributes};

/// One row of the neighbor table.
#[derive(Clone, Debug)]
pub struct NeighborEntry {
    pub id: NodeId,
    pub last_hello_time: f64,
    pub position: Position,
    pub velocity: Velocity,
    pub battery_capacity_kwh: f64,
    pub battery_energy_kwh: f64,
    pub willingness: u8,
    pub etx: f64,
    pub jitter_ms: f64,
    pub lane_weight: f64,
    pub link_stability: f64,
    pub link_status: LinkStatus,
    /// True when the neighbor advertised itself as a provider.
    pub provider: bool,
    /// Advertised shareable energy (providers only).
    pub energy_available_kwh: f64,
    /// Advertised heading unit vector (providers only).
    pub direction: (f64, f64),
    /// The neighbor's advertised one-hop set, with link status.
    pub advertised: Vec<(NodeId, LinkStatus)>,
    /// Advertised one-hop ids, for two-hop computation.
    pub two_hop: BTreeSet<NodeId>,
}

impl NeighborEntry {
    pub fn new(id: NodeId, now: f64) -> Self {
        Self {
            id,
            last_hello_time: now,
            position: (0.0, 0.0),
            velocity: (0.0, 0.0),
            battery_capacity_kwh: 100.0,
            battery_energy_kwh: 50.0,
            willingness: 3,
            etx: 1.0,
            jitter_ms: 0.0,
            lane_weight: 0.5,
            link_stability: 1.0,
            link_status: LinkStatus::Sym,
            provider: false,
            energy_available_kwh: 0.0,
            direction: (0.0, 0.0),
            advertised: Vec::new(),
            two_hop: BTreeSet::new(),
        }
    }

    pub fn battery_pct(&self) -> f64 {
        if self.battery_capacity_kwh <= 0.0 {
            return 0.0;
        }
        (self.battery_energy_kwh / self.battery_capacity_kwh).clamp(0.0, 1.0)
    }
}

struct TableInner {
    neighbors: HashMap<NodeId, NeighborEntry>,
    last_prune: f64,
}

/// Layer A state: the neighbor table plus the derived MPR views.
pub struct NeighborDiscovery {
    inner: RwLock<TableInner>,
    /// Neighbors this node selected as its MPRs.
    mpr_set: RwLock<BTreeSet<NodeId>>,
    /// Neighbors that advertised this node with the MPR bit set.
    mpr_selectors: RwLock<BTreeSet<NodeId>>,
    last_hello: Option<f64>,
}

impl NeighborDiscovery {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(TableInner {
                neighbors: HashMap::new(),
                last_prune: 0.0,
            }),
            mpr_set: RwLock::new(BTreeSet::new()),
            mpr_selectors: RwLock::new(BTreeSet::new()),
            last_hello: None,
        }
    }

    /// Periodic work: prune stale entries, emit HELLO when due.
    ///
    /// Pruning on a tick is unconditional so a stale entry never survives
    /// past the next tick; only the receive path rate-limits it.
    pub fn tick(&mut self, ctx: &mut Context) {
        let now = ctx.current_time();
        let pruned = self.prune(ctx, now, true);
        if pruned {
            self.recompute_mprs(ctx);
        }

        let due = match self.last_hello {
            None => true,
            Some(last) => now - last >= ctx.config.hello_interval,
        };
        if due {
            let hello = self.build_hello(ctx);
            ctx.emit(1, Message::Hello(hello));
            self.last_hello = Some(now);
        }
    }

    /// Ingest a HELLO from a one-hop neighbor.
    pub fn handle_hello(&mut self, ctx: &mut Context, header: &Header, hello: &Hello) {
        let now = ctx.current_time();
        let sender = header.sender_id;
        if sender == ctx.state.id {
            return; // our own broadcast reflected back
        }

        let self_id = ctx.state.id;
        let mut selects_us = false;
        {
            let mut inner = self.inner.write();
            let entry = inner
                .neighbors
                .entry(sender)
                .or_insert_with(|| NeighborEntry::new(sender, now));
            entry.last_hello_time = now;
            entry.position = (hello.attrs.x as f64, hello.attrs.y as f64);
            entry.velocity = (hello.attrs.vx as f64, hello.attrs.vy as f64);
            entry.battery_capacity_kwh = hello.attrs.battery_capacity_kwh as f64;
            entry.battery_energy_kwh = hello.attrs.battery_energy_kwh as f64;
            entry.etx = (hello.metrics.etx as f64).max(1.0);
            entry.jitter_ms = (hello.metrics.jitter_ms as f64).max(0.0);
            entry.willingness = hello.metrics.willingness.min(7);
            entry.lane_weight = (hello.metrics.lane_weight as f64).clamp(0.0, 1.0);
            entry.link_stability = (hello.metrics.link_stability as f64).clamp(0.0, 1.0);
            entry.link_status = LinkStatus::Sym;
            entry.provider = hello.provider;
            entry.energy_available_kwh =
                hello.energy_available_kwh.unwrap_or(0.0) as f64;
            entry.direction = hello
                .direction
                .map(|(x, y)| (x as f64, y as f64))
                .unwrap_or((0.0, 0.0));

            entry.advertised.clear();
            entry.two_hop.clear();
            for n in &hello.neighbors {
                entry.advertised.push((n.id, n.link));
                if n.id != self_id {
                    entry.two_hop.insert(n.id);
                }
                if n.id == self_id && n.mpr_selected {
                    selects_us = true;
                }
            }
        }

        {
            let mut selectors = self.mpr_selectors.write();
            if selects_us {
                selectors.insert(sender);
            } else {
                selectors.remove(&sender);
            }
        }

        debug!(
            from = %short_id(&sender),
            advertised = hello.neighbors.len(),
            selects_us,
            "rx hello"
        );

        self.prune(ctx, now, false);
        self.recompute_mprs(ctx);
    }

    /// Drop entries silent past the timeout. Rate-limited unless `force`.
    /// Returns true when anything was removed.
    fn prune(&self, ctx: &mut Context, now: f64, force: bool) -> bool {
        let removed: Vec<NodeId> = {
            let mut inner = self.inner.write();
            if !force && now - inner.last_prune < ctx.config.prune_interval {
                return false;
            }
            inner.last_prune = now;
            let timeout = ctx.config.neighbor_timeout;
            let stale: Vec<NodeId> = inner
                .neighbors
                .iter()
                .filter(|(_, e)| now - e.last_hello_time > timeout)
                .map(|(id, _)| *id)
                .collect();
            for id in &stale {
                inner.neighbors.remove(id);
            }
            stale
        };
        if removed.is_empty() {
            return false;
        }

        let mut selectors = self.mpr_selectors.write();
        for id in &removed {
            selectors.remove(id);
            debug!(neighbor = %short_id(id), "pruned stale neighbor");
        }
        ctx.metrics.neighbors_pruned += removed.len() as u64;
        true
    }

    /// Recompute the MPR set from the current table snapshot.
    fn recompute_mprs(&self, ctx: &mut Context) {
        let snapshot: Vec<NeighborEntry> = {
            let inner = self.inner.read();
            let mut entries: Vec<NeighborEntry> =
                inner.neighbors.values().cloned().collect();
            entries.sort_by(|a, b| a.id.cmp(&b.id));
            entries
        };
        let new_set = mpr::select_mprs(
            &ctx.state.id,
            ctx.state.velocity,
            &snapshot,
            &ctx.config.olsr_weights,
        );
        let mut mprs = self.mpr_set.write();
        if *mprs != new_set {
            debug!(count = new_set.len(), "mpr set updated");
        }
        *mprs = new_set;
        ctx.metrics.mpr_recomputations += 1;
    }

    /// Build the outgoing HELLO from local state and the current table.
    fn build_hello(&self, ctx: &Context) -> Hello {
        let state = &ctx.state;
        let mprs = self.mpr_set.read();
        let neighbors: Vec<HelloNeighbor> = {
            let inner = self.inner.read();
            let mut ids: Vec<&NeighborEntry> = inner.neighbors.values().collect();
            ids.sort_by(|a, b| a.id.cmp(&b.id));
            ids.iter()
                .take(MAX_HELLO_NEIGHBORS)
                .map(|e| HelloNeighbor {
                    id: e.id,
                    link: e.link_status,
                    mpr_selected: mprs.contains(&e.id),
                })
                .collect()
        };

        let provider = state.provider_capable
            && state.shareable_energy(&ctx.config) > 0.0;
        let direction = state.direction_vector();
        Hello {
            neighbors,
            attrs: NodeAttributes {
                battery_capacity_kwh: state.battery_capacity_kwh as f32,
                battery_energy_kwh: state.battery_energy_kwh as f32,
                min_energy_kwh: state.min_energy_kwh as f32,
                max_transfer_rate_in: state.max_transfer_rate_in as f32,
                max_transfer_rate_out: state.max_transfer_rate_out as f32,
                x: state.position.0 as f32,
                y: state.position.1 as f32,
                vx: state.velocity.0 as f32,
                vy: state.velocity.1 as f32,
                battery_health: state.battery_health as f32,
            },
            metrics: LinkMetrics {
                etx: state.etx as f32,
                jitter_ms: state.jitter_ms as f32,
                willingness: state.willingness,
                lane_weight: state.lane_weight as f32,
                link_stability: state.link_stability as f32,
            },
            provider,
            energy_available_kwh: provider
                .then(|| state.shareable_energy(&ctx.config) as f32),
            direction: provider
                .then(|| (direction.0 as f32, direction.1 as f32)),
        }
    }

    // --- Read-only accessors for other layers ---

    pub fn neighbor_count(&self) -> usize {
        self.inner.read().neighbors.len()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.inner.read().neighbors.contains_key(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<NeighborEntry> {
        self.inner.read().neighbors.get(id).cloned()
    }

    pub fn one_hop_ids(&self) -> BTreeSet<NodeId> {
        self.inner.read().neighbors.keys().copied().collect()
    }

    /// Strict two-hop set: advertised ids that are neither us nor one-hop.
    pub fn two_hop_set(&self, self_id: &NodeId) -> BTreeSet<NodeId> {
        let inner = self.inner.read();
        let one_hop: BTreeSet<NodeId> = inner.neighbors.keys().copied().collect();
        let mut out = BTreeSet::new();
        for e in inner.neighbors.values() {
            for id in &e.two_hop {
                if id != self_id && !one_hop.contains(id) {
                    out.insert(*id);
                }
            }
        }
        out
    }

    /// One-hop neighbors that advertised themselves as providers, in id
    /// order.
    pub fn provider_neighbors(&self) -> Vec<NeighborEntry> {
        let inner = self.inner.read();
        let mut out: Vec<NeighborEntry> = inner
            .neighbors
            .values()
            .filter(|e| e.provider)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn mpr_set(&self) -> BTreeSet<NodeId> {
        self.mpr_set.read().clone()
    }

    /// A node is MPR-active while at least one live neighbor has selected
    /// it as an MPR.
    pub fn is_mpr_active(&self) -> bool {
        !self.mpr_selectors.read().is_empty()
    }

    pub fn last_hello_time(&self, id: &NodeId) -> Option<f64> {
        self.inner.read().neighbors.get(id).map(|e| e.last_hello_time)
    }
}

impl Default for NeighborDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use crate::context::NodeState;
    use crate::wire::MsgType;

    fn ctx(id: u8) -> Context {
        Context::new(ProtocolConfig::default(), NodeState::new([id; 6]))
    }

    fn hello_from(neighbors: Vec<HelloNeighbor>) -> Hello {
        Hello {
            neighbors,
            ..Hello::default()
        }
    }

    fn header(sender: u8, seq: u32) -> Header {
        Header {
            msg_type: MsgType::Hello,
            ttl: 1,
            seq_num: seq,
            sender_id: [sender; 6],
            payload_len: 0,
        }
    }

    #[test]
    fn test_first_tick_emits_hello() {
        let mut ctx = ctx(1);
        let mut layer = NeighborDiscovery::new();
        layer.tick(&mut ctx);
        assert_eq!(ctx.metrics.sent.get(MsgType::Hello), 1);
        // Same second: no second hello.
        layer.tick(&mut ctx);
        assert_eq!(ctx.metrics.sent.get(MsgType::Hello), 1);
    }

    #[test]
    fn test_hello_interval_respected() {
        let mut ctx = ctx(1);
        let mut layer = NeighborDiscovery::new();
        layer.tick(&mut ctx);
        ctx.update_time(0.5).unwrap();
        layer.tick(&mut ctx);
        assert_eq!(ctx.metrics.sent.get(MsgType::Hello), 1);
        ctx.update_time(1.0).unwrap();
        layer.tick(&mut ctx);
        assert_eq!(ctx.metrics.sent.get(MsgType::Hello), 2);
    }

    #[test]
    fn test_handle_hello_inserts_neighbor() {
        let mut ctx = ctx(1);
        let mut layer = NeighborDiscovery::new();
        ctx.update_time(1.0).unwrap();
        layer.handle_hello(&mut ctx, &header(2, 1), &hello_from(vec![]));
        assert_eq!(layer.neighbor_count(), 1);
        assert_eq!(layer.last_hello_time(&[2; 6]), Some(1.0));
    }

    #[test]
    fn test_stale_neighbor_pruned() {
        let mut ctx = ctx(1);
        let mut layer = NeighborDiscovery::new();
        ctx.update_time(1.0).unwrap();
        layer.handle_hello(&mut ctx, &header(2, 1), &hello_from(vec![]));
        assert!(layer.contains(&[2; 6]));

        // 6+ seconds of silence exceeds the 5 s timeout.
        ctx.update_time(7.5).unwrap();
        layer.tick(&mut ctx);
        assert!(!layer.contains(&[2; 6]));
        assert_eq!(ctx.metrics.neighbors_pruned, 1);
    }

    #[test]
    fn test_mpr_selector_tracking() {
        let mut ctx = ctx(1);
        let mut layer = NeighborDiscovery::new();
        assert!(!layer.is_mpr_active());

        let hello = hello_from(vec![HelloNeighbor {
            id: [1; 6],
            link: LinkStatus::Sym,
            mpr_selected: true,
        }]);
        layer.handle_hello(&mut ctx, &header(2, 1), &hello);
        assert!(layer.is_mpr_active());

        // The same neighbor clearing the bit revokes selection.
        let hello = hello_from(vec![HelloNeighbor {
            id: [1; 6],
            link: LinkStatus::Sym,
            mpr_selected: false,
        }]);
        layer.handle_hello(&mut ctx, &header(2, 2), &hello);
        assert!(!layer.is_mpr_active());
    }

    #[test]
    fn test_two_hop_set_excludes_self_and_one_hop() {
        let mut ctx = ctx(1);
        let mut layer = NeighborDiscovery::new();
        let hello = hello_from(vec![
            HelloNeighbor {
                id: [1; 6], // us
                link: LinkStatus::Sym,
                mpr_selected: false,
            },
            HelloNeighbor {
                id: [3; 6],
                link: LinkStatus::Sym,
                mpr_selected: false,
            },
        ]);
        layer.handle_hello(&mut ctx, &header(2, 1), &hello);
        layer.handle_hello(&mut ctx, &header(3, 1), &hello_from(vec![]));

        // 3 is one-hop now, so the two-hop set is empty.
        assert!(layer.two_hop_set(&[1; 6]).is_empty());
    }

    #[test]
    fn test_mpr_recomputed_on_hello() {
        let mut ctx = ctx(1);
        let mut layer = NeighborDiscovery::new();
        // Neighbor 2 advertises 5: 5 is two-hop, 2 must become MPR.
        let hello = hello_from(vec![HelloNeighbor {
            id: [5; 6],
            link: LinkStatus::Sym,
            mpr_selected: false,
        }]);
        layer.handle_hello(&mut ctx, &header(2, 1), &hello);
        assert!(layer.mpr_set().contains(&[2; 6]));
    }

    #[test]
    fn test_hello_carries_mpr_bit() {
        let mut ctx = ctx(1);
        let mut layer = NeighborDiscovery::new();
        let hello = hello_from(vec![HelloNeighbor {
            id: [5; 6],
            link: LinkStatus::Sym,
            mpr_selected: false,
        }]);
        layer.handle_hello(&mut ctx, &header(2, 1), &hello);

        let out = layer.build_hello(&ctx);
        let adv: Vec<_> = out.neighbors.iter().filter(|n| n.id == [2; 6]).collect();
        assert_eq!(adv.len(), 1);
        assert!(adv[0].mpr_selected);
    }

    #[test]
    fn test_provider_neighbors() {
        let mut ctx = ctx(1);
        let mut layer = NeighborDiscovery::new();
        let mut hello = hello_from(vec![]);
        hello.provider = true;
        hello.energy_available_kwh = Some(12.0);
        layer.handle_hello(&mut ctx, &header(2, 1), &hello);
        layer.handle_hello(&mut ctx, &header(3, 1), &hello_from(vec![]));

        let providers = layer.provider_neighbors();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].id, [2; 6]);
        assert!((providers[0].energy_available_kwh - 12.0).abs() < 1e-6);
    }
}
