//! Layer D: platoon coordination.
//!
//! The head owns the `Platoon` record and its directed edge graph for
//! wireless energy routing; members track the head through beacons and
//! report status; consumers keep a `PlatoonTable` of announced platoons.
//! Formation targets are advisory and travel inside PLATOON_BEACON.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, BTreeSet};

use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::head::BookedConsumer;
use crate::types::{
    distance_m, dot, short_id, NodeId, NodeRole, PlatoonId, Position,
};
use crate::wire::{
    Message, PlatoonAnnounce, PlatoonBeacon, PlatoonStatus,
};

// Formation constraints: safety spacing, lane width, convoy length.
const MIN_SPACING_M: f64 = 2.0;
const MAX_LATERAL_M: f64 = 3.5;
const MAX_LONGITUDINAL_M: f64 = 20.0;
const CONVOY_SPACING_M: f64 = 3.0;

/// Transfer-time normalization bound for the edge weight (5 minutes).
const TRANSFER_TIME_NORM_S: f64 = 300.0;

/// One platoon member as the head tracks it.
#[derive(Clone, Debug)]
pub struct MemberInfo {
    pub id: NodeId,
    pub rel_index: u8,
    /// Position relative to the head, metres (x lateral, y behind).
    pub rel_position: (f64, f64),
    pub battery_pct: f64,
    pub willingness: u8,
    pub last_status_t: f64,
}

/// A directed wireless-transfer edge between two members.
#[derive(Clone, Copy, Debug)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub distance_m: f64,
    pub efficiency: f64,
    pub transfer_time_s: f64,
    pub weight: f64,
}

impl Edge {
    /// Inverse-square efficiency; zero outside range or below the floor.
    fn efficiency_for(distance: f64, config: &crate::config::ProtocolConfig) -> f64 {
        if distance > config.edge_max_range_m {
            return 0.0;
        }
        if distance <= 0.0 {
            return 1.0;
        }
        let eff = 1.0 / (1.0 + config.edge_efficiency_scale * distance * distance);
        if eff < config.edge_min_efficiency {
            0.0
        } else {
            eff
        }
    }

    fn new(
        from: NodeId,
        to: NodeId,
        distance: f64,
        transfer_time_s: f64,
        config: &crate::config::ProtocolConfig,
    ) -> Option<Self> {
        let efficiency = Self::efficiency_for(distance, config);
        if efficiency <= 0.0 {
            return None;
        }
        let w = &config.edge_weights;
        // -ln(eff) makes the weight additive where efficiency multiplies,
        // so min-weight paths maximize cumulative efficiency.
        let weight = w.distance * (distance / config.edge_max_range_m)
            + w.efficiency * (-efficiency.ln())
            + w.time * (transfer_time_s / TRANSFER_TIME_NORM_S).min(1.0);
        Some(Self {
            from,
            to,
            distance_m: distance,
            efficiency,
            transfer_time_s,
            weight,
        })
    }
}

/// One min-weight energy route from a surplus member to a deficit member.
#[derive(Clone, Debug)]
pub struct EnergyPath {
    pub source: NodeId,
    pub sink: NodeId,
    pub path: Vec<NodeId>,
    pub cumulative_efficiency: f64,
    pub total_weight: f64,
}

// BinaryHeap is a max-heap; reverse the weight ordering for Dijkstra.
struct QueueItem {
    weight: f64,
    node: NodeId,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.weight == other.weight && self.node == other.node
    }
}
impl Eq for QueueItem {}
impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .weight
            .total_cmp(&self.weight)
            .then_with(|| other.node.cmp(&self.node))
    }
}

/// The head's platoon record.
#[derive(Clone, Debug)]
pub struct Platoon {
    pub platoon_id: PlatoonId,
    pub head_id: NodeId,
    /// Ordered roster; the head is index 0.
    pub members: Vec<MemberInfo>,
    /// Directed edges over current relative positions.
    edges: HashMap<(NodeId, NodeId), Edge>,
    /// Advisory target positions from the last optimization.
    pub target_formation: HashMap<NodeId, (f64, f64)>,
    last_formation_update: f64,
    pub destination: Option<Position>,
}

impl Platoon {
    /// A fresh single-vehicle platoon. The platoon id is the founding
    /// head's node id, which stays stable across handoffs.
    pub fn new(head_id: NodeId, destination: Option<Position>, now: f64) -> Self {
        let head = MemberInfo {
            id: head_id,
            rel_index: 0,
            rel_position: (0.0, 0.0),
            battery_pct: 1.0,
            willingness: 3,
            last_status_t: now,
        };
        Self {
            platoon_id: head_id,
            head_id,
            members: vec![head],
            edges: HashMap::new(),
            target_formation: HashMap::new(),
            last_formation_update: f64::NEG_INFINITY,
            destination,
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn available_slots(&self, max_size: usize) -> usize {
        max_size.saturating_sub(self.members.len())
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.members.iter().any(|m| m.id == *id)
    }

    pub fn member_ids(&self) -> Vec<NodeId> {
        self.members.iter().map(|m| m.id).collect()
    }

    pub fn member(&self, id: &NodeId) -> Option<&MemberInfo> {
        self.members.iter().find(|m| m.id == *id)
    }

    /// Roster as carried in beacons: (id, rel_index).
    pub fn topology_vector(&self) -> Vec<(NodeId, u8)> {
        self.members.iter().map(|m| (m.id, m.rel_index)).collect()
    }

    /// Append a member at the back of the convoy.
    pub fn add_member(&mut self, id: NodeId, battery_pct: f64, now: f64, max_size: usize) -> bool {
        if self.members.len() >= max_size || self.contains(&id) {
            return false;
        }
        let index = self.members.len() as u8;
        self.members.push(MemberInfo {
            id,
            rel_index: index,
            rel_position: (0.0, f64::from(index) * CONVOY_SPACING_M),
            battery_pct,
            willingness: 3,
            last_status_t: now,
        });
        true
    }

    /// Remove a member and close the gap.
    pub fn remove_member(&mut self, id: &NodeId) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m.id != *id);
        if self.members.len() == before {
            return false;
        }
        self.reindex();
        self.target_formation.remove(id);
        true
    }

    fn reindex(&mut self) {
        for (i, m) in self.members.iter_mut().enumerate() {
            m.rel_index = i as u8;
        }
    }

    /// Fold a PLATOON_STATUS into the roster.
    pub fn update_member_status(
        &mut self,
        id: &NodeId,
        battery_pct: f64,
        rel_index: u8,
        now: f64,
    ) {
        if let Some(m) = self.members.iter_mut().find(|m| m.id == *id) {
            m.battery_pct = battery_pct;
            m.rel_index = rel_index;
            m.last_status_t = now;
        }
    }

    /// Members silent past `timeout` leave; the head never times out.
    pub fn prune_stale_members(&mut self, now: f64, timeout: f64) -> Vec<NodeId> {
        let head = self.head_id;
        let stale: Vec<NodeId> = self
            .members
            .iter()
            .filter(|m| m.id != head && now - m.last_status_t > timeout)
            .map(|m| m.id)
            .collect();
        for id in &stale {
            self.remove_member(id);
        }
        stale
    }

    /// Rebuild every directed edge from current relative positions.
    pub fn build_edges(&mut self, config: &crate::config::ProtocolConfig) {
        self.edges.clear();
        for a in &self.members {
            for b in &self.members {
                if a.id == b.id {
                    continue;
                }
                let d = distance_m(a.rel_position, b.rel_position);
                if let Some(edge) = Edge::new(a.id, b.id, d, 0.0, config) {
                    self.edges.insert((a.id, b.id), edge);
                }
            }
        }
    }

    pub fn edge(&self, from: &NodeId, to: &NodeId) -> Option<&Edge> {
        self.edges.get(&(*from, *to))
    }

    pub fn usable_edges(&self) -> Vec<&Edge> {
        let mut out: Vec<&Edge> = self.edges.values().collect();
        out.sort_by(|a, b| (a.from, a.to).cmp(&(b.from, b.to)));
        out
    }

    /// Mean efficiency across usable edges; announced to consumers.
    pub fn formation_efficiency(&self) -> f64 {
        if self.edges.is_empty() {
            return 0.0;
        }
        let total: f64 = self.edges.values().map(|e| e.efficiency).sum();
        total / self.edges.len() as f64
    }

    fn surplus_members(&self, config: &crate::config::ProtocolConfig) -> Vec<&MemberInfo> {
        self.members
            .iter()
            .filter(|m| m.battery_pct > config.platoon_surplus_threshold_pct)
            .collect()
    }

    fn deficit_members(&self, config: &crate::config::ProtocolConfig) -> Vec<&MemberInfo> {
        self.members
            .iter()
            .filter(|m| m.battery_pct < config.platoon_deficit_threshold_pct)
            .collect()
    }

    /// Min-weight route from `source` to every reachable member.
    fn dijkstra_from(
        &self,
        source: &NodeId,
    ) -> HashMap<NodeId, (f64, Vec<NodeId>, f64)> {
        let mut best: HashMap<NodeId, (f64, Vec<NodeId>, f64)> = HashMap::new();
        let mut visited: BTreeSet<NodeId> = BTreeSet::new();
        let mut heap = BinaryHeap::new();

        best.insert(*source, (0.0, vec![*source], 1.0));
        heap.push(QueueItem {
            weight: 0.0,
            node: *source,
        });

        while let Some(QueueItem { weight, node }) = heap.pop() {
            if !visited.insert(node) {
                continue;
            }
            let (_, path, eff) = best.get(&node).cloned().unwrap_or((
                weight,
                vec![node],
                1.0,
            ));
            for edge in self.edges.values() {
                if edge.from != node || visited.contains(&edge.to) {
                    continue;
                }
                let next_weight = weight + edge.weight;
                let improved = match best.get(&edge.to) {
                    None => true,
                    Some((w, _, _)) => next_weight < *w,
                };
                if improved {
                    let mut next_path = path.clone();
                    next_path.push(edge.to);
                    best.insert(edge.to, (next_weight, next_path, eff * edge.efficiency));
                    heap.push(QueueItem {
                        weight: next_weight,
                        node: edge.to,
                    });
                }
            }
        }
        best
    }

    /// Optimal transfer routes: for every deficit member, the min-weight
    /// path from the best surplus member. Results come back in sink-id
    /// order; source ties break on the lower source id.
    pub fn dijkstra_energy_paths(
        &self,
        config: &crate::config::ProtocolConfig,
    ) -> Vec<EnergyPath> {
        let surplus = self.surplus_members(config);
        let deficit = self.deficit_members(config);
        if surplus.is_empty() || deficit.is_empty() {
            return Vec::new();
        }

        let mut sources: Vec<NodeId> = surplus.iter().map(|m| m.id).collect();
        sources.sort();
        let mut sinks: Vec<NodeId> = deficit.iter().map(|m| m.id).collect();
        sinks.sort();

        let routed: Vec<(NodeId, HashMap<NodeId, (f64, Vec<NodeId>, f64)>)> = sources
            .iter()
            .map(|s| (*s, self.dijkstra_from(s)))
            .collect();

        let mut out = Vec::new();
        for sink in sinks {
            let mut best: Option<EnergyPath> = None;
            for (source, routes) in &routed {
                let Some((weight, path, eff)) = routes.get(&sink) else {
                    continue;
                };
                let candidate = EnergyPath {
                    source: *source,
                    sink,
                    path: path.clone(),
                    cumulative_efficiency: *eff,
                    total_weight: *weight,
                };
                let better = match &best {
                    None => true,
                    Some(b) => {
                        candidate.total_weight < b.total_weight
                            || (candidate.total_weight == b.total_weight
                                && candidate.source < b.source)
                    }
                };
                if better {
                    best = Some(candidate);
                }
            }
            if let Some(p) = best {
                out.push(p);
            }
        }
        out
    }

    /// Advisory formation targets: surplus members stay close to the head
    /// line, deficit members sit next to their energy source, all under
    /// spacing/lane/length constraints. Recomputed at most every
    /// `formation_update_interval`.
    pub fn compute_optimal_formation(
        &mut self,
        now: f64,
        config: &crate::config::ProtocolConfig,
    ) -> HashMap<NodeId, (f64, f64)> {
        if now - self.last_formation_update < config.formation_update_interval {
            return self.target_formation.clone();
        }
        self.last_formation_update = now;

        let surplus: Vec<NodeId> = {
            let mut v: Vec<NodeId> = self
                .surplus_members(config)
                .iter()
                .filter(|m| m.id != self.head_id)
                .map(|m| m.id)
                .collect();
            v.sort();
            v
        };
        let deficit: Vec<NodeId> = {
            // Lowest battery first; ties on id.
            let mut v: Vec<&MemberInfo> = self
                .deficit_members(config)
                .into_iter()
                .filter(|m| m.id != self.head_id)
                .collect();
            v.sort_by(|a, b| {
                a.battery_pct
                    .total_cmp(&b.battery_pct)
                    .then_with(|| a.id.cmp(&b.id))
            });
            v.iter().map(|m| m.id).collect()
        };

        let mut formation: HashMap<NodeId, (f64, f64)> = HashMap::new();
        formation.insert(self.head_id, (0.0, 0.0));

        // Surplus vehicles line up behind the head, alternating sides.
        for (i, id) in surplus.iter().enumerate() {
            let x = if i % 2 == 0 { 1.0 } else { -1.0 };
            let y = (i as f64 + 1.0) * CONVOY_SPACING_M;
            formation.insert(*id, (x, y));
        }

        // Deficit vehicles sit beside the strongest source available.
        let best_source = self
            .members
            .iter()
            .filter(|m| m.battery_pct > config.platoon_surplus_threshold_pct)
            .max_by(|a, b| {
                a.battery_pct
                    .total_cmp(&b.battery_pct)
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|m| m.id);
        for id in &deficit {
            let anchor = best_source
                .and_then(|s| formation.get(&s).copied())
                .unwrap_or((0.0, 0.0));
            let spot = find_spot_near(anchor, &formation);
            formation.insert(*id, spot);
        }

        // Anyone left (mid-band batteries) trails the occupied convoy.
        let mut tail_y = formation
            .values()
            .map(|p| p.1)
            .fold(0.0, f64::max);
        for m in &self.members {
            if !formation.contains_key(&m.id) {
                tail_y += CONVOY_SPACING_M;
                formation.insert(m.id, (0.0, tail_y));
            }
        }

        relax_constraints(&mut formation);
        self.target_formation = formation.clone();
        formation
    }

    /// Move members to their targets and refresh the edge graph.
    pub fn apply_formation(&mut self, config: &crate::config::ProtocolConfig) {
        for m in &mut self.members {
            if let Some(target) = self.target_formation.get(&m.id) {
                m.rel_position = *target;
            }
        }
        self.build_edges(config);
    }

    /// Best member to inherit the head role: battery, then willingness,
    /// then the forward-most position, then the lower id.
    pub fn best_handoff_candidate(&self) -> Option<NodeId> {
        self.members
            .iter()
            .filter(|m| m.id != self.head_id)
            .max_by(|a, b| {
                a.battery_pct
                    .total_cmp(&b.battery_pct)
                    .then_with(|| a.willingness.cmp(&b.willingness))
                    .then_with(|| b.rel_index.cmp(&a.rel_index))
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|m| m.id)
    }

    /// Transfer headship. Roster order moves the new head to the front.
    pub fn set_head(&mut self, new_head: NodeId) -> bool {
        if !self.contains(&new_head) {
            return false;
        }
        if let Some(pos) = self.members.iter().position(|m| m.id == new_head) {
            let member = self.members.remove(pos);
            self.members.insert(0, member);
        }
        self.head_id = new_head;
        self.reindex();
        true
    }
}

/// First free slot near an anchor that respects spacing and lane bounds.
fn find_spot_near(
    anchor: (f64, f64),
    taken: &HashMap<NodeId, (f64, f64)>,
) -> (f64, f64) {
    let dys = [MIN_SPACING_M, MIN_SPACING_M * 1.5, MIN_SPACING_M * 2.0];
    let dxs = [0.0, MIN_SPACING_M, -MIN_SPACING_M];
    for dy in dys {
        for dx in dxs {
            let candidate = (anchor.0 + dx, anchor.1 + dy);
            if candidate.0.abs() > MAX_LATERAL_M {
                continue;
            }
            let clear = taken
                .values()
                .all(|p| distance_m(*p, candidate) >= MIN_SPACING_M);
            if clear {
                return candidate;
            }
        }
    }
    (anchor.0, anchor.1 + MIN_SPACING_M * 2.0)
}

/// Clamp to lane/length bounds and push overlapping pairs apart.
fn relax_constraints(formation: &mut HashMap<NodeId, (f64, f64)>) {
    for pos in formation.values_mut() {
        pos.0 = pos.0.clamp(-MAX_LATERAL_M, MAX_LATERAL_M);
        pos.1 = pos.1.clamp(0.0, MAX_LONGITUDINAL_M);
    }

    let mut ids: Vec<NodeId> = formation.keys().copied().collect();
    ids.sort();
    for _ in 0..10 {
        let mut violations = 0;
        for i in 0..ids.len() {
            for j in (i + 1)..ids.len() {
                let a = formation[&ids[i]];
                let b = formation[&ids[j]];
                let d = distance_m(a, b);
                if d < MIN_SPACING_M && d > f64::EPSILON {
                    violations += 1;
                    let overlap = (MIN_SPACING_M - d) / 2.0;
                    let push = ((b.0 - a.0) / d * overlap, (b.1 - a.1) / d * overlap);
                    formation.insert(ids[i], (a.0 - push.0, a.1 - push.1));
                    formation.insert(ids[j], (b.0 + push.0, b.1 + push.1));
                }
            }
        }
        if violations == 0 {
            break;
        }
    }

    // Pushes may have nudged positions past the bounds; clamp once more.
    for pos in formation.values_mut() {
        pos.0 = pos.0.clamp(-MAX_LATERAL_M, MAX_LATERAL_M);
        pos.1 = pos.1.clamp(0.0, MAX_LONGITUDINAL_M);
    }
}

/// One announced platoon as a consumer sees it.
#[derive(Clone, Debug)]
pub struct PlatoonEntry {
    pub platoon_id: PlatoonId,
    pub head_id: NodeId,
    pub position: Position,
    pub destination: Position,
    pub direction: (f64, f64),
    pub surplus_energy_kwh: f64,
    pub available_slots: u8,
    pub formation_efficiency: f64,
    pub last_seen: f64,
    pub score: f64,
}

impl PlatoonEntry {
    pub fn has_capacity(&self) -> bool {
        self.available_slots > 0
    }
}

/// Consumer-side table of announced platoons.
pub struct PlatoonTable {
    entries: RwLock<HashMap<PlatoonId, PlatoonEntry>>,
}

impl PlatoonTable {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn update_from_announce(&self, ann: &PlatoonAnnounce, now: f64) {
        let mut entries = self.entries.write();
        entries.insert(
            ann.platoon_id,
            PlatoonEntry {
                platoon_id: ann.platoon_id,
                head_id: ann.head_id,
                position: (ann.position.0 as f64, ann.position.1 as f64),
                destination: (ann.destination.0 as f64, ann.destination.1 as f64),
                direction: (ann.direction.0 as f64, ann.direction.1 as f64),
                surplus_energy_kwh: ann.surplus_energy_kwh as f64,
                available_slots: ann.available_slots,
                formation_efficiency: ann.formation_efficiency as f64,
                last_seen: now,
                score: 0.0,
            },
        );
    }

    /// Live entries in platoon-id order.
    pub fn entries(&self) -> Vec<PlatoonEntry> {
        let entries = self.entries.read();
        let mut out: Vec<PlatoonEntry> = entries.values().cloned().collect();
        out.sort_by(|a, b| a.platoon_id.cmp(&b.platoon_id));
        out
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn prune(&self, now: f64, timeout: f64) -> usize {
        let mut entries = self.entries.write();
        let stale: Vec<PlatoonId> = entries
            .iter()
            .filter(|(_, e)| now - e.last_seen > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            entries.remove(id);
        }
        stale.len()
    }

    /// Score one platoon for a consumer: direction match, proximity,
    /// energy fit, and a formation-efficiency bonus. Capacity-less
    /// platoons are heavily discounted rather than hidden.
    pub fn score(
        entry: &PlatoonEntry,
        consumer_pos: Position,
        consumer_dir: (f64, f64),
        energy_need_kwh: f64,
        config: &crate::config::ProtocolConfig,
    ) -> f64 {
        let direction_match = (dot(consumer_dir, entry.direction) + 1.0) / 2.0;
        let dist_km = crate::types::distance_km(consumer_pos, entry.position);
        let distance_score = 1.0 / dist_km.max(1.0);
        let energy_match = if energy_need_kwh > f64::EPSILON {
            (entry.surplus_energy_kwh / energy_need_kwh).min(1.0)
        } else if entry.surplus_energy_kwh > 0.0 {
            1.0
        } else {
            0.0
        };
        let efficiency_bonus = entry.formation_efficiency * 0.1;

        let mut score = config.platoon_score_direction * direction_match
            + config.platoon_score_distance * distance_score
            + config.platoon_score_energy * energy_match
            + efficiency_bonus;
        if !entry.has_capacity() {
            score *= 0.1;
        }
        score
    }

    /// Highest-scoring platoon; ties break on the lowest platoon id.
    pub fn find_best_platoon(
        &self,
        consumer_pos: Position,
        consumer_dir: (f64, f64),
        energy_need_kwh: f64,
        config: &crate::config::ProtocolConfig,
    ) -> Option<PlatoonEntry> {
        let entries = self.entries.read();
        let mut best: Option<PlatoonEntry> = None;
        let mut ids: Vec<&PlatoonId> = entries.keys().collect();
        ids.sort();
        for id in ids {
            let entry = &entries[id];
            let score =
                Self::score(entry, consumer_pos, consumer_dir, energy_need_kwh, config);
            let better = match &best {
                None => true,
                Some(b) => score > b.score,
            };
            if better {
                let mut e = entry.clone();
                e.score = score;
                best = Some(e);
            }
        }
        best
    }
}

impl Default for PlatoonTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Member-side view of the platoon being followed.
#[derive(Clone, Debug)]
struct Membership {
    platoon_id: PlatoonId,
    head_id: NodeId,
    rel_index: u8,
    last_beacon_t: f64,
    target_position: Option<(f64, f64)>,
}

/// Role changes Layer D asks the node to apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlatoonEvent {
    /// Missed too many beacons; left the platoon.
    LeftPlatoon,
    /// A handoff beacon named this node as the new head.
    PromotedToHead,
    /// This head handed the platoon to `new_head` and became a member.
    HandedOffTo(NodeId),
}

/// Layer D engine, one per node.
pub struct PlatoonCoordination {
    platoon: Option<Platoon>,
    membership: Option<Membership>,
    pub table: PlatoonTable,
    last_beacon: Option<f64>,
    last_announce: Option<f64>,
    last_status: Option<f64>,
}

impl PlatoonCoordination {
    pub fn new() -> Self {
        Self {
            platoon: None,
            membership: None,
            table: PlatoonTable::new(),
            last_beacon: None,
            last_announce: None,
            last_status: None,
        }
    }

    pub fn platoon(&self) -> Option<&Platoon> {
        self.platoon.as_ref()
    }

    pub fn in_platoon_as_member(&self) -> bool {
        self.membership.is_some()
    }

    pub fn member_target_position(&self) -> Option<(f64, f64)> {
        self.membership.as_ref().and_then(|m| m.target_position)
    }

    /// Become a platoon head with a fresh single-vehicle platoon.
    pub fn start_platoon(&mut self, ctx: &Context) {
        let now = ctx.current_time();
        let mut platoon = Platoon::new(ctx.state.id, ctx.state.destination, now);
        platoon.members[0].battery_pct = ctx.state.battery_pct();
        platoon.members[0].willingness = ctx.state.willingness;
        self.platoon = Some(platoon);
        self.membership = None;
        info!("platoon started");
    }

    /// Dissolve head state (role moved elsewhere).
    pub fn stop_platoon(&mut self) {
        self.platoon = None;
    }

    /// Join as a member after an accepted handshake.
    pub fn join_platoon(&mut self, platoon_id: PlatoonId, head_id: NodeId, now: f64) {
        self.membership = Some(Membership {
            platoon_id,
            head_id,
            rel_index: 0,
            last_beacon_t: now,
            target_position: None,
        });
        self.platoon = None;
        info!(platoon = %short_id(&platoon_id), head = %short_id(&head_id), "joined platoon");
    }

    pub fn leave_platoon(&mut self) {
        self.membership = None;
    }

    /// Head side: a booked consumer becomes a member.
    pub fn admit_member(&mut self, ctx: &Context, booked: &BookedConsumer) -> bool {
        let now = ctx.current_time();
        let max = ctx.config.platoon_max_size;
        match self.platoon.as_mut() {
            Some(platoon) => platoon.add_member(booked.consumer_id, 0.5, now, max),
            None => false,
        }
    }

    /// Hand the platoon to the best member before ceding the head role,
    /// announced through a distinguished beacon carrying the new head id.
    /// Without this a departing head would leave its members orphaned
    /// until beacon loss. `stay` keeps the old head aboard as a member.
    ///
    /// Returns the elected head, or `None` when the platoon has no member
    /// fit to inherit it (a candidate must at least clear the deficit
    /// bar).
    pub fn hand_off_platoon(&mut self, ctx: &mut Context, stay: bool) -> Option<NodeId> {
        let platoon = self.platoon.as_mut()?;
        if platoon.len() <= 1 {
            return None;
        }
        let candidate = platoon.best_handoff_candidate()?;
        let candidate_pct = platoon
            .member(&candidate)
            .map(|m| m.battery_pct)
            .unwrap_or(0.0);
        if candidate_pct <= ctx.config.platoon_deficit_threshold_pct {
            return None;
        }

        platoon.set_head(candidate);
        let slots = platoon.available_slots(ctx.config.platoon_max_size) as u8;
        let beacon = build_beacon(platoon, ctx.state.position, ctx.state.velocity, slots);
        let platoon_id = platoon.platoon_id;
        ctx.emit(1, Message::PlatoonBeacon(beacon));
        let now = ctx.current_time();
        self.last_beacon = Some(now);
        info!(new_head = %short_id(&candidate), "platoon handed off");

        self.membership = stay.then(|| Membership {
            platoon_id,
            head_id: candidate,
            rel_index: 0,
            last_beacon_t: now,
            target_position: None,
        });
        self.platoon = None;
        Some(candidate)
    }

    /// Periodic work for the current role. Returns a role-change request
    /// when one happened.
    pub fn tick(&mut self, ctx: &mut Context) -> Option<PlatoonEvent> {
        match ctx.state.role {
            NodeRole::PlatoonHead => self.tick_as_head(ctx),
            NodeRole::PlatoonMember => self.tick_as_member(ctx),
            _ => {
                let pruned = self
                    .table
                    .prune(ctx.current_time(), ctx.config.platoon_entry_timeout);
                if pruned > 0 {
                    debug!(pruned, "stale platoon entries dropped");
                }
                None
            }
        }
    }

    fn tick_as_head(&mut self, ctx: &mut Context) -> Option<PlatoonEvent> {
        let now = ctx.current_time();
        let own_pct = ctx.state.battery_pct();

        let wants_handoff = {
            let Some(platoon) = self.platoon.as_mut() else {
                return None;
            };

            // Keep our own battery reading current for handoff decisions.
            if let Some(me) = platoon.members.iter_mut().find(|m| m.id == ctx.state.id) {
                m_update(me, own_pct, now);
            }

            let dropped =
                platoon.prune_stale_members(now, ctx.config.platoon_member_timeout);
            for id in &dropped {
                warn!(member = %short_id(id), "member timed out");
            }

            platoon.compute_optimal_formation(now, &ctx.config);
            platoon.apply_formation(&ctx.config);

            // Hand off while still holding the role: the bar sits above
            // the PH eligibility floor, and the candidate must improve on
            // the head.
            own_pct < ctx.config.ph_handoff_threshold_pct
                && platoon.len() > 1
                && platoon
                    .best_handoff_candidate()
                    .and_then(|c| platoon.member(&c).map(|m| m.battery_pct))
                    .is_some_and(|pct| pct > own_pct)
        };
        if wants_handoff {
            if let Some(new_head) = self.hand_off_platoon(ctx, true) {
                return Some(PlatoonEvent::HandedOffTo(new_head));
            }
        }

        let Some(platoon) = self.platoon.as_mut() else {
            return None;
        };

        // Periodic beacon with roster and formation targets.
        let beacon_due = match self.last_beacon {
            None => true,
            Some(last) => now - last >= ctx.config.beacon_interval,
        };
        if beacon_due {
            let slots = platoon.available_slots(ctx.config.platoon_max_size) as u8;
            let beacon =
                build_beacon(platoon, ctx.state.position, ctx.state.velocity, slots);
            ctx.emit(1, Message::PlatoonBeacon(beacon));
            self.last_beacon = Some(now);
        }

        // Slower inter-platoon announce.
        let announce_due = match self.last_announce {
            None => true,
            Some(last) => now - last >= ctx.config.platoon_announce_interval,
        };
        if announce_due {
            let direction = ctx.state.direction_vector();
            let surplus = ctx.state.shareable_energy(&ctx.config).max(0.0);
            let slots = platoon.available_slots(ctx.config.platoon_max_size) as u8;
            let efficiency = platoon.formation_efficiency();
            let destination = platoon
                .destination
                .or(ctx.state.destination)
                .unwrap_or(ctx.state.position);
            let announce = PlatoonAnnounce {
                platoon_id: platoon.platoon_id,
                head_id: ctx.state.id,
                position: (ctx.state.position.0 as f32, ctx.state.position.1 as f32),
                destination: (destination.0 as f32, destination.1 as f32),
                available_slots: slots,
                surplus_energy_kwh: surplus as f32,
                direction: (direction.0 as f32, direction.1 as f32),
                formation_efficiency: efficiency as f32,
                previous_hop: ctx.state.id,
            };
            let ttl = ctx.config.platoon_announce_ttl;
            ctx.emit(ttl, Message::PlatoonAnnounce(announce));
            self.last_announce = Some(now);
        }
        None
    }

    fn tick_as_member(&mut self, ctx: &mut Context) -> Option<PlatoonEvent> {
        let now = ctx.current_time();
        let Some(membership) = self.membership.as_ref() else {
            return None;
        };

        // Safe-mode exit after too many missed beacons.
        let loss_window =
            f64::from(ctx.config.n_missed_beacons) * ctx.config.beacon_interval;
        if now - membership.last_beacon_t > loss_window {
            warn!(
                head = %short_id(&membership.head_id),
                "beacon lost, leaving platoon"
            );
            ctx.metrics.beacon_losses += 1;
            self.membership = None;
            return Some(PlatoonEvent::LeftPlatoon);
        }

        let status_due = match self.last_status {
            None => true,
            Some(last) => now - last >= ctx.config.beacon_interval,
        };
        if status_due {
            let status = PlatoonStatus {
                platoon_id: membership.platoon_id,
                member_id: ctx.state.id,
                battery_pct: (ctx.state.battery_pct() * 100.0) as f32,
                relative_index: membership.rel_index,
                receive_rate: 1.0,
            };
            ctx.emit(1, Message::PlatoonStatus(status));
            self.last_status = Some(now);
        }
        None
    }

    /// Beacon intake: members refresh their head view and formation
    /// target; a beacon naming this node as head promotes it.
    pub fn handle_beacon(&mut self, ctx: &mut Context, beacon: &PlatoonBeacon) -> Option<PlatoonEvent> {
        let now = ctx.current_time();
        let self_id = ctx.state.id;

        if let Some(membership) = self.membership.as_mut() {
            if membership.platoon_id != beacon.platoon_id {
                return None; // someone else's platoon
            }
            membership.last_beacon_t = now;
            if beacon.head_id != membership.head_id {
                info!(
                    old = %short_id(&membership.head_id),
                    new = %short_id(&beacon.head_id),
                    "head changed"
                );
                membership.head_id = beacon.head_id;
            }
            if let Some((_, idx)) = beacon.topology.iter().find(|(id, _)| *id == self_id) {
                membership.rel_index = *idx;
            }
            if let Some((_, x, y)) =
                beacon.formation.iter().find(|(id, _, _)| *id == self_id)
            {
                membership.target_position = Some((*x as f64, *y as f64));
            }

            // A handoff beacon can name us as the new head.
            if beacon.head_id == self_id {
                let mut platoon = Platoon::new(self_id, ctx.state.destination, now);
                platoon.platoon_id = beacon.platoon_id;
                for (id, idx) in &beacon.topology {
                    if *id == self_id {
                        continue;
                    }
                    platoon.add_member(*id, 0.5, now, ctx.config.platoon_max_size);
                    platoon.update_member_status(id, 0.5, *idx, now);
                }
                platoon.set_head(self_id);
                self.platoon = Some(platoon);
                self.membership = None;
                info!("promoted to platoon head");
                return Some(PlatoonEvent::PromotedToHead);
            }
        }
        None
    }

    /// Status intake at the head.
    pub fn handle_status(&mut self, ctx: &mut Context, status: &PlatoonStatus) {
        let Some(platoon) = self.platoon.as_mut() else {
            return;
        };
        if status.platoon_id != platoon.platoon_id {
            ctx.metrics.dropped_unrelated += 1;
            return;
        }
        if !platoon.contains(&status.member_id) {
            return; // not on the roster; joins go through the handshake
        }
        platoon.update_member_status(
            &status.member_id,
            f64::from(status.battery_pct) / 100.0,
            status.relative_index,
            ctx.current_time(),
        );
        debug!(
            member = %short_id(&status.member_id),
            battery = status.battery_pct,
            "rx status"
        );
    }

    /// PLATOON_ANNOUNCE intake (already dedup-checked by Layer B).
    pub fn handle_announce(&mut self, ctx: &mut Context, ann: &PlatoonAnnounce) {
        if ann.head_id == ctx.state.id {
            return;
        }
        self.table.update_from_announce(ann, ctx.current_time());
        debug!(
            platoon = %short_id(&ann.platoon_id),
            surplus = ann.surplus_energy_kwh,
            slots = ann.available_slots,
            "rx platoon announce"
        );
    }
}

impl Default for PlatoonCoordination {
    fn default() -> Self {
        Self::new()
    }
}

fn m_update(member: &mut MemberInfo, battery_pct: f64, now: f64) {
    member.battery_pct = battery_pct;
    member.last_status_t = now;
}

fn build_beacon(
    platoon: &Platoon,
    position: Position,
    velocity: (f64, f64),
    available_slots: u8,
) -> PlatoonBeacon {
    let formation: Vec<(NodeId, f32, f32)> = {
        let mut targets: Vec<(NodeId, f32, f32)> = platoon
            .target_formation
            .iter()
            .map(|(id, (x, y))| (*id, *x as f32, *y as f32))
            .collect();
        targets.sort_by(|a, b| a.0.cmp(&b.0));
        targets
    };
    PlatoonBeacon {
        platoon_id: platoon.platoon_id,
        head_id: platoon.head_id,
        position: (position.0 as f32, position.1 as f32),
        velocity: (velocity.0 as f32, velocity.1 as f32),
        available_slots,
        topology: platoon.topology_vector(),
        formation,
    }
}
