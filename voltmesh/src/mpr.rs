//! QoS-weighted multipoint relay selection.
//!
//! Greedy OLSR MPR selection over a neighbor-table snapshot: every strict
//! two-hop neighbor must stay covered by some selected one-hop neighbor.
//! Ties break on the QoS rank, then on the lower node id, so the outcome
//! is a pure function of the snapshot.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::OlsrWeights;
use crate::neighbor::NeighborEntry;
use crate::types::{mobility_similarity, NodeId, Velocity};

/// Jitter above this saturates the delay score at zero.
const MAX_ACCEPTABLE_JITTER_MS: f64 = 100.0;

/// Composite QoS rank of a neighbor as an MPR candidate. Higher is better.
pub fn qos_score(entry: &NeighborEntry, my_velocity: Velocity, w: &OlsrWeights) -> f64 {
    let battery = entry.battery_pct().clamp(0.0, 1.0);
    let etx = 1.0 / entry.etx.max(1.0);
    let delay = (1.0 - entry.jitter_ms.max(0.0) / MAX_ACCEPTABLE_JITTER_MS).max(0.0);
    let mobility = mobility_similarity(my_velocity, entry.velocity);
    let willingness = f64::from(entry.willingness.min(7)) / 7.0;
    let congestion = 1.0 - entry.lane_weight.clamp(0.0, 1.0);
    let stability = entry.link_stability.clamp(0.0, 1.0);

    w.battery * battery
        + w.etx * etx
        + w.delay * delay
        + w.mobility * mobility
        + w.willingness * willingness
        + w.congestion * congestion
        + w.stability * stability
}

/// Select the MPR set covering the full strict two-hop neighborhood.
///
/// 1. Two-hop ids reachable through exactly one neighbor make that
///    neighbor essential.
/// 2. While anything stays uncovered, take the candidate covering the most
///    of it; ties by QoS rank, then lower id.
///
/// An empty two-hop set yields an empty MPR set.
pub fn select_mprs(
    self_id: &NodeId,
    my_velocity: Velocity,
    neighbors: &[NeighborEntry],
    weights: &OlsrWeights,
) -> BTreeSet<NodeId> {
    let one_hop: BTreeSet<NodeId> = neighbors.iter().map(|n| n.id).collect();

    // Strict two-hop set: advertised neighbors that are neither us nor
    // already one-hop.
    let mut two_hop: BTreeSet<NodeId> = BTreeSet::new();
    for n in neighbors {
        for id in &n.two_hop {
            if id != self_id && !one_hop.contains(id) {
                two_hop.insert(*id);
            }
        }
    }

    let mut mpr_set: BTreeSet<NodeId> = BTreeSet::new();
    if two_hop.is_empty() {
        return mpr_set;
    }

    // Coverage map: two-hop id -> covering one-hop neighbors.
    let mut coverers: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
    for n in neighbors {
        for id in &n.two_hop {
            if two_hop.contains(id) {
                coverers.entry(*id).or_default().push(n.id);
            }
        }
    }

    let covered_by = |mpr: &NodeId| -> Vec<NodeId> {
        neighbors
            .iter()
            .find(|n| n.id == *mpr)
            .map(|n| {
                n.two_hop
                    .iter()
                    .filter(|id| two_hop.contains(*id))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    };

    let mut uncovered = two_hop.clone();

    // Essential MPRs: sole path to some two-hop node.
    for covering in coverers.values() {
        if covering.len() == 1 {
            let essential = covering[0];
            if mpr_set.insert(essential) {
                for id in covered_by(&essential) {
                    uncovered.remove(&id);
                }
            }
        }
    }

    // Greedy selection for the rest. Candidates iterate in ascending id so
    // exact ties keep the lower id.
    while !uncovered.is_empty() {
        let mut best: Option<(NodeId, usize, f64)> = None;
        for n in neighbors {
            if mpr_set.contains(&n.id) {
                continue;
            }
            let coverage = n.two_hop.iter().filter(|id| uncovered.contains(*id)).count();
            if coverage == 0 {
                continue;
            }
            let score = qos_score(n, my_velocity, weights);
            let better = match &best {
                None => true,
                Some((_, best_cov, best_score)) => {
                    coverage > *best_cov || (coverage == *best_cov && score > *best_score)
                }
            };
            if better {
                best = Some((n.id, coverage, score));
            }
        }
        match best {
            Some((id, _, _)) => {
                mpr_set.insert(id);
                for covered in covered_by(&id) {
                    uncovered.remove(&covered);
                }
            }
            None => break, // remaining two-hop ids unreachable through any candidate
        }
    }

    mpr_set
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neighbor(id: u8, two_hop: &[u8]) -> NeighborEntry {
        let mut e = NeighborEntry::new([id; 6], 0.0);
        e.two_hop = two_hop.iter().map(|b| [*b; 6]).collect();
        e
    }

    #[test]
    fn test_empty_two_hop_empty_mprs() {
        let neighbors = vec![neighbor(2, &[]), neighbor(3, &[])];
        let mprs = select_mprs(
            &[1; 6],
            (0.0, 0.0),
            &neighbors,
            &OlsrWeights::default(),
        );
        assert!(mprs.is_empty());
    }

    #[test]
    fn test_spec_topology() {
        // One-hop {B=2, C=3, D=4}; two-hop {E=5, F=6, G=7}.
        // E only via B; F via C and D; G only via D. Expect {B, D}.
        let neighbors = vec![
            neighbor(2, &[5]),
            neighbor(3, &[6]),
            neighbor(4, &[6, 7]),
        ];
        let mprs = select_mprs(
            &[1; 6],
            (0.0, 0.0),
            &neighbors,
            &OlsrWeights::default(),
        );
        let expected: BTreeSet<NodeId> = [[2; 6], [4; 6]].into_iter().collect();
        assert_eq!(mprs, expected);
    }

    #[test]
    fn test_cover_invariant() {
        let neighbors = vec![
            neighbor(2, &[10, 11]),
            neighbor(3, &[11, 12]),
            neighbor(4, &[12, 13]),
            neighbor(5, &[13, 10]),
        ];
        let mprs = select_mprs(
            &[1; 6],
            (0.0, 0.0),
            &neighbors,
            &OlsrWeights::default(),
        );
        // Union of two-hop nodes covered by MPRs equals the full set.
        let mut covered: BTreeSet<NodeId> = BTreeSet::new();
        for n in &neighbors {
            if mprs.contains(&n.id) {
                covered.extend(n.two_hop.iter().copied());
            }
        }
        let full: BTreeSet<NodeId> = [10u8, 11, 12, 13].iter().map(|b| [*b; 6]).collect();
        assert_eq!(covered, full);
    }

    #[test]
    fn test_one_hop_excluded_from_two_hop() {
        // Neighbor 3 advertises neighbor 2 (also one-hop for us) and us.
        let neighbors = vec![neighbor(2, &[]), neighbor(3, &[1, 2])];
        let mprs = select_mprs(
            &[1; 6],
            (0.0, 0.0),
            &neighbors,
            &OlsrWeights::default(),
        );
        assert!(mprs.is_empty());
    }

    #[test]
    fn test_qos_tiebreak() {
        // Both 2 and 3 cover {9}; 3 has better battery, so wins.
        let mut a = neighbor(2, &[9]);
        a.battery_energy_kwh = 20.0;
        let mut b = neighbor(3, &[9]);
        b.battery_energy_kwh = 90.0;
        let mprs = select_mprs(
            &[1; 6],
            (0.0, 0.0),
            &[a, b],
            &OlsrWeights::default(),
        );
        let expected: BTreeSet<NodeId> = [[3; 6]].into_iter().collect();
        assert_eq!(mprs, expected);
    }

    #[test]
    fn test_id_tiebreak_on_equal_qos() {
        // Identical QoS and coverage: lower id wins.
        let a = neighbor(2, &[9]);
        let b = neighbor(3, &[9]);
        let mprs = select_mprs(
            &[1; 6],
            (0.0, 0.0),
            &[a, b],
            &OlsrWeights::default(),
        );
        let expected: BTreeSet<NodeId> = [[2; 6]].into_iter().collect();
        assert_eq!(mprs, expected);
    }
}
