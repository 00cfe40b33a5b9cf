//! Protocol configuration, immutable after start.
//!
//! Defaults match the reference deployment profile. `validate()` runs at
//! node construction and rejects weight sets that do not sum to one,
//! non-positive intervals, and out-of-range thresholds.

use serde::{Deserialize, Serialize};

use crate::wire::WireLimits;
use crate::types::MAX_SEQUENCE_NUMBER;

/// TTL computation mode for outgoing PA messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TtlMode {
    /// Always `pa_ttl_default`.
    Fixed,
    /// `clamp(8 - floor(log2(max(1, neighbor_count))), pa_ttl_min, pa_ttl_max)`.
    DensityBased,
}

/// Weights for the QoS rank used in MPR selection. Must sum to 1.0.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct OlsrWeights {
    pub battery: f64,
    pub etx: f64,
    pub delay: f64,
    pub mobility: f64,
    pub willingness: f64,
    pub congestion: f64,
    pub stability: f64,
}

impl Default for OlsrWeights {
    fn default() -> Self {
        Self {
            battery: 0.20,
            etx: 0.20,
            delay: 0.15,
            mobility: 0.15,
            willingness: 0.10,
            congestion: 0.10,
            stability: 0.10,
        }
    }
}

impl OlsrWeights {
    pub fn sum(&self) -> f64 {
        self.battery
            + self.etx
            + self.delay
            + self.mobility
            + self.willingness
            + self.congestion
            + self.stability
    }
}

/// Weights for the intra-platoon energy-routing edge cost.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EdgeWeights {
    pub distance: f64,
    pub efficiency: f64,
    pub time: f64,
}

impl Default for EdgeWeights {
    fn default() -> Self {
        Self {
            distance: 0.4,
            efficiency: 0.3,
            time: 0.3,
        }
    }
}

/// Configuration error raised by [`ProtocolConfig::validate`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be positive, got {value}")]
    NonPositive { name: &'static str, value: f64 },
    #[error("{name} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        name: &'static str,
        min: f64,
        max: f64,
        value: f64,
    },
    #[error("olsr weights must sum to 1.0, got {sum}")]
    WeightSum { sum: f64 },
    #[error("pa ttl bounds inverted: min {min} > max {max}")]
    TtlBounds { min: u8, max: u8 },
    #[error(
        "ph_handoff_threshold_pct ({handoff}) must exceed ph_energy_threshold_percent ({eligibility})"
    )]
    HandoffBelowEligibility { handoff: f64, eligibility: f64 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    // Periodic emission intervals, seconds.
    pub hello_interval: f64,
    pub pa_interval: f64,
    pub beacon_interval: f64,
    pub platoon_announce_interval: f64,
    pub grid_status_interval: f64,
    pub formation_update_interval: f64,

    // Table timeouts, seconds.
    pub neighbor_timeout: f64,
    pub prune_interval: f64,
    pub provider_timeout: f64,
    pub platoon_entry_timeout: f64,
    pub platoon_member_timeout: f64,

    // PA TTL policy.
    pub ttl_mode: TtlMode,
    pub pa_ttl_default: u8,
    pub pa_ttl_min: u8,
    pub pa_ttl_max: u8,
    pub platoon_announce_ttl: u8,

    // Handshake timing, seconds.
    pub join_accept_timeout: f64,
    pub offer_window: f64,

    // Role thresholds.
    pub ph_energy_threshold_percent: f64,
    pub ph_willingness_threshold: u8,
    /// Must stay above `ph_energy_threshold_percent`: a sagging head has
    /// to hand its platoon off while it still holds the PH role.
    pub ph_handoff_threshold_pct: f64,

    // Platoon shape.
    pub platoon_max_size: usize,
    pub n_missed_beacons: u32,

    // Wireless-transfer edge model.
    pub edge_efficiency_scale: f64,
    pub edge_max_range_m: f64,
    pub edge_min_efficiency: f64,
    pub edge_weights: EdgeWeights,
    pub platoon_surplus_threshold_pct: f64,
    pub platoon_deficit_threshold_pct: f64,

    // Inter-platoon scoring weights.
    pub platoon_score_direction: f64,
    pub platoon_score_distance: f64,
    pub platoon_score_energy: f64,

    // Dedup bound.
    pub dedup_cache_size: usize,

    // MPR QoS rank weights.
    pub olsr_weights: OlsrWeights,

    // Energy model.
    pub energy_consumption_rate_kwh_per_km: f64,

    // Consumer selection policy.
    pub blacklist_duration: f64,
    pub queue_time_weight: f64,
    pub rreh_avg_session_duration: f64,
    pub max_acceptable_queue_time: f64,
    pub urgency_critical: f64,
    pub urgency_low: f64,
    pub threshold_critical: f64,
    pub threshold_low: f64,
    pub threshold_healthy: f64,
    pub green_bonus_weight: f64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            hello_interval: 1.0,
            pa_interval: 5.0,
            beacon_interval: 2.0,
            platoon_announce_interval: 5.0,
            grid_status_interval: 10.0,
            formation_update_interval: 2.0,

            neighbor_timeout: 5.0,
            prune_interval: 1.0,
            provider_timeout: 10.0,
            platoon_entry_timeout: 15.0,
            platoon_member_timeout: 10.0,

            ttl_mode: TtlMode::Fixed,
            pa_ttl_default: 4,
            pa_ttl_min: 2,
            pa_ttl_max: 6,
            platoon_announce_ttl: 3,

            join_accept_timeout: 5.0,
            offer_window: 3.0,

            ph_energy_threshold_percent: 0.60,
            ph_willingness_threshold: 4,
            ph_handoff_threshold_pct: 0.65,

            platoon_max_size: 6,
            n_missed_beacons: 3,

            edge_efficiency_scale: 0.1,
            edge_max_range_m: 10.0,
            edge_min_efficiency: 0.1,
            edge_weights: EdgeWeights::default(),
            platoon_surplus_threshold_pct: 0.70,
            platoon_deficit_threshold_pct: 0.40,

            platoon_score_direction: 0.4,
            platoon_score_distance: 0.3,
            platoon_score_energy: 0.3,

            dedup_cache_size: 10_000,

            olsr_weights: OlsrWeights::default(),

            energy_consumption_rate_kwh_per_km: 0.15,

            blacklist_duration: 30.0,
            queue_time_weight: 0.01,
            rreh_avg_session_duration: 1800.0,
            max_acceptable_queue_time: 3600.0,
            urgency_critical: 1.0,
            urgency_low: 1.2,
            threshold_critical: 1.0,
            threshold_low: 0.50,
            threshold_healthy: 0.20,
            green_bonus_weight: 1.0,
        }
    }
}

impl ProtocolConfig {
    /// Validate the configuration. Called once at node construction.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("hello_interval", self.hello_interval),
            ("pa_interval", self.pa_interval),
            ("beacon_interval", self.beacon_interval),
            ("platoon_announce_interval", self.platoon_announce_interval),
            ("grid_status_interval", self.grid_status_interval),
            ("formation_update_interval", self.formation_update_interval),
            ("neighbor_timeout", self.neighbor_timeout),
            ("provider_timeout", self.provider_timeout),
            ("platoon_entry_timeout", self.platoon_entry_timeout),
            ("join_accept_timeout", self.join_accept_timeout),
            ("offer_window", self.offer_window),
            ("edge_max_range_m", self.edge_max_range_m),
            (
                "energy_consumption_rate_kwh_per_km",
                self.energy_consumption_rate_kwh_per_km,
            ),
        ];
        for (name, value) in positive {
            if value <= 0.0 {
                return Err(ConfigError::NonPositive { name, value });
            }
        }

        let sum = self.olsr_weights.sum();
        if (sum - 1.0).abs() > 1e-5 {
            return Err(ConfigError::WeightSum { sum });
        }

        if !(0.0..=1.0).contains(&self.ph_energy_threshold_percent) {
            return Err(ConfigError::OutOfRange {
                name: "ph_energy_threshold_percent",
                min: 0.0,
                max: 1.0,
                value: self.ph_energy_threshold_percent,
            });
        }
        if self.ph_willingness_threshold > 7 {
            return Err(ConfigError::OutOfRange {
                name: "ph_willingness_threshold",
                min: 0.0,
                max: 7.0,
                value: self.ph_willingness_threshold as f64,
            });
        }
        if !(0.0..=1.0).contains(&self.ph_handoff_threshold_pct) {
            return Err(ConfigError::OutOfRange {
                name: "ph_handoff_threshold_pct",
                min: 0.0,
                max: 1.0,
                value: self.ph_handoff_threshold_pct,
            });
        }
        // The handoff bar must sit above the PH eligibility floor: the
        // role manager strips the head role at the floor, and the platoon
        // layer's proactive handoff only runs while the role is held.
        if self.ph_handoff_threshold_pct <= self.ph_energy_threshold_percent {
            return Err(ConfigError::HandoffBelowEligibility {
                handoff: self.ph_handoff_threshold_pct,
                eligibility: self.ph_energy_threshold_percent,
            });
        }
        if !(0.0..=1.0).contains(&self.edge_min_efficiency) {
            return Err(ConfigError::OutOfRange {
                name: "edge_min_efficiency",
                min: 0.0,
                max: 1.0,
                value: self.edge_min_efficiency,
            });
        }
        if self.pa_ttl_min > self.pa_ttl_max {
            return Err(ConfigError::TtlBounds {
                min: self.pa_ttl_min,
                max: self.pa_ttl_max,
            });
        }
        Ok(())
    }

    /// Semantic decode bounds derived from this configuration.
    pub fn wire_limits(&self) -> WireLimits {
        WireLimits {
            forwardable_ttl_max: self.pa_ttl_max,
            max_seq: MAX_SEQUENCE_NUMBER,
        }
    }

    /// TTL for an outgoing PA, per the configured mode.
    pub fn effective_pa_ttl(&self, neighbor_count: usize) -> u8 {
        match self.ttl_mode {
            TtlMode::Fixed => self.pa_ttl_default,
            TtlMode::DensityBased => {
                let n = neighbor_count.max(1) as u32;
                let ttl = 8i32 - n.ilog2() as i32;
                ttl.clamp(self.pa_ttl_min as i32, self.pa_ttl_max as i32) as u8
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert_eq!(ProtocolConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_weight_sum_rejected() {
        let mut cfg = ProtocolConfig::default();
        cfg.olsr_weights.battery = 0.5;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::WeightSum { .. })
        ));
    }

    #[test]
    fn test_nonpositive_interval_rejected() {
        let cfg = ProtocolConfig {
            hello_interval: 0.0,
            ..ProtocolConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::NonPositive {
                name: "hello_interval",
                ..
            })
        ));
    }

    #[test]
    fn test_fixed_ttl() {
        let cfg = ProtocolConfig::default();
        assert_eq!(cfg.effective_pa_ttl(0), 4);
        assert_eq!(cfg.effective_pa_ttl(100), 4);
    }

    #[test]
    fn test_density_ttl() {
        let cfg = ProtocolConfig {
            ttl_mode: TtlMode::DensityBased,
            ..ProtocolConfig::default()
        };
        // 8 - log2(n), clamped to [2, 6]
        assert_eq!(cfg.effective_pa_ttl(0), 6); // n clamped to 1, 8-0=8 -> 6
        assert_eq!(cfg.effective_pa_ttl(1), 6);
        assert_eq!(cfg.effective_pa_ttl(4), 6);
        assert_eq!(cfg.effective_pa_ttl(8), 5);
        assert_eq!(cfg.effective_pa_ttl(64), 2);
        assert_eq!(cfg.effective_pa_ttl(1024), 2);
    }

    #[test]
    fn test_handoff_bar_below_eligibility_rejected() {
        let cfg = ProtocolConfig {
            ph_handoff_threshold_pct: 0.30, // below the 0.60 PH floor
            ..ProtocolConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::HandoffBelowEligibility { .. })
        ));
    }

    #[test]
    fn test_inverted_ttl_bounds_rejected() {
        let cfg = ProtocolConfig {
            pa_ttl_min: 6,
            pa_ttl_max: 2,
            ..ProtocolConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::TtlBounds { .. })));
    }
}
