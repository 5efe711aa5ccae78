use chrono::Duration;
use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConstraintConfigError {
    #[error("{field} must be positive (got {value})")]
    NonPositive { field: &'static str, value: f64 },

    #[error("surge_reserve_fraction must be in [0, 1) (got {0})")]
    InvalidSurgeReserve(f64),

    #[error("rain_probability_threshold must be in [0, 1] (got {0})")]
    InvalidRainThreshold(f64),

    #[error("emptying_watermark_m {watermark} must be below max_level_m {max_level}")]
    WatermarkAboveMax { watermark: f64, max_level: f64 },
}

/// The constraint families the pipeline enforces. Used both to cite the
/// tightest violated constraint on infeasibility and as compliance-counter
/// keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConstraintKind {
    StorageCapacity,
    OutflowVariation,
    PumpCycle,
    FrequencyFloor,
    DailyEmptying,
    SurgeReserve,
}

pub const ALL_CONSTRAINTS: [ConstraintKind; 6] = [
    ConstraintKind::StorageCapacity,
    ConstraintKind::OutflowVariation,
    ConstraintKind::PumpCycle,
    ConstraintKind::FrequencyFloor,
    ConstraintKind::DailyEmptying,
    ConstraintKind::SurgeReserve,
];

/// Process-wide operational thresholds. Loaded once at startup, read-only
/// afterwards; the supervisor owns the authoritative copy.
#[derive(Debug, Clone)]
pub struct ConstraintSet {
    pub max_level_m: f64,
    pub max_volume_m3: f64,
    /// Bounded-variation band on total outflow: maximum allowed
    /// step-to-step change, m³/h.
    pub outflow_variation_m3h: f64,
    pub min_pump_cycle: Duration,
    pub min_frequency_hz: f64,
    /// Level must return below the watermark at least once per 24h.
    pub require_daily_emptying: bool,
    pub emptying_watermark_m: f64,
    /// Volume headroom kept free for surge events, as a fraction of
    /// max_volume, unless the inflow forecast justifies using it.
    pub surge_reserve_fraction: f64,
    pub rain_probability_threshold: f64,
}

impl ConstraintSet {
    pub fn validate(&self) -> Result<(), ConstraintConfigError> {
        for (field, value) in [
            ("max_level_m", self.max_level_m),
            ("max_volume_m3", self.max_volume_m3),
            ("outflow_variation_m3h", self.outflow_variation_m3h),
            ("min_frequency_hz", self.min_frequency_hz),
        ] {
            if value <= 0.0 {
                return Err(ConstraintConfigError::NonPositive { field, value });
            }
        }
        if !(0.0..1.0).contains(&self.surge_reserve_fraction) {
            return Err(ConstraintConfigError::InvalidSurgeReserve(
                self.surge_reserve_fraction,
            ));
        }
        if !(0.0..=1.0).contains(&self.rain_probability_threshold) {
            return Err(ConstraintConfigError::InvalidRainThreshold(
                self.rain_probability_threshold,
            ));
        }
        if self.emptying_watermark_m >= self.max_level_m {
            return Err(ConstraintConfigError::WatermarkAboveMax {
                watermark: self.emptying_watermark_m,
                max_level: self.max_level_m,
            });
        }
        Ok(())
    }

    /// Volume ceiling while the surge reserve is held back.
    pub fn reserved_volume_cap_m3(&self) -> f64 {
        self.max_volume_m3 * (1.0 - self.surge_reserve_fraction)
    }

    /// Relaxed copy used by the supervisor's first infeasibility fallback.
    pub fn without_surge_reserve(&self) -> Self {
        Self {
            surge_reserve_fraction: 0.0,
            ..self.clone()
        }
    }
}

impl Default for ConstraintSet {
    fn default() -> Self {
        Self {
            max_level_m: 8.0,
            max_volume_m3: 225_850.0,
            outflow_variation_m3h: 9_000.0,
            min_pump_cycle: Duration::hours(2),
            min_frequency_hz: 47.5,
            require_daily_emptying: true,
            emptying_watermark_m: 0.8,
            surge_reserve_fraction: 0.2,
            rain_probability_threshold: 0.6,
        }
    }
}
