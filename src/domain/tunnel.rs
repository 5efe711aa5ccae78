use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tolerance used when checking level/volume consistency, m³.
const VOLUME_EPSILON_M3: f64 = 1.0;

#[derive(Debug, Error)]
pub enum TunnelStateError {
    #[error("tunnel level {level_m:.2}m outside [0, {max_level_m:.2}]m")]
    LevelOutOfRange { level_m: f64, max_level_m: f64 },

    #[error("volume {volume_m3:.0}m³ inconsistent with level {level_m:.2}m (expected {expected_m3:.0}m³)")]
    VolumeMismatch {
        level_m: f64,
        volume_m3: f64,
        expected_m3: f64,
    },
}

/// Storage tunnel geometry. The tunnel is treated as a prismatic channel,
/// so level and volume map linearly onto each other.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TunnelGeometry {
    pub max_level_m: f64,
    pub max_volume_m3: f64,
}

impl TunnelGeometry {
    pub fn new(max_level_m: f64, max_volume_m3: f64) -> Self {
        Self {
            max_level_m,
            max_volume_m3,
        }
    }

    pub fn level_to_volume(&self, level_m: f64) -> f64 {
        (level_m / self.max_level_m).clamp(0.0, 1.0) * self.max_volume_m3
    }

    pub fn volume_to_level(&self, volume_m3: f64) -> f64 {
        (volume_m3 / self.max_volume_m3).clamp(0.0, 1.0) * self.max_level_m
    }
}

/// Immutable snapshot of the tunnel at one instant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelState {
    pub level_m: f64,
    pub volume_m3: f64,
    pub inflow_m3h: f64,
    pub outflow_m3h: f64,
    pub timestamp: DateTime<Utc>,
}

impl TunnelState {
    /// Snapshot with no pumping and a level-consistent volume.
    pub fn at_rest(geometry: &TunnelGeometry, level_m: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            level_m,
            volume_m3: geometry.level_to_volume(level_m),
            inflow_m3h: 0.0,
            outflow_m3h: 0.0,
            timestamp,
        }
    }

    pub fn validate(&self, geometry: &TunnelGeometry) -> Result<(), TunnelStateError> {
        if self.level_m < 0.0 || self.level_m > geometry.max_level_m {
            return Err(TunnelStateError::LevelOutOfRange {
                level_m: self.level_m,
                max_level_m: geometry.max_level_m,
            });
        }
        let expected = geometry.level_to_volume(self.level_m);
        if (self.volume_m3 - expected).abs() > VOLUME_EPSILON_M3 {
            return Err(TunnelStateError::VolumeMismatch {
                level_m: self.level_m,
                volume_m3: self.volume_m3,
                expected_m3: expected,
            });
        }
        Ok(())
    }

    /// Remaining storage before the physical top of the tunnel.
    pub fn headroom_m3(&self, geometry: &TunnelGeometry) -> f64 {
        (geometry.max_volume_m3 - self.volume_m3).max(0.0)
    }
}
