//! Physical simulation of the storage tunnel and pump bank. Pure physics,
//! no policy: given a state, a command set and a duration, integrate the
//! mass balance and report the resulting state.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::domain::{Pump, PumpCommand, TunnelGeometry, TunnelState};

#[derive(Debug, Error)]
pub enum ModelError {
    /// The level would exceed the physical top of the tunnel. Reported
    /// instead of silently clamping, since it signals a planning failure.
    #[error("tunnel capacity exceeded at {timestamp}: level would reach {level_m:.2}m")]
    CapacityExceeded {
        level_m: f64,
        timestamp: DateTime<Utc>,
    },

    #[error("command references unknown pump {pump_id}")]
    UnknownPump { pump_id: String },
}

/// Deterministic tunnel model: explicit Euler integration at a fixed,
/// configurable step so trajectories are reproducible.
#[derive(Debug, Clone)]
pub struct TunnelModel {
    geometry: TunnelGeometry,
    pumps: Vec<Pump>,
    dt_s: f64,
}

impl TunnelModel {
    pub fn new(geometry: TunnelGeometry, pumps: Vec<Pump>, dt_s: f64) -> Self {
        Self {
            geometry,
            pumps,
            dt_s: dt_s.max(1.0),
        }
    }

    pub fn geometry(&self) -> &TunnelGeometry {
        &self.geometry
    }

    pub fn pumps(&self) -> &[Pump] {
        &self.pumps
    }

    pub fn pump(&self, pump_id: &str) -> Option<&Pump> {
        self.pumps.iter().find(|p| p.id == pump_id)
    }

    /// Combined pumped outflow for a command set, m³/h.
    pub fn total_outflow_m3h(&self, commands: &[PumpCommand]) -> Result<f64, ModelError> {
        let mut total = 0.0;
        for cmd in commands {
            let pump = self.pump(&cmd.pump_id).ok_or_else(|| ModelError::UnknownPump {
                pump_id: cmd.pump_id.clone(),
            })?;
            total += pump.flow_at(cmd.frequency_hz);
        }
        Ok(total)
    }

    /// Combined electrical power for a command set, kW.
    pub fn total_power_kw(&self, commands: &[PumpCommand]) -> Result<f64, ModelError> {
        let mut total = 0.0;
        for cmd in commands {
            let pump = self.pump(&cmd.pump_id).ok_or_else(|| ModelError::UnknownPump {
                pump_id: cmd.pump_id.clone(),
            })?;
            total += pump.power_at(cmd.frequency_hz);
        }
        Ok(total)
    }

    /// Integrate inflow and pump action over `duration` with the commanded
    /// frequencies held constant. The inflow is taken from `state`.
    ///
    /// The bottom of the tunnel clamps: an empty tunnel starves the pumps
    /// and the effective outflow drops to the inflow. The top does not:
    /// overflow is an error.
    pub fn advance(
        &self,
        state: &TunnelState,
        commands: &[PumpCommand],
        duration: Duration,
    ) -> Result<TunnelState, ModelError> {
        let commanded_outflow = self.total_outflow_m3h(commands)?;
        let total_s = duration.num_milliseconds() as f64 / 1_000.0;

        let mut volume = state.volume_m3;
        let mut elapsed = 0.0;
        let mut effective_outflow = commanded_outflow;

        while elapsed < total_s {
            let dt = self.dt_s.min(total_s - elapsed);
            let dt_h = dt / 3_600.0;

            let delta = (state.inflow_m3h - commanded_outflow) * dt_h;
            let next = volume + delta;

            if next > self.geometry.max_volume_m3 {
                return Err(ModelError::CapacityExceeded {
                    level_m: self.geometry.max_level_m
                        * (next / self.geometry.max_volume_m3),
                    timestamp: state.timestamp + duration,
                });
            }

            if next < 0.0 {
                // Starved: pumps can only move what arrives.
                volume = 0.0;
                effective_outflow = state.inflow_m3h;
            } else {
                volume = next;
                effective_outflow = commanded_outflow;
            }

            elapsed += dt;
        }

        Ok(TunnelState {
            level_m: self.geometry.volume_to_level(volume),
            volume_m3: volume,
            inflow_m3h: state.inflow_m3h,
            outflow_m3h: effective_outflow,
            timestamp: state.timestamp + duration,
        })
    }
}
