//! Simulated driving environment: diurnal inflow with rain events,
//! day/night energy prices with a configurable night valley, and a
//! simulated pump station behind the tag-contract port.
//!
//! Every signal is a pure function of (seed, timestamp), so simulated runs
//! are reproducible end to end.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Timelike, Utc};
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::config::Config;
use crate::domain::{
    Pump, PumpCommand, PumpStation, PumpTelemetry, StationError, StationSnapshot, TunnelState,
};
use crate::forecaster::{HistoryPoint, HistorySeries};

#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    pub seed: u64,
    pub base_inflow_m3h: f64,
    pub diurnal_amplitude_m3h: f64,
    /// Relative standard deviation of the per-hour inflow noise.
    pub noise_fraction: f64,
    pub day_price_eur_mwh: f64,
    pub night_price_eur_mwh: f64,
    /// Hours (0-23) belonging to the cheap night valley.
    pub valley_start_hour: u32,
    pub valley_end_hour: u32,
    /// A rain event recurs this often; 0 disables rain entirely.
    pub rain_period_hours: u32,
    pub rain_duration_hours: u32,
    pub rain_boost_m3h: f64,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            seed: 7,
            base_inflow_m3h: 10_000.0,
            diurnal_amplitude_m3h: 2_000.0,
            noise_fraction: 0.03,
            day_price_eur_mwh: 90.0,
            night_price_eur_mwh: 45.0,
            valley_start_hour: 22,
            valley_end_hour: 6,
            rain_period_hours: 72,
            rain_duration_hours: 5,
            rain_boost_m3h: 5_000.0,
        }
    }
}

/// Deterministic signal generator for inflow, price and rain.
#[derive(Debug, Clone)]
pub struct Environment {
    cfg: EnvironmentConfig,
}

impl Environment {
    pub fn new(cfg: EnvironmentConfig) -> Self {
        Self { cfg }
    }

    pub fn from_config(_cfg: &Config) -> Self {
        Self::new(EnvironmentConfig::default())
    }

    /// Hours since the epoch; the basic clock of all generated signals.
    fn epoch_hour(at: DateTime<Utc>) -> i64 {
        at.timestamp() / 3_600
    }

    /// Seeded per-hour noise sample, reproducible for a given timestamp.
    fn noise(&self, at: DateTime<Utc>, std_dev: f64) -> f64 {
        if std_dev <= 0.0 {
            return 0.0;
        }
        let mut rng = rand::rngs::StdRng::seed_from_u64(
            self.cfg.seed ^ Self::epoch_hour(at) as u64,
        );
        match Normal::new(0.0, std_dev) {
            Ok(normal) => normal.sample(&mut rng),
            Err(_) => 0.0,
        }
    }

    /// Position inside the recurring rain event, if any: 1.0 at the peak.
    fn rain_intensity(&self, at: DateTime<Utc>) -> f64 {
        if self.cfg.rain_period_hours == 0 || self.cfg.rain_duration_hours == 0 {
            return 0.0;
        }
        let hour = Self::epoch_hour(at).rem_euclid(self.cfg.rain_period_hours as i64) as u32;
        if hour >= self.cfg.rain_duration_hours {
            return 0.0;
        }
        let phase = (hour as f64 + 0.5) / self.cfg.rain_duration_hours as f64;
        (phase * std::f64::consts::PI).sin()
    }

    pub fn inflow_at(&self, at: DateTime<Utc>) -> f64 {
        let hour_of_day = at.hour() as f64 + at.minute() as f64 / 60.0;
        let diurnal = self.cfg.diurnal_amplitude_m3h
            * (hour_of_day / 24.0 * std::f64::consts::TAU).sin();
        let rain = self.rain_intensity(at) * self.cfg.rain_boost_m3h;
        let noise = self.noise(at, self.cfg.base_inflow_m3h * self.cfg.noise_fraction);
        (self.cfg.base_inflow_m3h + diurnal + rain + noise).max(0.0)
    }

    pub fn price_at(&self, at: DateTime<Utc>) -> f64 {
        let hour = at.hour();
        let in_valley = if self.cfg.valley_start_hour <= self.cfg.valley_end_hour {
            (self.cfg.valley_start_hour..self.cfg.valley_end_hour).contains(&hour)
        } else {
            hour >= self.cfg.valley_start_hour || hour < self.cfg.valley_end_hour
        };
        let base = if in_valley {
            self.cfg.night_price_eur_mwh
        } else {
            self.cfg.day_price_eur_mwh
        };
        // Mild day-to-day drift so consecutive days are not identical.
        let day = at.ordinal() as f64;
        base * (1.0 + 0.05 * (day / 7.0 * std::f64::consts::TAU).sin())
    }

    pub fn rain_probability_at(&self, at: DateTime<Utc>) -> f64 {
        (self.rain_intensity(at) * 1.2).clamp(0.0, 1.0)
    }
}

/// Backfill a history series covering `hours` up to (and including) `end`.
pub fn seed_history(environment: &Environment, end: DateTime<Utc>, hours: i64) -> HistorySeries {
    let points = (0..=hours)
        .map(|h| {
            let timestamp = end - chrono::Duration::hours(hours - h);
            HistoryPoint {
                timestamp,
                inflow_m3h: environment.inflow_at(timestamp),
                price_eur_mwh: environment.price_at(timestamp),
                rain_probability: environment.rain_probability_at(timestamp),
            }
        })
        .collect();
    HistorySeries::from_points(points)
}

/// Station port backed by the digital twin: tag reads mirror the shared
/// authoritative tunnel state, inflow (`F1`) comes from the environment,
/// and applied commands drive the exposed pump telemetry.
pub struct SimulatedPumpStation {
    environment: Environment,
    state: Arc<RwLock<TunnelState>>,
    pumps: Vec<Pump>,
    telemetry: Mutex<Vec<PumpTelemetry>>,
}

impl SimulatedPumpStation {
    pub fn new(
        environment: Environment,
        state: Arc<RwLock<TunnelState>>,
        pumps: Vec<Pump>,
    ) -> Self {
        let telemetry = pumps
            .iter()
            .map(|p| PumpTelemetry {
                pump_id: p.id.clone(),
                running: false,
                frequency_hz: 0.0,
                power_kw: 0.0,
            })
            .collect();
        Self {
            environment,
            state,
            pumps,
            telemetry: Mutex::new(telemetry),
        }
    }
}

#[async_trait]
impl PumpStation for SimulatedPumpStation {
    async fn read_snapshot(&self) -> Result<StationSnapshot, StationError> {
        let state = self.state.read().await.clone();
        Ok(StationSnapshot {
            timestamp: state.timestamp,
            level_m: state.level_m,
            volume_m3: state.volume_m3,
            inflow_m3h: self.environment.inflow_at(state.timestamp),
            outflow_m3h: state.outflow_m3h,
            pumps: self.telemetry.lock().await.clone(),
        })
    }

    async fn apply_commands(&self, commands: &[PumpCommand]) -> Result<(), StationError> {
        let mut telemetry = self.telemetry.lock().await;
        for command in commands {
            let Some(pump) = self.pumps.iter().find(|p| p.id == command.pump_id) else {
                return Err(StationError::CommandRejected(format!(
                    "unknown pump {}",
                    command.pump_id
                )));
            };
            if !pump.is_valid_frequency(command.frequency_hz) {
                return Err(StationError::CommandRejected(format!(
                    "{} cannot run at {:.2}Hz",
                    command.pump_id, command.frequency_hz
                )));
            }
            if let Some(slot) = telemetry.iter_mut().find(|t| t.pump_id == command.pump_id) {
                slot.running = command.frequency_hz > 0.0;
                slot.frequency_hz = command.frequency_hz;
                slot.power_kw = pump.power_at(command.frequency_hz);
            }
        }
        Ok(())
    }
}
