use anyhow::Result;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::net::SocketAddr;

use crate::domain::{ConstraintSet, Pump, PumpClass, PumpSpec, TunnelGeometry};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub supervisor: SupervisorConfig,
    pub tunnel: TunnelConfig,
    pub constraints: ConstraintsConfig,
    pub forecast: ForecastConfig,
    pub planner: PlannerConfig,
    pub executor: ExecutorConfig,
    pub pumps: PumpsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub enable_cors: bool,
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Cadence of the forecast -> plan -> approve cycle.
    pub cycle_minutes: u64,
    /// Wall-clock driver of the execution loop; one tick = one schedule step.
    pub tick_seconds: u64,
    pub horizon_hours: u32,
    pub step_minutes: u32,
    pub forecast_validity_hours: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    pub max_level_m: f64,
    pub max_volume_m3: f64,
    pub initial_level_m: f64,
    /// Fixed Euler integration step of the tunnel model, seconds.
    pub integration_step_s: f64,
}

impl TunnelConfig {
    pub fn geometry(&self) -> TunnelGeometry {
        TunnelGeometry::new(self.max_level_m, self.max_volume_m3)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConstraintsConfig {
    pub max_level_m: f64,
    pub max_volume_m3: f64,
    pub outflow_variation_m3h: f64,
    pub min_pump_cycle_minutes: u32,
    pub min_frequency_hz: f64,
    pub require_daily_emptying: bool,
    pub emptying_watermark_m: f64,
    pub surge_reserve_fraction: f64,
    pub rain_probability_threshold: f64,
}

impl ConstraintsConfig {
    pub fn constraint_set(&self) -> ConstraintSet {
        ConstraintSet {
            max_level_m: self.max_level_m,
            max_volume_m3: self.max_volume_m3,
            outflow_variation_m3h: self.outflow_variation_m3h,
            min_pump_cycle: chrono::Duration::minutes(self.min_pump_cycle_minutes as i64),
            min_frequency_hz: self.min_frequency_hz,
            require_daily_emptying: self.require_daily_emptying,
            emptying_watermark_m: self.emptying_watermark_m,
            surge_reserve_fraction: self.surge_reserve_fraction,
            rain_probability_threshold: self.rain_probability_threshold,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForecastConfig {
    pub min_history_hours: u32,
    pub holdout_hours: u32,
    /// z-score used for the inflow confidence band.
    pub confidence_z: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlannerConfig {
    pub time_budget_seconds: u64,
    pub volume_buckets: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    pub tolerance_m: f64,
    pub deviation_trigger_steps: usize,
    pub correction_gain: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PumpsConfig {
    pub small: PumpClassConfig,
    pub large: PumpClassConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PumpClassConfig {
    pub count: usize,
    pub nominal_flow_m3h: f64,
    pub rated_power_kw: f64,
    pub max_efficiency: f64,
    pub min_frequency_hz: f64,
    pub max_frequency_hz: f64,
    pub min_cycle_minutes: u32,
}

impl PumpClassConfig {
    fn spec(&self) -> PumpSpec {
        PumpSpec {
            nominal_flow_m3h: self.nominal_flow_m3h,
            rated_power_kw: self.rated_power_kw,
            max_efficiency: self.max_efficiency,
            min_frequency_hz: self.min_frequency_hz,
            max_frequency_hz: self.max_frequency_hz,
            min_cycle: chrono::Duration::minutes(self.min_cycle_minutes as i64),
        }
    }
}

impl PumpsConfig {
    /// Build the pump catalog: S1..Sn then L1..Ln, stable id order.
    pub fn catalog(&self) -> Vec<Pump> {
        let mut pumps = Vec::with_capacity(self.small.count + self.large.count);
        let small = self.small.spec();
        for i in 0..self.small.count {
            pumps.push(Pump::from_spec(format!("S{}", i + 1), PumpClass::Small, &small));
        }
        let large = self.large.spec();
        for i in 0..self.large.count {
            pumps.push(Pump::from_spec(format!("L{}", i + 1), PumpClass::Large, &large));
        }
        pumps
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("AQUAOPT__").split("__"));
        Ok(figment.extract()?)
    }
}
