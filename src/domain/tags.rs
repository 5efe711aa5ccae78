use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::Mutex;

use super::PumpCommand;

/// Errors from the physical layer behind the tag contract.
#[derive(Debug, Error)]
pub enum StationError {
    #[error("command rejected by physical layer: {0}")]
    CommandRejected(String),

    #[error("communication error: {0}")]
    Communication(String),
}

/// Sensor tags consumed from the physical control system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StationTag {
    /// `L1` - tunnel level, m
    TunnelLevel,
    /// `V` - tunnel volume, m³
    TunnelVolume,
    /// `F1` - inflow, m³/h
    Inflow,
    /// `F2` - outflow, m³/h
    Outflow,
}

impl StationTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            StationTag::TunnelLevel => "L1",
            StationTag::TunnelVolume => "V",
            StationTag::Inflow => "F1",
            StationTag::Outflow => "F2",
        }
    }
}

impl std::str::FromStr for StationTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "L1" => Ok(StationTag::TunnelLevel),
            "V" => Ok(StationTag::TunnelVolume),
            "F1" => Ok(StationTag::Inflow),
            "F2" => Ok(StationTag::Outflow),
            _ => Err(format!("unknown station tag: {}", s)),
        }
    }
}

/// Per-pump telemetry (`status`, `frequency`, `power` tags).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PumpTelemetry {
    pub pump_id: String,
    pub running: bool,
    pub frequency_hz: f64,
    pub power_kw: f64,
}

/// One read of the full tag set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StationSnapshot {
    pub timestamp: DateTime<Utc>,
    pub level_m: f64,
    pub volume_m3: f64,
    pub inflow_m3h: f64,
    pub outflow_m3h: f64,
    pub pumps: Vec<PumpTelemetry>,
}

impl StationSnapshot {
    pub fn tag_value(&self, tag: StationTag) -> f64 {
        match tag {
            StationTag::TunnelLevel => self.level_m,
            StationTag::TunnelVolume => self.volume_m3,
            StationTag::Inflow => self.inflow_m3h,
            StationTag::Outflow => self.outflow_m3h,
        }
    }
}

/// Boundary to the physical pump station. Read cadence and command cadence
/// are the caller's concern; this port only carries the tag contract.
#[async_trait]
pub trait PumpStation: Send + Sync {
    async fn read_snapshot(&self) -> Result<StationSnapshot, StationError>;
    async fn apply_commands(&self, commands: &[PumpCommand]) -> Result<(), StationError>;
}

/// Scripted station for tests: pops queued snapshots and records applied
/// commands; can be told to reject the next N command batches.
pub struct MockStation {
    snapshots: Mutex<VecDeque<StationSnapshot>>,
    fallback: StationSnapshot,
    pub applied: Mutex<Vec<PumpCommand>>,
    reject_remaining: Mutex<u32>,
}

impl MockStation {
    pub fn new(fallback: StationSnapshot) -> Self {
        Self {
            snapshots: Mutex::new(VecDeque::new()),
            fallback,
            applied: Mutex::new(Vec::new()),
            reject_remaining: Mutex::new(0),
        }
    }

    pub async fn queue_snapshot(&self, snapshot: StationSnapshot) {
        self.snapshots.lock().await.push_back(snapshot);
    }

    pub async fn reject_next(&self, batches: u32) {
        *self.reject_remaining.lock().await = batches;
    }
}

#[async_trait]
impl PumpStation for MockStation {
    async fn read_snapshot(&self) -> Result<StationSnapshot, StationError> {
        Ok(self
            .snapshots
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone()))
    }

    async fn apply_commands(&self, commands: &[PumpCommand]) -> Result<(), StationError> {
        let mut remaining = self.reject_remaining.lock().await;
        if *remaining > 0 {
            *remaining -= 1;
            return Err(StationError::CommandRejected("scripted rejection".into()));
        }
        self.applied.lock().await.extend_from_slice(commands);
        Ok(())
    }
}
