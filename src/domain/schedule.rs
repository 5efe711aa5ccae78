use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::Display;
use thiserror::Error;
use uuid::Uuid;

use super::PumpCommand;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid schedule transition {from} -> {to}")]
    InvalidTransition {
        from: ScheduleStatus,
        to: ScheduleStatus,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ScheduleStatus {
    Proposed,
    Approved,
    Superseded,
}

/// Planner-predicted tunnel trajectory for one step; the executor's
/// tracking reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrajectoryPoint {
    pub timestamp: DateTime<Utc>,
    pub level_m: f64,
    pub outflow_m3h: f64,
}

/// Flat export record for the schedule wire/file format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleRecord {
    pub pump_id: String,
    pub timestamp: DateTime<Utc>,
    pub frequency_hz: f64,
}

/// Pump-frequency plan over the horizon, tagged with the forecast it was
/// optimized against. Lifecycle: created `proposed`, supervisor approval
/// moves it to `approved`, a newer generation marks it `superseded`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Schedule {
    pub id: Uuid,
    pub forecast_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub step_minutes: i64,
    pub status: ScheduleStatus,
    /// True when the solver hit its time budget and the incumbent was
    /// returned instead of a proven optimum.
    pub suboptimal: bool,
    /// True once an operator override has been applied on top of the plan.
    pub overridden: bool,
    /// Expected energy cost over the horizon, EUR.
    pub energy_cost_eur: f64,
    /// One command per pump per step, ordered by (effective_from, pump_id).
    pub commands: Vec<PumpCommand>,
    pub predicted: Vec<TrajectoryPoint>,
}

impl Schedule {
    pub fn step(&self) -> Duration {
        Duration::minutes(self.step_minutes)
    }

    pub fn horizon_start(&self) -> Option<DateTime<Utc>> {
        self.predicted.first().map(|p| p.timestamp)
    }

    pub fn horizon_end(&self) -> Option<DateTime<Utc>> {
        self.predicted.last().map(|p| p.timestamp + self.step())
    }

    /// Latest command per pump effective at `t`.
    pub fn commands_at(&self, t: DateTime<Utc>) -> Vec<PumpCommand> {
        let mut latest: BTreeMap<&str, &PumpCommand> = BTreeMap::new();
        for cmd in self.commands.iter().filter(|c| c.effective_from <= t) {
            let entry = latest.entry(cmd.pump_id.as_str()).or_insert(cmd);
            if cmd.effective_from >= entry.effective_from {
                *entry = cmd;
            }
        }
        latest.into_values().cloned().collect()
    }

    /// Predicted trajectory point whose step interval contains `t`.
    pub fn predicted_at(&self, t: DateTime<Utc>) -> Option<&TrajectoryPoint> {
        let step = self.step();
        self.predicted
            .iter()
            .find(|p| t >= p.timestamp && t < p.timestamp + step)
    }

    pub fn approve(&mut self) -> Result<(), ScheduleError> {
        match self.status {
            ScheduleStatus::Proposed => {
                self.status = ScheduleStatus::Approved;
                Ok(())
            }
            from => Err(ScheduleError::InvalidTransition {
                from,
                to: ScheduleStatus::Approved,
            }),
        }
    }

    /// A newer generation displaces this one; valid from any state.
    pub fn supersede(&mut self) {
        self.status = ScheduleStatus::Superseded;
    }

    /// Flatten to the export wire format; ordered like `commands`.
    pub fn export_records(&self) -> Vec<ScheduleRecord> {
        self.commands
            .iter()
            .map(|c| ScheduleRecord {
                pump_id: c.pump_id.clone(),
                timestamp: c.effective_from,
                frequency_hz: c.frequency_hz,
            })
            .collect()
    }
}
