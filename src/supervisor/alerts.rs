use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use strum::Display;
use tracing::{error, warn};
use uuid::Uuid;

const MAX_ALERTS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// Operator-facing alert. Critical alerts are raised for anything that
/// reaches `Faulted` and stay visible until acknowledged — faults are
/// never silently discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub raised_at: DateTime<Utc>,
    pub severity: AlertSeverity,
    pub message: String,
    pub acknowledged: bool,
}

#[derive(Debug, Default)]
pub struct AlertLog {
    alerts: VecDeque<Alert>,
}

impl AlertLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(
        &mut self,
        severity: AlertSeverity,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Uuid {
        let message = message.into();
        match severity {
            AlertSeverity::Critical => error!(alert = %message, "critical alert raised"),
            _ => warn!(alert = %message, "alert raised"),
        }
        let alert = Alert {
            id: Uuid::new_v4(),
            raised_at: now,
            severity,
            message,
            acknowledged: false,
        };
        let id = alert.id;
        self.alerts.push_back(alert);
        if self.alerts.len() > MAX_ALERTS {
            self.alerts.pop_front();
        }
        id
    }

    pub fn acknowledge(&mut self, id: Uuid) -> bool {
        match self.alerts.iter_mut().find(|a| a.id == id) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        }
    }

    pub fn unacknowledged(&self) -> Vec<Alert> {
        self.alerts
            .iter()
            .filter(|a| !a.acknowledged)
            .cloned()
            .collect()
    }

    pub fn recent(&self, count: usize) -> Vec<Alert> {
        let start = self.alerts.len().saturating_sub(count);
        self.alerts.iter().skip(start).cloned().collect()
    }
}
