use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::{ConstraintKind, ALL_CONSTRAINTS};

/// Running tally of checked vs. compliant steps for one constraint.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ComplianceCounter {
    pub checked: u64,
    pub compliant: u64,
}

impl ComplianceCounter {
    pub fn fraction(&self) -> Option<f64> {
        if self.checked == 0 {
            None
        } else {
            Some(self.compliant as f64 / self.checked as f64)
        }
    }
}

/// Per-constraint compliance bookkeeping maintained by the supervisor for
/// reporting.
#[derive(Debug, Clone, Default)]
pub struct ComplianceCounters {
    counters: HashMap<ConstraintKind, ComplianceCounter>,
}

impl ComplianceCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, constraint: ConstraintKind, compliant: bool) {
        let counter = self.counters.entry(constraint).or_default();
        counter.checked += 1;
        if compliant {
            counter.compliant += 1;
        }
    }

    pub fn fraction(&self, constraint: ConstraintKind) -> Option<f64> {
        self.counters.get(&constraint).and_then(|c| c.fraction())
    }

    pub fn snapshot(&self) -> ComplianceSnapshot {
        ComplianceSnapshot {
            constraints: ALL_CONSTRAINTS
                .iter()
                .map(|kind| ComplianceEntry {
                    constraint: *kind,
                    counter: self.counters.get(kind).copied().unwrap_or_default(),
                    fraction: self.counters.get(kind).and_then(|c| c.fraction()),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceEntry {
    pub constraint: ConstraintKind,
    #[serde(flatten)]
    pub counter: ComplianceCounter,
    pub fraction: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceSnapshot {
    pub constraints: Vec<ComplianceEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fractions_accumulate() {
        let mut counters = ComplianceCounters::new();
        counters.record(ConstraintKind::StorageCapacity, true);
        counters.record(ConstraintKind::StorageCapacity, true);
        counters.record(ConstraintKind::StorageCapacity, false);
        counters.record(ConstraintKind::FrequencyFloor, true);

        assert!(
            (counters.fraction(ConstraintKind::StorageCapacity).unwrap() - 2.0 / 3.0).abs()
                < 1e-12
        );
        assert_eq!(counters.fraction(ConstraintKind::FrequencyFloor), Some(1.0));
        assert_eq!(counters.fraction(ConstraintKind::DailyEmptying), None);
    }

    #[test]
    fn snapshot_covers_every_constraint() {
        let counters = ComplianceCounters::new();
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.constraints.len(), ALL_CONSTRAINTS.len());
        assert!(snapshot.constraints.iter().all(|e| e.fraction.is_none()));
    }
}
