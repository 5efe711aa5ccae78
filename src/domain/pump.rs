use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PumpClass {
    Small,
    Large,
}

/// One sampled operating point of a pump at a given drive frequency.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PumpCurvePoint {
    pub frequency_hz: f64,
    pub flow_m3h: f64,
    pub power_kw: f64,
    pub efficiency: f64,
}

/// Frequency -> (flow, power, efficiency) lookup, linearly interpolated
/// between sampled VFD operating points.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PumpCurve {
    points: Vec<PumpCurvePoint>,
}

impl PumpCurve {
    pub fn new(mut points: Vec<PumpCurvePoint>) -> Self {
        points.sort_by(|a, b| a.frequency_hz.total_cmp(&b.frequency_hz));
        Self { points }
    }

    fn interpolate(&self, frequency_hz: f64, value: impl Fn(&PumpCurvePoint) -> f64) -> f64 {
        match self.points.as_slice() {
            [] => 0.0,
            [only] => value(only),
            points => {
                let first = &points[0];
                let last = &points[points.len() - 1];
                if frequency_hz <= first.frequency_hz {
                    return value(first);
                }
                if frequency_hz >= last.frequency_hz {
                    return value(last);
                }
                for pair in points.windows(2) {
                    let (a, b) = (&pair[0], &pair[1]);
                    if frequency_hz <= b.frequency_hz {
                        let span = b.frequency_hz - a.frequency_hz;
                        let w = if span.abs() < 1e-9 {
                            0.0
                        } else {
                            (frequency_hz - a.frequency_hz) / span
                        };
                        return value(a) + w * (value(b) - value(a));
                    }
                }
                value(last)
            }
        }
    }

    pub fn flow_at(&self, frequency_hz: f64) -> f64 {
        self.interpolate(frequency_hz, |p| p.flow_m3h)
    }

    pub fn power_at(&self, frequency_hz: f64) -> f64 {
        self.interpolate(frequency_hz, |p| p.power_kw)
    }

    pub fn efficiency_at(&self, frequency_hz: f64) -> f64 {
        self.interpolate(frequency_hz, |p| p.efficiency)
    }
}

/// Catalog parameters of one pump class, nominal figures quoted at the top
/// of the VFD band.
#[derive(Debug, Clone)]
pub struct PumpSpec {
    pub nominal_flow_m3h: f64,
    pub rated_power_kw: f64,
    pub max_efficiency: f64,
    pub min_frequency_hz: f64,
    pub max_frequency_hz: f64,
    pub min_cycle: Duration,
}

/// Immutable pump catalog entry, created at configuration time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pump {
    pub id: String,
    pub class: PumpClass,
    pub min_frequency_hz: f64,
    pub max_frequency_hz: f64,
    pub rated_power_kw: f64,
    /// Minimum time the pump must remain in a state once switched.
    pub min_cycle_minutes: i64,
    pub curve: PumpCurve,
}

/// Efficiency drop per Hz below the top of the band (PumpDetails curves:
/// ~75% at 47.5Hz up to 84% at 50Hz for the small class).
const EFFICIENCY_SLOPE_PER_HZ: f64 = 0.036;

impl Pump {
    /// Build a catalog entry from class parameters, sampling the curve with
    /// the affinity laws: flow scales linearly with frequency, power
    /// cubically.
    pub fn from_spec(id: impl Into<String>, class: PumpClass, spec: &PumpSpec) -> Self {
        let n = 6;
        let band = spec.max_frequency_hz - spec.min_frequency_hz;
        let points = (0..n)
            .map(|i| {
                let f = spec.min_frequency_hz + band * i as f64 / (n - 1) as f64;
                let ratio = f / spec.max_frequency_hz;
                PumpCurvePoint {
                    frequency_hz: f,
                    flow_m3h: spec.nominal_flow_m3h * ratio,
                    power_kw: spec.rated_power_kw * ratio.powi(3),
                    efficiency: (spec.max_efficiency
                        - EFFICIENCY_SLOPE_PER_HZ * (spec.max_frequency_hz - f))
                        .max(0.0),
                }
            })
            .collect();

        Self {
            id: id.into(),
            class,
            min_frequency_hz: spec.min_frequency_hz,
            max_frequency_hz: spec.max_frequency_hz,
            rated_power_kw: spec.rated_power_kw,
            min_cycle_minutes: spec.min_cycle.num_minutes(),
            curve: PumpCurve::new(points),
        }
    }

    pub fn min_cycle(&self) -> Duration {
        Duration::minutes(self.min_cycle_minutes)
    }

    /// Flow delivered at a commanded frequency; 0 means off.
    pub fn flow_at(&self, frequency_hz: f64) -> f64 {
        if frequency_hz < self.min_frequency_hz {
            0.0
        } else {
            self.curve.flow_at(frequency_hz)
        }
    }

    pub fn power_at(&self, frequency_hz: f64) -> f64 {
        if frequency_hz < self.min_frequency_hz {
            0.0
        } else {
            self.curve.power_at(frequency_hz)
        }
    }

    /// A command frequency is valid when it is exactly 0 (off) or inside
    /// the VFD band.
    pub fn is_valid_frequency(&self, frequency_hz: f64) -> bool {
        frequency_hz == 0.0
            || (frequency_hz >= self.min_frequency_hz && frequency_hz <= self.max_frequency_hz)
    }
}

/// Frequency setpoint for one pump, produced by the planner as part of a
/// schedule or by the executor as a correction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PumpCommand {
    pub pump_id: String,
    /// 0 = off, otherwise inside the pump's VFD band.
    pub frequency_hz: f64,
    pub effective_from: DateTime<Utc>,
}
