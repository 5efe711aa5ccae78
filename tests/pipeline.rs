//! End-to-end scenarios over the simulated environment: plan, execute,
//! deviate, replan.

#![cfg(feature = "sim")]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use aquaopt_controller::config::Config;
use aquaopt_controller::domain::{
    Forecast, ForecastAccuracy, ForecastPoint, MockStation, PumpStation, ScheduleStatus,
    StationSnapshot, TunnelState,
};
use aquaopt_controller::executor::ExecutorPhase;
use aquaopt_controller::forecaster::{Forecaster, ForecasterError, HistorySeries};
use aquaopt_controller::simulation::{seed_history, Environment, EnvironmentConfig, SimulatedPumpStation};
use aquaopt_controller::supervisor::{Supervisor, SupervisorError};

const CONFIG_TOML: &str = r#"
[server]
host = "127.0.0.1"
port = 0
enable_cors = false
request_timeout_secs = 10

[supervisor]
cycle_minutes = 60
tick_seconds = 60
horizon_hours = 24
step_minutes = 60
forecast_validity_hours = 6

[tunnel]
max_level_m = 8.0
max_volume_m3 = 225850.0
initial_level_m = 4.2
integration_step_s = 60.0

[constraints]
max_level_m = 8.0
max_volume_m3 = 225850.0
outflow_variation_m3h = 9000.0
min_pump_cycle_minutes = 120
min_frequency_hz = 47.5
require_daily_emptying = true
emptying_watermark_m = 0.8
surge_reserve_fraction = 0.2
rain_probability_threshold = 0.6

[forecast]
min_history_hours = 48
holdout_hours = 24
confidence_z = 1.64

[planner]
time_budget_seconds = 20
volume_buckets = 60

[executor]
tolerance_m = 0.3
deviation_trigger_steps = 3
correction_gain = 0.5

[pumps.small]
count = 4
nominal_flow_m3h = 5000.0
rated_power_kw = 110.0
max_efficiency = 0.84
min_frequency_hz = 47.5
max_frequency_hz = 50.0
min_cycle_minutes = 120

[pumps.large]
count = 4
nominal_flow_m3h = 8000.0
rated_power_kw = 320.0
max_efficiency = 0.86
min_frequency_hz = 47.5
max_frequency_hz = 50.0
min_cycle_minutes = 120
"#;

fn config() -> Config {
    toml::from_str(CONFIG_TOML).expect("test config parses")
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
}

fn dry_environment() -> Environment {
    Environment::new(EnvironmentConfig {
        rain_period_hours: 0,
        ..EnvironmentConfig::default()
    })
}

fn shared_state(cfg: &Config) -> Arc<RwLock<TunnelState>> {
    let geometry = cfg.tunnel.geometry();
    let mut state = TunnelState::at_rest(&geometry, cfg.tunnel.initial_level_m, start());
    state.outflow_m3h = 10_000.0;
    Arc::new(RwLock::new(state))
}

fn simulated_supervisor(cfg: &Config) -> Arc<Supervisor> {
    use aquaopt_controller::forecaster::SeasonalProfileForecaster;

    let environment = dry_environment();
    let history = seed_history(&environment, start(), 7 * 24);
    let state = shared_state(cfg);
    let station = Arc::new(SimulatedPumpStation::new(
        environment,
        Arc::clone(&state),
        cfg.pumps.catalog(),
    ));
    let forecaster = Arc::new(SeasonalProfileForecaster::default());
    Arc::new(Supervisor::new(cfg, forecaster, station, state, history))
}

/// Always returns a flat forecast anchored to the history tail, so
/// repeated replans stay valid in simulated time.
struct FlatForecaster {
    inflow_m3h: f64,
    validity: Duration,
}

#[async_trait]
impl Forecaster for FlatForecaster {
    async fn predict(
        &self,
        history: &HistorySeries,
        horizon: Duration,
        step: Duration,
    ) -> Result<Forecast, ForecasterError> {
        let now = history
            .last()
            .map(|p| p.timestamp)
            .unwrap_or_else(start);
        let steps = (horizon.num_minutes() / step.num_minutes()).max(1);
        let points = (0..steps)
            .map(|i| ForecastPoint {
                timestamp: now + step * i as i32,
                inflow_mean_m3h: self.inflow_m3h,
                inflow_lower_m3h: self.inflow_m3h - 1_000.0,
                inflow_upper_m3h: self.inflow_m3h + 1_000.0,
                price_eur_mwh: 80.0,
                rain_probability: 0.1,
            })
            .collect();
        Ok(Forecast {
            id: Uuid::new_v4(),
            generated_at: now,
            valid_until: now + self.validity,
            step_minutes: step.num_minutes(),
            points,
            accuracy: Some(ForecastAccuracy {
                inflow_mae_m3h: 250.0,
                sample_count: 24,
            }),
        })
    }
}

#[tokio::test]
async fn full_cycle_plans_approves_and_executes() {
    let cfg = config();
    let supervisor = simulated_supervisor(&cfg);

    let schedule_id = supervisor.run_cycle().await.expect("planning cycle");

    let report = supervisor.system_report().await;
    let schedule = report.schedule.expect("active schedule");
    assert_eq!(schedule.id, schedule_id);
    assert_eq!(schedule.status, ScheduleStatus::Approved);
    assert!(!schedule.commands.is_empty());

    let forecast = report.forecast.expect("forecast published");
    assert!(forecast.accuracy.is_some(), "operational forecast carries accuracy");

    // A few execution steps track the plan.
    for _ in 0..4 {
        let result = supervisor.execute_step().await.expect("step");
        assert_ne!(result.phase, ExecutorPhase::Faulted);
    }

    let report = supervisor.system_report().await;
    assert_eq!(report.executor_phase, ExecutorPhase::Executing);
    let deviation = report.last_deviation.expect("deviation reports flowing");
    assert!(deviation.within_tolerance, "delta {}", deviation.delta_m);
    assert_eq!(report.state.timestamp, start() + Duration::hours(4));

    // Compliance counters saw every executed step.
    let storage = report
        .compliance
        .constraints
        .iter()
        .find(|e| e.constraint.to_string() == "storage_capacity")
        .unwrap();
    assert!(storage.counter.checked >= 4);
    assert_eq!(storage.fraction, Some(1.0));
}

#[tokio::test]
async fn second_cycle_supersedes_first_schedule() {
    let cfg = config();
    let supervisor = simulated_supervisor(&cfg);

    let first = supervisor.run_cycle().await.expect("first cycle");
    supervisor.execute_step().await.expect("step");

    let second = supervisor.run_cycle().await.expect("second cycle");
    assert_ne!(first, second);
    supervisor.execute_step().await.expect("step activates swap");

    let report = supervisor.system_report().await;
    let schedule = report.schedule.expect("active schedule");
    assert_eq!(schedule.id, second);
    assert_eq!(schedule.status, ScheduleStatus::Approved);
}

#[tokio::test]
async fn stale_forecast_is_refused() {
    let cfg = config();
    let environment = dry_environment();
    let history = seed_history(&environment, start(), 7 * 24);
    let state = shared_state(&cfg);
    let station = Arc::new(SimulatedPumpStation::new(
        environment,
        Arc::clone(&state),
        cfg.pumps.catalog(),
    ));
    // A forecaster whose output expires immediately.
    let forecaster = Arc::new(FlatForecaster {
        inflow_m3h: 10_000.0,
        validity: Duration::hours(-1),
    });
    let supervisor = Supervisor::new(&cfg, forecaster, station, state, history);

    let err = supervisor.run_cycle().await.unwrap_err();
    assert!(matches!(err, SupervisorError::StaleForecast { .. }));
    assert!(supervisor.system_report().await.schedule.is_none());
}

#[tokio::test]
async fn sustained_deviation_raises_alert_and_replans() {
    let cfg = config();
    let history_env = dry_environment();
    let history = seed_history(&history_env, start(), 7 * 24);
    let state = shared_state(&cfg);

    // Station that always measures far more inflow than forecast: the
    // plan's trajectory drifts away from reality step after step.
    let snapshot = StationSnapshot {
        timestamp: start(),
        level_m: cfg.tunnel.initial_level_m,
        volume_m3: 0.0,
        inflow_m3h: 14_500.0,
        outflow_m3h: 10_000.0,
        pumps: vec![],
    };
    let station: Arc<dyn PumpStation> = Arc::new(MockStation::new(snapshot));
    let forecaster = Arc::new(FlatForecaster {
        inflow_m3h: 10_000.0,
        validity: Duration::hours(6),
    });
    let supervisor = Supervisor::new(&cfg, forecaster, station, state, history);

    supervisor.run_cycle().await.expect("initial plan");

    for _ in 0..16 {
        supervisor.execute_step().await.expect("step");
    }

    let report = supervisor.system_report().await;
    assert!(
        report
            .alerts
            .iter()
            .any(|a| a.message.contains("sustained deviation")),
        "alerts: {:?}",
        report.alerts
    );
    // The replan installed a fresh schedule; execution continues.
    assert_ne!(report.executor_phase, ExecutorPhase::Faulted);
}
