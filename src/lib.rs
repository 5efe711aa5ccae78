pub mod api;
pub mod config;
pub mod domain;
pub mod executor;
pub mod forecaster;
pub mod model;
pub mod planner;
#[cfg(feature = "sim")]
pub mod simulation;
pub mod supervisor;
pub mod telemetry;
