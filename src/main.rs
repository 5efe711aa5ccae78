use anyhow::Result;
use aquaopt_controller::{config::Config, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    let cfg = Config::load()?;
    cfg.constraints.constraint_set().validate()?;

    run(cfg).await
}

#[cfg(feature = "sim")]
async fn run(cfg: Config) -> Result<()> {
    use aquaopt_controller::{api, supervisor};
    use tracing::{info, warn};

    let app_state = supervisor::AppState::new_simulated(cfg.clone())?;

    // First plan before serving, so the reporting surface starts populated.
    if let Err(err) = app_state.supervisor.run_cycle().await {
        warn!(error = %err, "initial planning cycle failed");
    }

    supervisor::spawn_supervisor_tasks(app_state.clone());

    let app = api::router(app_state, &cfg);
    let addr = cfg.server.socket_addr()?;
    info!(%addr, "starting AquaOpt controller");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await?;

    info!("shutdown complete");
    Ok(())
}

#[cfg(not(feature = "sim"))]
async fn run(_cfg: Config) -> Result<()> {
    anyhow::bail!(
        "no physical station wiring configured; run with the `sim` feature \
         or embed the crate and provide a PumpStation implementation"
    )
}
