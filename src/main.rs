use std::sync::Arc;

use dotenvy::dotenv;
use snapshot_orchestrator::config::init_config;
use snapshot_orchestrator::queue::init_consumers;
use snapshot_orchestrator::routes::app_router;
use snapshot_orchestrator::scheduler::Scheduler;
use snapshot_orchestrator::utils::env_utils::get_env_var_or_default;
use tracing_subscriber::EnvFilter;

/// Start the pipeline: one scheduler tick loop, one consumer loop per
/// stage queue, and the operator HTTP surface.
#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).with_target(false).init();

    let config = init_config().await?;
    let scheduler = Arc::new(Scheduler::new(config).await?);

    let host = get_env_var_or_default("HOST", "127.0.0.1");
    let port = get_env_var_or_default("PORT", "3000").parse::<u16>().expect("PORT must be a u16");
    let address = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(address.clone()).await.expect("Failed to get listener");
    let app = app_router(scheduler.clone());

    init_consumers(scheduler.clone()).await.expect("Failed to init consumers");

    // coordination loop: height polls, ETA publishing, job admission
    let tick_scheduler = scheduler.clone();
    tokio::spawn(async move {
        let interval = tick_scheduler.config().params().poll_interval;
        loop {
            tick_scheduler.tick().await;
            tokio::time::sleep(interval).await;
        }
    });

    tracing::info!("Listening on http://{}", address);
    axum::serve(listener, app).await.expect("Failed to start axum server");
    Ok(())
}
