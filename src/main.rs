use log::{error, info, warn};
use std::sync::Arc;
use trusty_tally::tasks::reconcile_sweep::run_sweep_task;
use trusty_tally::{Config, Engine};

#[tokio::main]
async fn main() {
    // Initialize logging
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return;
        }
    };

    if config.admin_ids.is_empty() {
        warn!("ADMIN_USER_IDS is empty; escalations will not reach anyone");
    }

    // Initialize database and engine
    let engine = match Engine::from_config(&config).await {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            error!("Failed to initialize engine: {}", e);
            return;
        }
    };
    info!("Engine ready on {}", config.database_url);

    // --- Start Background Task for Reconciliation ---
    let sweep_engine = Arc::clone(&engine);
    let every = config.reconcile_interval;
    let sweep = tokio::spawn(async move {
        run_sweep_task(sweep_engine, every).await;
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down");
    sweep.abort();
    // Deliver whatever the last writes queued
    engine.flush_notifications().await;
}
