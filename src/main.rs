//! Payflow - Cross-Ledger Payment Orchestration
//!
//! Process entry point. Runs the background sweep over the shared job store:
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌────────────┐    ┌──────────────┐
//! │  Config  │───▶│ Logging  │───▶│ PostgreSQL │───▶│ Sweep worker │
//! │  (YAML)  │    │(tracing) │    │ (migrate)  │    │expire / stall│
//! └──────────┘    └──────────┘    └────────────┘    └──────────────┘
//! ```
//!
//! Job execution itself is driven by whichever service embeds
//! [`payflow::JobCoordinator`]. This process has no adapters, so its sweep
//! fails jobs orphaned mid-execution rather than re-driving them; `retry`
//! from a coordinator resumes them.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tracing::info;

use payflow::config::AppConfig;
use payflow::credential::CredentialCipher;
use payflow::job::{SweepConfig, SweepWorker};
use payflow::quote::Planner;
use payflow::store::PgStore;

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env).with_context(|| format!("loading {} config", env))?;
    let _log_guard = payflow::logging::init_logging(&app_config);

    info!(env = %env, "Starting payflow");

    // Fail fast on anything a job would only trip over mid-flight
    CredentialCipher::from_config(&app_config.credentials)
        .context("credential encryption key")?;
    let planner = Planner::from_config(&app_config).context("ledger configuration")?;
    info!(
        destination = %planner.destination(),
        ledgers = app_config.ledgers.len(),
        "Planner configured"
    );

    let postgres_url = app_config
        .postgres_url
        .as_deref()
        .ok_or_else(|| anyhow!("postgres_url is required"))?;
    let store = PgStore::connect(postgres_url)
        .await
        .context("connecting to PostgreSQL")?;
    store.health_check().await.context("PostgreSQL health check")?;
    store.migrate().await.context("applying schema")?;
    info!("Job store ready");

    let worker = SweepWorker::new(
        Arc::new(store),
        SweepConfig::from(&app_config.orchestrator),
    );
    tokio::spawn(async move {
        worker.run().await;
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received, exiting");
    Ok(())
}
