//! bank-ledger
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────┐    ┌──────────┐
//! │  Config  │───▶│ Postgres │───▶│ Migrate  │───▶│  Audit   │
//! │  (YAML)  │    │  (pool)  │    │ + health │    │(optional)│
//! └──────────┘    └──────────┘    └──────────┘    └──────────┘
//! ```
//!
//! Usage: `bank-ledger [--env dev] [--audit]`

use anyhow::Context;

use bank_ledger::config::AppConfig;
use bank_ledger::logging::init_logging;
use bank_ledger::{Database, OpContext, Store};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn audit_requested() -> bool {
    std::env::args().any(|a| a == "--audit")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env)?;
    let _guard = init_logging(&config);
    tracing::info!(env = %env, git_hash = env!("GIT_HASH"), "Starting bank-ledger");

    let db = Database::connect(&config.database)
        .await
        .context("Failed to connect to PostgreSQL")?;
    db.migrate().await.context("Failed to run migrations")?;
    db.health_check().await.context("Database health check failed")?;
    tracing::info!("Database ready");

    if !audit_requested() {
        return Ok(());
    }

    let store = Store::new(db.backend()).with_tx_timeout(config.tx_timeout());
    let report = store
        .reconcile_all(&OpContext::background())
        .await
        .context("Ledger audit failed")?;

    if !report.is_clean() {
        for violation in &report.violations {
            tracing::error!(%violation, "Ledger invariant violated");
        }
        anyhow::bail!(
            "{} of {} accounts failed reconciliation",
            report.violations.len(),
            report.accounts_checked
        );
    }
    tracing::info!(accounts = report.accounts_checked, "Ledger audit clean");
    Ok(())
}
