//! Counter audit binary for the Murmur social backend.
//!
//! Recomputes every denormalized counter from the relationship tables and
//! logs the rows that drifted. With `AUDIT_REPAIR=true` the drifting
//! counters are rewritten in one transaction.
//!
//! # Startup Sequence
//!
//! 1. Load configuration (`MURMUR_CONFIG`, default `murmur-config.yaml`)
//! 2. Initialize structured logging (tracing)
//! 3. Connect to `PostgreSQL` and run migrations
//! 4. Run the audit and log the report

mod error;

use murmur_core::{CounterAudit, MurmurConfig};
use murmur_db::{PostgresPool, Store};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::error::AuditError;

/// Environment variable enabling repair mode.
const AUDIT_REPAIR_ENV: &str = "AUDIT_REPAIR";

/// Application entry point for the audit.
///
/// # Errors
///
/// Returns an error if configuration, database access or the audit fails.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = MurmurConfig::load().map_err(AuditError::from)?;
    init_logging(&config)?;
    info!(
        max_connections = config.database.max_connections,
        "Configuration loaded"
    );

    let pool = PostgresPool::connect(&config.postgres_config())
        .await
        .map_err(AuditError::from)?;
    pool.run_migrations().await.map_err(AuditError::from)?;
    info!("Database ready");

    let audit = CounterAudit::new(Store::postgres(&pool));
    let repair = repair_requested(std::env::var(AUDIT_REPAIR_ENV).ok().as_deref());
    let outcome = audit.run(repair).await;
    pool.close().await;

    let report = outcome.map_err(AuditError::from)?;
    info!(
        user_drift = report.user_drift.len(),
        post_drift = report.post_drift.len(),
        repair,
        repaired = report.repaired,
        "Audit complete"
    );
    Ok(())
}

/// Install the global subscriber. `RUST_LOG` wins over `logging.level`.
fn init_logging(config: &MurmurConfig) -> Result<(), AuditError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let installed = if config.logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| AuditError::Logging {
        message: e.to_string(),
    })
}

fn repair_requested(value: Option<&str>) -> bool {
    value.is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}
