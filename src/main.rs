//! Sportsbook Ledger Service
//!
//! Main entry point for the ledger and settlement engine.
//! This service provides:
//! - Storage bootstrap (Postgres with migrations, or in-memory)
//! - Audit chain verification at startup
//! - Background task for the weekly agent commission settlement

use sportsbook_ledger::config::StorageBackend;
use sportsbook_ledger::database::{create_pool, run_migrations};
use sportsbook_ledger::directory::StaticDirectory;
use sportsbook_ledger::repositories::{LedgerStore, MemoryStore, PgStore};
use sportsbook_ledger::scheduler::SettlementScheduler;
use sportsbook_ledger::{AppConfig, AppError, AppResult, AppState};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("sportsbook_ledger={},sqlx=warn", config.log_level).into()
    });

    if config.json_logs() {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> AppResult<()> {
    // Load environment variables first
    dotenv::dotenv().ok();

    // Load configuration
    let config = AppConfig::from_env().map_err(|e| {
        eprintln!("Configuration error: {}", e);
        AppError::Config(e)
    })?;

    init_tracing(&config);

    info!("Sportsbook ledger starting");
    info!("Environment: {}", config.environment);
    info!("Log level: {}", config.log_level);

    // =========================================================================
    // STORAGE SETUP
    // =========================================================================
    let store: Arc<dyn LedgerStore> = match config.storage {
        StorageBackend::Postgres => {
            info!("Connecting to database...");
            let pool = create_pool(&config.database).await.map_err(|e| {
                error!("Failed to create database pool: {}", e);
                AppError::Database(e)
            })?;
            info!("Max connections: {}", config.database.max_connections);

            info!("Running database migrations...");
            run_migrations(&pool).await.map_err(|e| {
                error!("Database migration failed: {}", e);
                AppError::Database(e)
            })?;
            info!("Database migrations completed successfully");

            Arc::new(PgStore::new(pool))
        }
        StorageBackend::Memory => {
            warn!("Using the in-memory store; all balances are lost on exit");
            Arc::new(MemoryStore::new())
        }
    };

    // =========================================================================
    // DIRECTORY
    // =========================================================================
    let directory = if Path::new(&config.directory_file).exists() {
        StaticDirectory::from_file(&config.directory_file)?
    } else if config.is_production() {
        return Err(AppError::Config(format!(
            "Directory file {} not found",
            config.directory_file
        )));
    } else {
        warn!(
            "Directory file {} not found, starting with no tenants",
            config.directory_file
        );
        StaticDirectory::new()
    };
    let directory = Arc::new(directory);

    // =========================================================================
    // CORE SERVICES INITIALIZATION
    // =========================================================================
    let state = AppState::new(store, directory, &config);
    info!("✓ Services initialized");

    // Findings are reported, never repaired, and do not block startup
    match state.audit.verify_chain().await {
        Ok(report) => info!(
            records = report.records_checked,
            head = %report.head_checksum,
            "✓ Audit chain intact"
        ),
        Err(e) => error!("Audit chain verification failed at startup: {}", e),
    }

    match state.wallets.ledger_totals().await {
        Ok(totals) if totals.is_balanced() => {
            info!(entries = totals.entry_count, "✓ Ledger balanced")
        }
        Ok(totals) => error!(
            debits = %totals.total_debits,
            credits = %totals.total_credits,
            "Ledger is out of balance"
        ),
        Err(e) => error!("Could not compute ledger totals: {}", e),
    }

    // =========================================================================
    // BACKGROUND TASKS
    // =========================================================================
    let scheduler_handle = if config.settlement.enabled {
        let scheduler = SettlementScheduler::new(state.settlement.clone(), state.directory.clone())
            .with_check_interval(config.settlement.check_interval());
        info!(
            "✓ Settlement scheduler started ({:?} interval)",
            config.settlement.check_interval()
        );
        Some(tokio::spawn(async move {
            scheduler.start().await;
        }))
    } else {
        warn!("SETTLEMENT_ENABLED is false - weekly settlement not scheduled");
        None
    };

    info!("Sportsbook ledger ready. Press Ctrl+C to shutdown gracefully");

    // =========================================================================
    // SHUTDOWN HANDLING
    // =========================================================================
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, shutting down gracefully...");
        }
        _ = async {
            if let Some(handle) = scheduler_handle {
                handle.await.ok();
            } else {
                // Never completes if the scheduler is not running
                futures::future::pending::<()>().await;
            }
        } => {
            error!("Settlement scheduler exited unexpectedly");
        }
    }

    info!("Sportsbook ledger shutdown complete");
    Ok(())
}
