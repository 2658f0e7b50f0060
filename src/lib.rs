//! Sportsbook Ledger Library
//!
//! Double-entry wallet ledger, jurisdiction rule engine and agent commission
//! settlement for a multi-tenant betting platform.

pub mod config;
pub mod database;
pub mod directory;
pub mod error;
pub mod models;
pub mod repositories;
pub mod scheduler;
pub mod services;

// Re-export commonly used types
pub use config::AppConfig;
pub use error::{AppError, AppResult};

use directory::Directory;
use repositories::LedgerStore;
use services::{
    AuditService, EnforcementEngine, LockManager, RuleEngine, SettlementService, WalletService,
};
use std::sync::Arc;

/// Application state wiring every service onto one store
pub struct AppState {
    pub store: Arc<dyn LedgerStore>,
    pub directory: Arc<dyn Directory>,
    pub locks: Arc<LockManager>,
    pub wallets: Arc<WalletService>,
    pub rules: Arc<RuleEngine>,
    pub enforcement: Arc<EnforcementEngine>,
    pub settlement: Arc<SettlementService>,
    pub audit: Arc<AuditService>,
}

impl AppState {
    pub fn new(store: Arc<dyn LedgerStore>, directory: Arc<dyn Directory>, config: &AppConfig) -> Self {
        let locks = Arc::new(LockManager::new(config.ledger.lock_timeout()));
        let wallets = Arc::new(WalletService::new(store.clone(), locks.clone()));
        let rules = Arc::new(RuleEngine::new(
            store.clone(),
            directory.clone(),
            locks.clone(),
            config.ledger.rule_cache_ttl(),
        ));
        let enforcement = Arc::new(EnforcementEngine::new(
            store.clone(),
            wallets.clone(),
            rules.clone(),
            directory.clone(),
        ));
        let settlement = Arc::new(SettlementService::new(
            store.clone(),
            wallets.clone(),
            rules.clone(),
            directory.clone(),
            config.settlement.clone(),
        ));
        let audit = Arc::new(AuditService::new(store.clone()));

        Self {
            store,
            directory,
            locks,
            wallets,
            rules,
            enforcement,
            settlement,
            audit,
        }
    }
}
