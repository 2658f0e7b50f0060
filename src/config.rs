use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Which `LedgerStore` implementation backs the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    Memory,
}

impl StorageBackend {
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StorageBackend::Postgres),
            "memory" => Ok(StorageBackend::Memory),
            _ => Err(format!(
                "Invalid STORAGE_BACKEND: {}. Must be one of: postgres, memory",
                s
            )),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Required when the postgres backend is selected
    pub url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
    pub test_before_acquire: bool,
}

/// Ledger core tuning
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Bounded wait for account locks before `LockTimeout`
    pub lock_timeout_ms: u64,
    /// TTL of the active-rule cache
    pub rule_cache_ttl_secs: u64,
}

/// Commission batch settings
#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub enabled: bool,
    /// Fee used when the applicable rule carries none
    pub platform_fee_percentage: Decimal,
    pub check_interval_secs: u64,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub storage: StorageBackend,
    pub database: DatabaseConfig,
    pub ledger: LedgerConfig,
    pub settlement: SettlementConfig,
    pub log_level: String,
    pub log_format: String,
    pub environment: String,
    pub directory_file: String,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, String> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| format!("{} has an invalid value: {}", key, raw)),
        Err(_) => Ok(default),
    }
}

/// Lowercased `value` when it is one of `allowed`
fn one_of(key: &str, value: &str, allowed: &[&str]) -> Result<String, String> {
    let value = value.trim().to_lowercase();
    if allowed.contains(&value.as_str()) {
        Ok(value)
    } else {
        Err(format!("Invalid {}: {}. Must be one of: {:?}", key, value, allowed))
    }
}

impl DatabaseConfig {
    /// Create database config from environment variables
    pub fn from_env() -> Result<Self, String> {
        let url = env::var("DATABASE_URL").ok();

        let max_connections = env_parse("DATABASE_MAX_CONNECTIONS", 10u32)?;
        let acquire_timeout_secs = env_parse("DATABASE_ACQUIRE_TIMEOUT_SECS", 30u64)?;
        let idle_timeout_secs = env_parse("DATABASE_IDLE_TIMEOUT_SECS", 600u64)?; // 10 minutes
        let max_lifetime_secs = env_parse("DATABASE_MAX_LIFETIME_SECS", 1800u64)?; // 30 minutes
        let test_before_acquire = env_parse("DATABASE_TEST_BEFORE_ACQUIRE", true)?;

        // Validate configuration
        if max_connections == 0 {
            return Err("DATABASE_MAX_CONNECTIONS must be greater than 0".to_string());
        }

        if acquire_timeout_secs == 0 {
            return Err("DATABASE_ACQUIRE_TIMEOUT_SECS must be greater than 0".to_string());
        }

        Ok(Self {
            url,
            max_connections,
            acquire_timeout_secs,
            idle_timeout_secs,
            max_lifetime_secs,
            test_before_acquire,
        })
    }

    /// Get acquire timeout as Duration
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    /// Get idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Get max lifetime as Duration
    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            acquire_timeout_secs: 30,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
            test_before_acquire: true,
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Result<Self, String> {
        let lock_timeout_ms = env_parse("LEDGER_LOCK_TIMEOUT_MS", 5000u64)?;
        let rule_cache_ttl_secs = env_parse("RULE_CACHE_TTL_SECS", 300u64)?;

        if lock_timeout_ms == 0 {
            return Err("LEDGER_LOCK_TIMEOUT_MS must be greater than 0".to_string());
        }

        Ok(Self {
            lock_timeout_ms,
            rule_cache_ttl_secs,
        })
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn rule_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.rule_cache_ttl_secs)
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5000,
            rule_cache_ttl_secs: 300,
        }
    }
}

impl SettlementConfig {
    pub fn from_env() -> Result<Self, String> {
        let enabled = env_parse("SETTLEMENT_ENABLED", true)?;
        let platform_fee_percentage =
            env_parse("SETTLEMENT_PLATFORM_FEE_PCT", Decimal::ZERO)?;
        let check_interval_secs = env_parse("SETTLEMENT_CHECK_INTERVAL_SECS", 3600u64)?;

        if platform_fee_percentage < Decimal::ZERO || platform_fee_percentage > Decimal::ONE_HUNDRED
        {
            return Err(format!(
                "SETTLEMENT_PLATFORM_FEE_PCT must be between 0 and 100, got {}",
                platform_fee_percentage
            ));
        }
        if check_interval_secs == 0 {
            return Err("SETTLEMENT_CHECK_INTERVAL_SECS must be greater than 0".to_string());
        }

        Ok(Self {
            enabled,
            platform_fee_percentage,
            check_interval_secs,
        })
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            platform_fee_percentage: Decimal::ZERO,
            check_interval_secs: 3600,
        }
    }
}

impl AppConfig {
    /// Create application config from environment variables
    pub fn from_env() -> Result<Self, String> {
        let storage = StorageBackend::from_str(
            &env::var("STORAGE_BACKEND").unwrap_or_else(|_| "postgres".to_string()),
        )?;
        let database = DatabaseConfig::from_env()?;
        let ledger = LedgerConfig::from_env()?;
        let settlement = SettlementConfig::from_env()?;

        if storage == StorageBackend::Postgres && database.url.is_none() {
            return Err("DATABASE_URL environment variable is required".to_string());
        }

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let log_format = env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
        let directory_file =
            env::var("DIRECTORY_FILE").unwrap_or_else(|_| "./directory.json".to_string());

        let log_level = one_of("LOG_LEVEL", &log_level, &["trace", "debug", "info", "warn", "error"])?;
        let log_format = one_of("LOG_FORMAT", &log_format, &["pretty", "json"])?;
        let environment = one_of(
            "ENVIRONMENT",
            &environment,
            &["development", "staging", "production"],
        )?;

        if environment == "production" && storage == StorageBackend::Memory {
            return Err("STORAGE_BACKEND=memory is not allowed in production".to_string());
        }

        Ok(Self {
            storage,
            database,
            ledger,
            settlement,
            log_level,
            log_format,
            environment,
            directory_file,
        })
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Check if running in development
    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }

    pub fn json_logs(&self) -> bool {
        self.log_format == "json"
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage: StorageBackend::Memory,
            database: DatabaseConfig::default(),
            ledger: LedgerConfig::default(),
            settlement: SettlementConfig::default(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            environment: "development".to_string(),
            directory_file: "./directory.json".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_config_default() {
        let config = DatabaseConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.acquire_timeout_secs, 30);
    }

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();
        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.ledger.lock_timeout(), Duration::from_secs(5));
        assert_eq!(config.ledger.rule_cache_ttl(), Duration::from_secs(300));
        assert!(config.is_development());
        assert!(!config.is_production());
    }

    #[test]
    fn test_one_of_normalises_case() {
        assert_eq!(one_of("LOG_FORMAT", " JSON ", &["pretty", "json"]).unwrap(), "json");
        assert!(one_of("ENVIRONMENT", "qa", &["development", "production"]).is_err());
    }

    #[test]
    fn test_storage_backend_parse() {
        assert_eq!(StorageBackend::from_str("Postgres").unwrap(), StorageBackend::Postgres);
        assert_eq!(StorageBackend::from_str("memory").unwrap(), StorageBackend::Memory);
        assert!(StorageBackend::from_str("sqlite").is_err());
    }
}
