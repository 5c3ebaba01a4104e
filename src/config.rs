//! Application configuration module
//!
//! Handles loading and validating configuration from environment variables.
//! Validation is eager: an invalid combination is reported before any
//! monitoring starts.

use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Upper bound on concurrently running evolution tasks
pub const MAX_CONCURRENT_EVOLUTIONS_LIMIT: usize = 5;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub database: String,
    pub max_pool_size: usize,
    pub use_tls: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            database: "postgres".to_string(),
            max_pool_size: 10,
            use_tls: false,
        }
    }
}

/// Schema monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorConfig {
    /// Seconds between polling ticks
    pub check_interval_secs: u64,
    /// Directory holding current_snapshot.json / change_history.json / engine_state.json
    pub state_dir: PathBuf,
    /// Maximum number of changes retained in the history log
    pub history_limit: usize,
    /// Collapse remove+add pairs with identical structure into renames
    pub detect_renames: bool,
    /// Bounded wait when stopping the polling loop
    pub stop_timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 300,
            state_dir: PathBuf::from(".schemaflow"),
            history_limit: 1000,
            detect_renames: false,
            stop_timeout_secs: 5,
        }
    }
}

impl MonitorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.check_interval_secs == 0 {
            return Err(AppError::Config("check interval must be at least 1 second".to_string()));
        }
        if self.history_limit == 0 {
            return Err(AppError::Config("change history limit must be positive".to_string()));
        }
        Ok(())
    }
}

/// Notification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationConfig {
    pub webhook_url: Option<String>,
    pub on_success: bool,
    pub on_failure: bool,
    pub on_approval: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            on_success: true,
            on_failure: true,
            on_approval: true,
        }
    }
}

impl NotificationConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if let Some(raw) = &self.webhook_url {
            let parsed = url::Url::parse(raw)
                .map_err(|e| AppError::Config(format!("Invalid webhook URL '{}': {}", raw, e)))?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(AppError::Config(format!(
                    "Webhook URL must use http or https, got: {}",
                    parsed.scheme()
                )));
            }
        }
        Ok(())
    }
}

/// Evolution engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionConfig {
    /// Process detected changes without waiting for low-priority filtering
    pub auto_evolution: bool,
    /// New tasks stay idle until approved
    pub require_approval: bool,
    pub max_concurrent_evolutions: usize,
    pub enable_rollback: bool,
    pub run_tests: bool,
    /// Percent, 0..=100
    pub min_test_coverage: f64,
    pub test_timeout_secs: u64,
    /// Program and arguments used by the default test runner
    pub test_command: Option<Vec<String>>,
    pub generate_models: bool,
    pub generate_views: bool,
    pub generate_apis: bool,
    pub generate_tests: bool,
    pub output_dir: PathBuf,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            auto_evolution: false,
            require_approval: true,
            max_concurrent_evolutions: 1,
            enable_rollback: true,
            run_tests: true,
            min_test_coverage: 0.0,
            test_timeout_secs: 600,
            test_command: None,
            generate_models: true,
            generate_views: true,
            generate_apis: true,
            generate_tests: true,
            output_dir: PathBuf::from("generated"),
        }
    }
}

impl EvolutionConfig {
    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    fn any_generator_enabled(&self) -> bool {
        self.generate_models || self.generate_views || self.generate_apis || self.generate_tests
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.max_concurrent_evolutions == 0
            || self.max_concurrent_evolutions > MAX_CONCURRENT_EVOLUTIONS_LIMIT
        {
            return Err(AppError::Config(format!(
                "max concurrent evolutions must be between 1 and {}, got {}",
                MAX_CONCURRENT_EVOLUTIONS_LIMIT, self.max_concurrent_evolutions
            )));
        }
        if !(0.0..=100.0).contains(&self.min_test_coverage) {
            return Err(AppError::Config(format!(
                "minimum test coverage must be within 0..=100, got {}",
                self.min_test_coverage
            )));
        }
        if self.test_timeout_secs == 0 {
            return Err(AppError::Config("test timeout must be at least 1 second".to_string()));
        }
        if self.auto_evolution && !self.any_generator_enabled() {
            return Err(AppError::Config(
                "auto evolution is enabled but every generator is disabled".to_string(),
            ));
        }
        if let Some(command) = &self.test_command {
            if command.is_empty() {
                return Err(AppError::Config("test command is empty".to_string()));
            }
        }
        Ok(())
    }
}

/// Complete application settings
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub monitor: MonitorConfig,
    pub evolution: EvolutionConfig,
    pub notifications: NotificationConfig,
}

impl Settings {
    /// Load settings from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();

        let database = match std::env::var("DATABASE_URL") {
            Ok(database_url) => Self::parse_database_url(&database_url)?,
            Err(_) => return Err(ConfigError::MissingVar("DATABASE_URL".to_string())),
        };

        let monitor_defaults = MonitorConfig::default();
        let monitor = MonitorConfig {
            check_interval_secs: env_parse("SCHEMA_CHECK_INTERVAL")?
                .unwrap_or(monitor_defaults.check_interval_secs),
            state_dir: std::env::var("SCHEMAFLOW_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(monitor_defaults.state_dir),
            history_limit: env_parse("CHANGE_HISTORY_LIMIT")?
                .unwrap_or(monitor_defaults.history_limit),
            detect_renames: env_parse("DETECT_RENAMES")?
                .unwrap_or(monitor_defaults.detect_renames),
            stop_timeout_secs: env_parse("MONITOR_STOP_TIMEOUT")?
                .unwrap_or(monitor_defaults.stop_timeout_secs),
        };

        let evo = EvolutionConfig::default();
        let evolution = EvolutionConfig {
            auto_evolution: env_parse("AUTO_EVOLUTION")?.unwrap_or(evo.auto_evolution),
            require_approval: env_parse("REQUIRE_APPROVAL")?.unwrap_or(evo.require_approval),
            max_concurrent_evolutions: env_parse("MAX_CONCURRENT_EVOLUTIONS")?
                .unwrap_or(evo.max_concurrent_evolutions),
            enable_rollback: env_parse("ENABLE_ROLLBACK")?.unwrap_or(evo.enable_rollback),
            run_tests: env_parse("RUN_TESTS")?.unwrap_or(evo.run_tests),
            min_test_coverage: env_parse("MIN_TEST_COVERAGE")?.unwrap_or(evo.min_test_coverage),
            test_timeout_secs: env_parse("TEST_TIMEOUT")?.unwrap_or(evo.test_timeout_secs),
            test_command: std::env::var("TEST_COMMAND")
                .ok()
                .map(|s| s.split_whitespace().map(str::to_string).collect()),
            generate_models: env_parse("GENERATE_MODELS")?.unwrap_or(evo.generate_models),
            generate_views: env_parse("GENERATE_VIEWS")?.unwrap_or(evo.generate_views),
            generate_apis: env_parse("GENERATE_APIS")?.unwrap_or(evo.generate_apis),
            generate_tests: env_parse("GENERATE_TESTS")?.unwrap_or(evo.generate_tests),
            output_dir: std::env::var("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(evo.output_dir),
        };

        let notify = NotificationConfig::default();
        let notifications = NotificationConfig {
            webhook_url: std::env::var("NOTIFY_WEBHOOK_URL").ok().filter(|s| !s.trim().is_empty()),
            on_success: env_parse("NOTIFY_ON_SUCCESS")?.unwrap_or(notify.on_success),
            on_failure: env_parse("NOTIFY_ON_FAILURE")?.unwrap_or(notify.on_failure),
            on_approval: env_parse("NOTIFY_ON_APPROVAL")?.unwrap_or(notify.on_approval),
        };

        Ok(Self {
            database,
            monitor,
            evolution,
            notifications,
        })
    }

    /// Validate every section, failing on the first violation
    pub fn validate(&self) -> Result<(), AppError> {
        self.monitor.validate()?;
        self.evolution.validate()?;
        self.notifications.validate()?;

        if self.evolution.require_approval
            && self.notifications.webhook_url.is_none()
            && self.notifications.on_approval
        {
            warn!("Approval is required but no webhook is configured; approval requests will only be logged");
        }
        Ok(())
    }

    /// Parse a DATABASE_URL connection string (postgresql://...)
    fn parse_database_url(url: &str) -> Result<DatabaseConfig, ConfigError> {
        let parsed = url::Url::parse(url).map_err(|_| {
            ConfigError::InvalidValue(
                "Invalid DATABASE_URL format (expected postgresql://...)".to_string(),
            )
        })?;

        if parsed.scheme() != "postgres" && parsed.scheme() != "postgresql" {
            return Err(ConfigError::InvalidValue(format!(
                "Unsupported database scheme '{}'. Use postgres://",
                parsed.scheme()
            )));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| ConfigError::InvalidValue("Missing host in DATABASE_URL".to_string()))?
            .to_string();

        let database = parsed.path().trim_start_matches('/').to_string();
        if database.is_empty() {
            return Err(ConfigError::InvalidValue(
                "Missing database name in DATABASE_URL".to_string(),
            ));
        }

        let use_tls = host.contains("neon.tech")
            || parsed
                .query_pairs()
                .any(|(k, v)| k == "sslmode" && v == "require");

        Ok(DatabaseConfig {
            host,
            port: parsed.port().unwrap_or(5432),
            user: if parsed.username().is_empty() {
                "postgres".to_string()
            } else {
                parsed.username().to_string()
            },
            password: parsed.password().map(|p| p.to_string()).unwrap_or_default(),
            database,
            max_pool_size: env_parse("DB_MAX_CONNECTIONS")?.unwrap_or(10),
            use_tls,
        })
    }
}

/// Read and parse an optional environment variable
fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::ParseError(format!("{}={}", key, raw))),
        Err(_) => Ok(None),
    }
}
