//! Configuration management

use ccw_common::types::RifFileType;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PipelineError, PipelineResult};
use crate::manifest::{DataSetLocation, FileTypeFilter};
use crate::storage::StorageConfig;

// ============================================================================
// Database Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/ccw";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 1;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

// ============================================================================
// Load Job Configuration Constants
// ============================================================================

/// Default number of object transfers in flight at once.
pub const DEFAULT_TRANSFER_CONCURRENCY: usize = 4;

/// Default time to wait for a manifest's data files (1 hour).
pub const DEFAULT_AWAIT_DATA_TIMEOUT_SECS: u64 = 3600;

/// Default pause between checks for missing data files.
pub const DEFAULT_AWAIT_DATA_POLL_SECS: u64 = 10;

/// Default pause between cycles that found nothing to do.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Default time without a heartbeat after which a STARTED claim may be taken
/// over (15 minutes).
pub const DEFAULT_CLAIM_TIMEOUT_SECS: u64 = 15 * 60;

/// Default pause between claim heartbeats while a manifest is being worked on.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 60;

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub job: JobConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// Load job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// `None` allows every type not explicitly denied.
    pub allowed_file_types: Option<Vec<RifFileType>>,
    pub denied_file_types: Vec<RifFileType>,
    /// Also watch the synthetic prefixes.
    pub synthetic_enabled: bool,
    pub prevalidation_enabled: bool,
    pub transfer_concurrency: usize,
    pub await_data_timeout_secs: u64,
    pub await_data_poll_secs: u64,
    pub poll_interval_secs: u64,
    pub claim_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub download_dir: PathBuf,
    pub relocate_completed: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            allowed_file_types: None,
            denied_file_types: Vec::new(),
            synthetic_enabled: false,
            prevalidation_enabled: true,
            transfer_concurrency: DEFAULT_TRANSFER_CONCURRENCY,
            await_data_timeout_secs: DEFAULT_AWAIT_DATA_TIMEOUT_SECS,
            await_data_poll_secs: DEFAULT_AWAIT_DATA_POLL_SECS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            claim_timeout_secs: DEFAULT_CLAIM_TIMEOUT_SECS,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            download_dir: std::env::temp_dir(),
            relocate_completed: true,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// Comma-separated file types; blank entries are ignored.
pub fn parse_file_types(list: &str) -> PipelineResult<Vec<RifFileType>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<RifFileType>().map_err(PipelineError::from))
        .collect()
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("DATABASE_URL").unwrap_or(defaults.url),
            max_connections: env_parse("DATABASE_MAX_CONNECTIONS", defaults.max_connections),
            min_connections: env_parse("DATABASE_MIN_CONNECTIONS", defaults.min_connections),
            connect_timeout_secs: env_parse("DATABASE_CONNECT_TIMEOUT", defaults.connect_timeout_secs),
            idle_timeout_secs: env_parse("DATABASE_IDLE_TIMEOUT", defaults.idle_timeout_secs),
        }
    }
}

impl JobConfig {
    pub fn from_env() -> PipelineResult<Self> {
        let defaults = Self::default();

        let allowed_file_types = match std::env::var("CCW_ALLOWED_FILE_TYPES") {
            Ok(list) if !list.trim().is_empty() => Some(parse_file_types(&list)?),
            _ => None,
        };
        let denied_file_types = match std::env::var("CCW_DENIED_FILE_TYPES") {
            Ok(list) => parse_file_types(&list)?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            allowed_file_types,
            denied_file_types,
            synthetic_enabled: env_parse("CCW_SYNTHETIC_ENABLED", defaults.synthetic_enabled),
            prevalidation_enabled: env_parse("CCW_PREVALIDATION_ENABLED", defaults.prevalidation_enabled),
            transfer_concurrency: env_parse("CCW_TRANSFER_CONCURRENCY", defaults.transfer_concurrency),
            await_data_timeout_secs: env_parse(
                "CCW_AWAIT_DATA_TIMEOUT_SECS",
                defaults.await_data_timeout_secs,
            ),
            await_data_poll_secs: env_parse("CCW_AWAIT_DATA_POLL_SECS", defaults.await_data_poll_secs),
            poll_interval_secs: env_parse("CCW_POLL_INTERVAL_SECS", defaults.poll_interval_secs),
            claim_timeout_secs: env_parse("CCW_CLAIM_TIMEOUT_SECS", defaults.claim_timeout_secs),
            heartbeat_interval_secs: env_parse(
                "CCW_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval_secs,
            ),
            download_dir: std::env::var("CCW_DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.download_dir),
            relocate_completed: env_parse("CCW_RELOCATE_COMPLETED", defaults.relocate_completed),
        })
    }

    pub fn filter(&self) -> FileTypeFilter {
        FileTypeFilter::new(
            self.allowed_file_types.clone(),
            self.denied_file_types.iter().copied(),
        )
    }

    /// Prefix pairs to watch, regular first.
    pub fn locations(&self) -> Vec<DataSetLocation> {
        let mut locations = vec![DataSetLocation::regular()];
        if self.synthetic_enabled {
            locations.push(DataSetLocation::synthetic());
        }
        locations
    }

    pub fn await_data_timeout(&self) -> Duration {
        Duration::from_secs(self.await_data_timeout_secs)
    }

    pub fn await_data_poll_interval(&self) -> Duration {
        Duration::from_secs(self.await_data_poll_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn claim_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.claim_timeout_secs.min(i64::MAX as u64) as i64)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.transfer_concurrency == 0 {
            return Err(PipelineError::Config(
                "CCW_TRANSFER_CONCURRENCY must be greater than 0".to_string(),
            ));
        }

        if self.await_data_poll_secs == 0 {
            return Err(PipelineError::Config(
                "CCW_AWAIT_DATA_POLL_SECS must be greater than 0".to_string(),
            ));
        }

        if self.heartbeat_interval_secs == 0 {
            return Err(PipelineError::Config(
                "CCW_HEARTBEAT_INTERVAL_SECS must be greater than 0".to_string(),
            ));
        }

        // A live owner must get at least two heartbeats in before its claim
        // can be taken over.
        if self.claim_timeout_secs < self.heartbeat_interval_secs.saturating_mul(2) {
            return Err(PipelineError::Config(format!(
                "CCW_CLAIM_TIMEOUT_SECS ({}) must be at least twice CCW_HEARTBEAT_INTERVAL_SECS ({})",
                self.claim_timeout_secs, self.heartbeat_interval_secs
            )));
        }

        if let Some(allowed) = &self.allowed_file_types {
            let filter = self.filter();
            if !allowed.iter().any(|t| filter.accepts(*t)) {
                return Err(PipelineError::Config(
                    "File type filter rejects every file type".to_string(),
                ));
            }
        }

        Ok(())
    }
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> PipelineResult<Self> {
        dotenvy::dotenv().ok();

        let config = Config {
            database: DatabaseConfig::from_env(),
            storage: StorageConfig::from_env()?,
            job: JobConfig::from_env()?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> PipelineResult<()> {
        if self.database.url.is_empty() {
            return Err(PipelineError::Config("Database URL cannot be empty".to_string()));
        }

        if self.database.max_connections == 0 {
            return Err(PipelineError::Config(
                "Database max_connections must be greater than 0".to_string(),
            ));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(PipelineError::Config(format!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections, self.database.max_connections
            )));
        }

        self.storage.validate()?;
        self.job.validate()
    }
}
