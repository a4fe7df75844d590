//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Process-level settings for `depotd`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Interval between expiry sweeps of the chunk ledger and merge locks.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_sweep_interval_secs() -> u64 {
    300
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl ServerConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Transfer engine tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Largest chunk size a client may declare at init.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
    /// Concurrent chunk uploads across all tasks.
    #[serde(default = "default_chunk_workers")]
    pub chunk_workers: usize,
    /// Concurrent finalize jobs across all tasks.
    #[serde(default = "default_merge_workers")]
    pub merge_workers: usize,
    /// How long a merge attempt waits for the per-task lock.
    #[serde(default = "default_merge_lock_wait_ms")]
    pub merge_lock_wait_ms: u64,
    /// Lease length of a held merge lock. A crashed holder's lock becomes
    /// acquirable once the lease lapses.
    #[serde(default = "default_merge_lock_lease_ms")]
    pub merge_lock_lease_ms: u64,
    /// Poll interval while waiting for a contended lock.
    #[serde(default = "default_lock_poll_interval_ms")]
    pub lock_poll_interval_ms: u64,
    /// Retention of tasks and chunk ledgers (default: 7 days).
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Retention after a task fails, kept for inspection (default: 1 hour).
    #[serde(default = "default_failed_retention_secs")]
    pub failed_retention_secs: u64,
}

fn default_max_chunk_size() -> u64 {
    crate::MAX_CHUNK_SIZE
}

fn default_chunk_workers() -> usize {
    8
}

fn default_merge_workers() -> usize {
    2
}

fn default_merge_lock_wait_ms() -> u64 {
    10_000
}

fn default_merge_lock_lease_ms() -> u64 {
    30_000
}

fn default_lock_poll_interval_ms() -> u64 {
    50
}

fn default_retention_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_failed_retention_secs() -> u64 {
    60 * 60
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: default_max_chunk_size(),
            chunk_workers: default_chunk_workers(),
            merge_workers: default_merge_workers(),
            merge_lock_wait_ms: default_merge_lock_wait_ms(),
            merge_lock_lease_ms: default_merge_lock_lease_ms(),
            lock_poll_interval_ms: default_lock_poll_interval_ms(),
            retention_secs: default_retention_secs(),
            failed_retention_secs: default_failed_retention_secs(),
        }
    }
}

impl TransferConfig {
    pub fn merge_lock_wait(&self) -> Duration {
        Duration::from_millis(self.merge_lock_wait_ms)
    }

    pub fn merge_lock_lease(&self) -> Duration {
        Duration::from_millis(self.merge_lock_lease_ms)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    /// Retention window as a `time::Duration`, saturating on overflow.
    pub fn retention(&self) -> time::Duration {
        time::Duration::seconds(i64::try_from(self.retention_secs).unwrap_or(i64::MAX))
    }

    pub fn failed_retention(&self) -> time::Duration {
        time::Duration::seconds(i64::try_from(self.failed_retention_secs).unwrap_or(i64::MAX))
    }

    /// Validate transfer configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_chunk_size == 0 {
            return Err("transfer.max_chunk_size must be greater than 0".to_string());
        }
        if self.chunk_workers == 0 || self.merge_workers == 0 {
            return Err("transfer.chunk_workers and transfer.merge_workers must be at least 1".to_string());
        }
        if self.merge_lock_wait_ms == 0 || self.lock_poll_interval_ms == 0 {
            return Err(
                "transfer.merge_lock_wait_ms and transfer.lock_poll_interval_ms must be greater than 0"
                    .to_string(),
            );
        }
        if self.merge_lock_lease_ms <= self.lock_poll_interval_ms {
            return Err(format!(
                "transfer.merge_lock_lease_ms ({}) must be longer than lock_poll_interval_ms ({})",
                self.merge_lock_lease_ms, self.lock_poll_interval_ms
            ));
        }
        if self.retention_secs == 0 || self.failed_retention_secs == 0 {
            return Err("transfer retention windows must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Settings of the process-wide default (local filesystem) backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DefaultStorageSettings {
    /// Root directory for stored objects.
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
    /// Base URL under which the root directory is served, if any.
    #[serde(default)]
    pub public_url: Option<String>,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("./data/storage")
}

impl Default for DefaultStorageSettings {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            public_url: None,
        }
    }
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database.
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// Query timeout in seconds (advisory only: slow queries are logged,
        /// not cancelled).
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(600)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { path, .. } if path.as_os_str().is_empty() => {
                Err("metadata.path must not be empty".to_string())
            }
            MetadataConfig::Sqlite { .. } => Ok(()),
        }
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Default backend settings.
    #[serde(default)]
    pub storage: DefaultStorageSettings,
    #[serde(default)]
    pub metadata: MetadataConfig,
}

impl AppConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.sweep_interval_secs == 0 {
            return Err("server.sweep_interval_secs must be greater than 0".to_string());
        }
        self.transfer.validate()?;
        self.metadata.validate()
    }

    /// Create a test configuration rooted at `dir`.
    ///
    /// **For testing only.** Short lock timings keep contention tests fast.
    pub fn for_testing(dir: &std::path::Path) -> Self {
        Self {
            server: ServerConfig::default(),
            transfer: TransferConfig {
                merge_lock_wait_ms: 2_000,
                merge_lock_lease_ms: 5_000,
                lock_poll_interval_ms: 10,
                ..TransferConfig::default()
            },
            storage: DefaultStorageSettings {
                path: dir.join("storage"),
                public_url: None,
            },
            metadata: MetadataConfig::Sqlite {
                path: dir.join("metadata.db"),
                query_timeout_secs: None,
            },
        }
    }
}
