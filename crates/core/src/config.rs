//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Storage backend configuration for one replica.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// AWS access key ID. Falls back to the default credential chain if not set.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to the default credential chain if not set.
        secret_access_key: Option<String>,
        /// Force path-style URLs. Required for MinIO and some S3-compatible services.
        #[serde(default)]
        force_path_style: bool,
    },
    /// Process-local in-memory store. Contents are lost on restart.
    Memory,
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.is_empty() {
                    return Err("s3 config requires a bucket".to_string());
                }
                match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                    (Some(_), Some(_)) | (None, None) => Ok(()),
                    _ => Err(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    ),
                }
            }
            _ => Ok(()),
        }
    }
}

/// One participating object store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Replica name, referenced by notifications and tasks (e.g. "aws", "gcp").
    pub name: String,
    /// Where this replica's objects live.
    pub storage: StorageConfig,
}

/// Coordination store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// SQLite database file path.
    #[serde(default = "default_metadata_path")]
    pub path: PathBuf,
}

fn default_metadata_path() -> PathBuf {
    PathBuf::from("./data/twinstore.db")
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            path: default_metadata_path(),
        }
    }
}

/// Synchronization engine tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Objects larger than this are copied in parts of this size.
    #[serde(default = "default_part_size")]
    pub part_size: u64,
    /// Delay between dependency checks while waiting.
    #[serde(default = "default_dependency_poll_interval_secs")]
    pub dependency_poll_interval_secs: u64,
    /// Give up waiting for dependencies after this long.
    #[serde(default = "default_dependency_deadline_secs")]
    pub dependency_deadline_secs: u64,
    /// Total attempts across dead-letter redrives before a task is parked.
    #[serde(default = "default_max_task_attempts")]
    pub max_task_attempts: u32,
    /// In-line attempts for a single copy, part copy or finalize.
    #[serde(default = "default_copy_attempts")]
    pub copy_attempts: u32,
    /// Initial backoff delay between in-line attempts.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Backoff ceiling.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Timeout applied to each individual store operation attempt.
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    /// Number of concurrent queue workers.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    /// Visibility timeout of a leased work item.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    /// Deliveries of one queue item before it is moved to the dead-letter table.
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
    /// Worker sleep when the queue is empty.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Interval between dead-letter reaper sweeps.
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
}

fn default_part_size() -> u64 {
    crate::DEFAULT_PART_SIZE
}

fn default_dependency_poll_interval_secs() -> u64 {
    8
}

fn default_dependency_deadline_secs() -> u64 {
    3600
}

fn default_max_task_attempts() -> u32 {
    10
}

fn default_copy_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_operation_timeout_secs() -> u64 {
    300
}

fn default_worker_concurrency() -> usize {
    16
}

fn default_lease_secs() -> u64 {
    1200
}

fn default_max_deliveries() -> u32 {
    5
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_reaper_interval_secs() -> u64 {
    60
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            part_size: default_part_size(),
            dependency_poll_interval_secs: default_dependency_poll_interval_secs(),
            dependency_deadline_secs: default_dependency_deadline_secs(),
            max_task_attempts: default_max_task_attempts(),
            copy_attempts: default_copy_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            operation_timeout_secs: default_operation_timeout_secs(),
            worker_concurrency: default_worker_concurrency(),
            lease_secs: default_lease_secs(),
            max_deliveries: default_max_deliveries(),
            poll_interval_ms: default_poll_interval_ms(),
            reaper_interval_secs: default_reaper_interval_secs(),
        }
    }
}

impl SyncConfig {
    pub fn dependency_poll_interval(&self) -> Duration {
        Duration::from_secs(self.dependency_poll_interval_secs)
    }

    pub fn dependency_deadline(&self) -> Duration {
        Duration::from_secs(self.dependency_deadline_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    /// Longest one store operation can take across all of its retries:
    /// every attempt timing out, with the maximum backoff between them.
    pub fn retried_operation_budget(&self) -> Duration {
        let attempts = self.copy_attempts.max(1);
        self.operation_timeout() * attempts + self.retry_max_delay() * (attempts - 1)
    }

    /// Validate sync configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.part_size < crate::MIN_PART_SIZE {
            return Err(format!(
                "sync.part_size {} is below the multipart minimum of {} bytes",
                self.part_size,
                crate::MIN_PART_SIZE
            ));
        }
        if self.max_task_attempts == 0 {
            return Err("sync.max_task_attempts must be at least 1".to_string());
        }
        if self.copy_attempts == 0 {
            return Err("sync.copy_attempts must be at least 1".to_string());
        }
        if self.max_deliveries == 0 {
            return Err("sync.max_deliveries must be at least 1".to_string());
        }
        if self.worker_concurrency == 0 {
            return Err("sync.worker_concurrency must be at least 1".to_string());
        }
        // tokio::time::interval panics on a zero period
        if self.reaper_interval_secs == 0 || self.poll_interval_ms == 0 {
            return Err(
                "sync.reaper_interval_secs and sync.poll_interval_ms must be non-zero".to_string(),
            );
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(format!(
                "sync.retry_base_delay_ms {} exceeds sync.retry_max_delay_ms {}",
                self.retry_base_delay_ms, self.retry_max_delay_ms
            ));
        }
        if self.operation_timeout_secs == 0 {
            return Err("sync.operation_timeout_secs must be non-zero".to_string());
        }
        // The lease must outlast every retry of one operation.
        if self.lease() <= self.retried_operation_budget() {
            return Err(format!(
                "sync.lease_secs {} must exceed the worst-case retried operation \
                 ({} attempts x {}s timeout plus backoff = {}s)",
                self.lease_secs,
                self.copy_attempts,
                self.operation_timeout_secs,
                self.retried_operation_budget().as_secs_f64().ceil()
            ));
        }
        Ok(())
    }
}

/// Daemon HTTP listener configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Consistency verifier configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Listing page size.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_page_size() -> usize {
    1000
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
        }
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    /// Participating replicas.
    pub replicas: Vec<ReplicaConfig>,
    /// Coordination store.
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Sync engine tuning.
    #[serde(default)]
    pub sync: SyncConfig,
    /// HTTP listener.
    #[serde(default)]
    pub server: ServerConfig,
    /// Verifier.
    #[serde(default)]
    pub verify: VerifyConfig,
}

impl AppConfig {
    /// Create a test configuration with two in-memory replicas.
    ///
    /// **For testing only.**
    pub fn for_testing() -> Self {
        Self {
            replicas: vec![
                ReplicaConfig {
                    name: "primary".to_string(),
                    storage: StorageConfig::Memory,
                },
                ReplicaConfig {
                    name: "secondary".to_string(),
                    storage: StorageConfig::Memory,
                },
            ],
            metadata: MetadataConfig::default(),
            sync: SyncConfig::default(),
            server: ServerConfig::default(),
            verify: VerifyConfig::default(),
        }
    }

    /// Look up a replica by name.
    pub fn replica(&self, name: &str) -> Option<&ReplicaConfig> {
        self.replicas.iter().find(|r| r.name == name)
    }

    /// Validate the whole configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.replicas.len() < 2 {
            return Err(format!(
                "at least two replicas are required, found {}",
                self.replicas.len()
            ));
        }
        let mut seen = HashSet::new();
        for replica in &self.replicas {
            if replica.name.is_empty() {
                return Err("replica name cannot be empty".to_string());
            }
            if !seen.insert(replica.name.as_str()) {
                return Err(format!("duplicate replica name: {}", replica.name));
            }
            replica
                .storage
                .validate()
                .map_err(|e| format!("replica {}: {e}", replica.name))?;
        }
        if self.verify.page_size == 0 {
            return Err("verify.page_size must be at least 1".to_string());
        }
        self.sync.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::{
        Figment, Jail,
        providers::{Env, Format, Toml},
    };

    #[test]
    fn test_sync_config_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.part_size, 64 * 1024 * 1024);
        assert_eq!(config.dependency_poll_interval(), Duration::from_secs(8));
        assert_eq!(config.max_task_attempts, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sync_config_rejects_small_part_size() {
        let config = SyncConfig {
            part_size: 1024,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sync_config_rejects_lease_shorter_than_timeout() {
        let config = SyncConfig {
            lease_secs: 10,
            operation_timeout_secs: 30,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sync_config_lease_covers_every_retry() {
        let config = SyncConfig::default();
        // 3 x 300s + 2 x 30s
        assert_eq!(config.retried_operation_budget(), Duration::from_secs(960));
        assert!(config.lease() > config.retried_operation_budget());

        // Longer than one attempt, shorter than all of them.
        let config = SyncConfig {
            lease_secs: 900,
            ..SyncConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.contains("sync.lease_secs 900"));

        let config = SyncConfig {
            lease_secs: 961,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_app_config_requires_two_distinct_replicas() {
        let mut config = AppConfig::for_testing();
        assert!(config.validate().is_ok());

        config.replicas[1].name = "primary".to_string();
        assert!(config.validate().unwrap_err().contains("duplicate"));

        config.replicas.pop();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_storage_config_s3_validate_partial_credentials() {
        let invalid = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("access-key".to_string()),
            secret_access_key: None,
            force_path_style: false,
        };
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_storage_config_s3_force_path_style_defaults_to_false() {
        let json = r#"{"type":"s3","bucket":"test","endpoint":"https://s3.amazonaws.com"}"#;
        let config: StorageConfig = serde_json::from_str(json).unwrap();
        match config {
            StorageConfig::S3 {
                force_path_style, ..
            } => assert!(!force_path_style),
            _ => panic!("expected S3 config"),
        }
    }

    #[test]
    fn test_app_config_from_toml_and_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "twinstore.toml",
                r#"
                [[replicas]]
                name = "aws"
                storage = { type = "filesystem", path = "/tmp/aws" }

                [[replicas]]
                name = "gcp"
                storage = { type = "memory" }

                [sync]
                part_size = 8388608
                "#,
            )?;
            jail.set_env("TWINSTORE_SYNC__WORKER_CONCURRENCY", "4");

            let config: AppConfig = Figment::new()
                .merge(Toml::file("twinstore.toml"))
                .merge(Env::prefixed("TWINSTORE_").split("__"))
                .extract()?;

            assert_eq!(config.replicas.len(), 2);
            assert_eq!(config.sync.part_size, 8 * 1024 * 1024);
            assert_eq!(config.sync.worker_concurrency, 4);
            assert_eq!(config.sync.dependency_poll_interval_secs, 8);
            assert!(config.validate().is_ok());
            Ok(())
        });
    }
}
