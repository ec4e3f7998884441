use std::env;

use serde::Deserialize;
use tracing::warn;

/// Core configuration, loadable from a TOML file with environment
/// variable overrides (`FLAGSHIP_*`).
#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    #[serde(default = "default_storage")]
    pub storage: StorageBackend,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Environments a write intent may target. Empty disables the check.
    #[serde(default = "default_environments")]
    pub environments: Vec<String>,
    /// Deadline for a single durable-storage call, in milliseconds.
    #[serde(default = "default_storage_timeout_ms")]
    pub storage_timeout_ms: u64,
    /// How many change-feed entries stay replayable before subscribers
    /// must fall back to a full snapshot.
    #[serde(default = "default_feed_retention")]
    pub feed_retention: usize,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sled,
    Memory,
}

/// Backoff budget for transient durable-storage failures, and the bound
/// on forced-write CAS retries.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

// ── Default value functions ──────────────────────────

fn default_storage() -> StorageBackend {
    StorageBackend::Sled
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_environments() -> Vec<String> {
    ["dev", "staging", "prod", "development", "production"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_storage_timeout_ms() -> u64 {
    2_000
}

fn default_feed_retention() -> usize {
    1_024
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5_000
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            storage: default_storage(),
            data_dir: default_data_dir(),
            environments: default_environments(),
            storage_timeout_ms: default_storage_timeout_ms(),
            feed_retention: default_feed_retention(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl CoreConfig {
    /// Load configuration from a TOML file, falling back to defaults if
    /// the file doesn't exist or cannot be parsed.
    pub fn load(path: &str) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    warn!("failed to parse {}: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        // FLAGSHIP_STORAGE
        if let Ok(val) = env::var("FLAGSHIP_STORAGE") {
            match val.to_lowercase().as_str() {
                "sled" => self.storage = StorageBackend::Sled,
                "memory" => self.storage = StorageBackend::Memory,
                other => warn!("unknown FLAGSHIP_STORAGE value: {}", other),
            }
        }

        // FLAGSHIP_DATA_DIR
        if let Ok(val) = env::var("FLAGSHIP_DATA_DIR") {
            self.data_dir = val;
        }

        // FLAGSHIP_ENVIRONMENTS: comma-separated, e.g. "dev,staging,prod"
        if let Ok(val) = env::var("FLAGSHIP_ENVIRONMENTS") {
            self.environments = val
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
        }

        // FLAGSHIP_STORAGE_TIMEOUT_MS
        if let Ok(val) = env::var("FLAGSHIP_STORAGE_TIMEOUT_MS") {
            match val.parse::<u64>() {
                Ok(ms) => self.storage_timeout_ms = ms,
                Err(_) => warn!("invalid FLAGSHIP_STORAGE_TIMEOUT_MS value: {}", val),
            }
        }

        // FLAGSHIP_FEED_RETENTION
        if let Ok(val) = env::var("FLAGSHIP_FEED_RETENTION") {
            match val.parse::<usize>() {
                Ok(n) => self.feed_retention = n,
                Err(_) => warn!("invalid FLAGSHIP_FEED_RETENTION value: {}", val),
            }
        }

        // FLAGSHIP_RETRY_MAX_ATTEMPTS
        if let Ok(val) = env::var("FLAGSHIP_RETRY_MAX_ATTEMPTS") {
            match val.parse::<u32>() {
                Ok(n) => self.retry.max_attempts = n,
                Err(_) => warn!("invalid FLAGSHIP_RETRY_MAX_ATTEMPTS value: {}", val),
            }
        }

        // FLAGSHIP_RETRY_BASE_DELAY_MS
        if let Ok(val) = env::var("FLAGSHIP_RETRY_BASE_DELAY_MS") {
            match val.parse::<u64>() {
                Ok(ms) => self.retry.base_delay_ms = ms,
                Err(_) => warn!("invalid FLAGSHIP_RETRY_BASE_DELAY_MS value: {}", val),
            }
        }

        // FLAGSHIP_RETRY_MAX_DELAY_MS
        if let Ok(val) = env::var("FLAGSHIP_RETRY_MAX_DELAY_MS") {
            match val.parse::<u64>() {
                Ok(ms) => self.retry.max_delay_ms = ms,
                Err(_) => warn!("invalid FLAGSHIP_RETRY_MAX_DELAY_MS value: {}", val),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_common_environments() {
        let config = CoreConfig::default();
        assert_eq!(config.storage, StorageBackend::Sled);
        assert!(config.environments.contains(&"prod".to_string()));
        assert!(config.environments.contains(&"staging".to_string()));
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: CoreConfig = toml::from_str(
            r#"
            storage = "memory"
            environments = ["prod"]

            [retry]
            max_attempts = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.environments, vec!["prod".to_string()]);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.base_delay_ms, default_base_delay_ms());
        assert_eq!(config.feed_retention, default_feed_retention());
    }

    #[test]
    fn env_overrides_take_precedence() {
        env::set_var("FLAGSHIP_STORAGE", "memory");
        env::set_var("FLAGSHIP_ENVIRONMENTS", "qa, Prod");
        env::set_var("FLAGSHIP_RETRY_MAX_ATTEMPTS", "7");

        let mut config = CoreConfig::default();
        config.apply_env_overrides();

        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(
            config.environments,
            vec!["qa".to_string(), "prod".to_string()]
        );
        assert_eq!(config.retry.max_attempts, 7);

        env::remove_var("FLAGSHIP_STORAGE");
        env::remove_var("FLAGSHIP_ENVIRONMENTS");
        env::remove_var("FLAGSHIP_RETRY_MAX_ATTEMPTS");
    }
}
