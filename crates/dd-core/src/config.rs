//! Configuration management for deaddrop
//!
//! Repository-level settings for the queue: which remote coordinates the
//! agents, how hard the publisher retries, and where the partitions live.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::Result;

/// Repository-level queue configuration
///
/// Loaded from `.deaddrop/config.toml` in the repo root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Remote repository that serves as the shared coordination point
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Publish retry behavior
    #[serde(default)]
    pub retry: RetryConfig,

    /// Queue directory layout
    #[serde(default)]
    pub queue: QueueLayout,
}

/// Remote repository settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Remote name as known to git
    #[serde(default = "default_remote_name")]
    pub name: String,

    /// Branch carrying the queue
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Seconds before an unanswered push or fetch counts as unreachable
    #[serde(default = "default_network_timeout_secs")]
    pub network_timeout_secs: u64,
}

/// Publish retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts before a publish gives up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before the second attempt
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Backoff ceiling
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

/// Queue directory layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueLayout {
    /// Directory under the repo root holding the state partitions
    #[serde(default = "default_queue_root")]
    pub root: String,
}

/// Retry budget for the publish loop, derived from `[retry]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Next backoff after `current`: doubled, capped at the ceiling.
    pub fn next_backoff(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_backoff)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

// Default value providers
fn default_remote_name() -> String {
    "origin".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_network_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    15_000
}

fn default_queue_root() -> String {
    "queue".to_string()
}

impl QueueConfig {
    /// Load configuration from `.deaddrop/config.toml` or use defaults
    pub fn load_or_default(repo_root: &Path) -> Result<Self> {
        let config_path = repo_root.join(".deaddrop/config.toml");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Ok(toml::from_str(&content).map_err(|e| {
                crate::QueueError::Other(format!("Failed to parse config file: {}", e))
            })?)
        } else {
            Ok(Self::default())
        }
    }

    /// Write default configuration to `.deaddrop/config.toml`
    pub fn write_default(repo_root: &Path) -> Result<()> {
        let config_dir = repo_root.join(".deaddrop");
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let config = Self::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| crate::QueueError::Other(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.retry)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.network_timeout_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            remote: RemoteConfig::default(),
            retry: RetryConfig::default(),
            queue: QueueLayout::default(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            name: default_remote_name(),
            branch: default_branch(),
            network_timeout_secs: default_network_timeout_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for QueueLayout {
    fn default() -> Self {
        Self {
            root: default_queue_root(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_missing_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = QueueConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.remote.name, "origin");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.queue.root, "queue");
    }

    #[test]
    fn test_write_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        QueueConfig::write_default(dir.path()).unwrap();

        let config = QueueConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.remote.branch, "main");
        assert_eq!(config.retry.initial_backoff_ms, 500);
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(1500),
        };
        let second = policy.next_backoff(policy.initial_backoff);
        assert_eq!(second, Duration::from_millis(1000));
        assert_eq!(policy.next_backoff(second), Duration::from_millis(1500));
        assert_eq!(
            policy.next_backoff(Duration::from_millis(1500)),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn test_partial_config_fills_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join(".deaddrop");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("config.toml"),
            "[remote]\nname = \"upstream\"\n",
        )
        .unwrap();

        let config = QueueConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.remote.name, "upstream");
        assert_eq!(config.remote.branch, "main");
        assert_eq!(config.retry.max_attempts, 5);
    }
}
