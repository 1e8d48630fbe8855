use crate::error::{CoreError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// BreakerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    60
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
        }
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// PoolConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

fn default_max_connections() -> usize {
    10
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_query_timeout_ms() -> u64 {
    30_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            query_timeout_ms: default_query_timeout_ms(),
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// DlqConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqConfig {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default = "default_base_backoff_secs")]
    pub base_backoff_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Upper bound on retries for timeout failures.
    #[serde(default = "default_timeout_retry_cap")]
    pub timeout_retry_cap: u32,
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
}

fn default_tick_interval_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_backoff_secs() -> u64 {
    5
}

fn default_max_backoff_secs() -> u64 {
    900
}

fn default_timeout_retry_cap() -> u32 {
    3
}

fn default_attempt_timeout_secs() -> u64 {
    60
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            default_max_retries: default_max_retries(),
            base_backoff_secs: default_base_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            timeout_retry_cap: default_timeout_retry_cap(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
        }
    }
}

impl DlqConfig {
    /// Never zero; a zero-period ticker panics.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// MutationConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationConfig {
    #[serde(default = "default_backup_timeout_ms")]
    pub backup_timeout_ms: u64,
    #[serde(default = "default_verify_timeout_ms")]
    pub verify_timeout_ms: u64,
    /// Maximum number of times the entity lock set is widened before giving up.
    #[serde(default = "default_max_lock_rounds")]
    pub max_lock_rounds: u32,
    /// Dead-letter a failed deletion as a whole so it is retried later.
    #[serde(default = "default_requeue_failed_deletions")]
    pub requeue_failed_deletions: bool,
}

fn default_backup_timeout_ms() -> u64 {
    30_000
}

fn default_verify_timeout_ms() -> u64 {
    15_000
}

fn default_max_lock_rounds() -> u32 {
    5
}

fn default_requeue_failed_deletions() -> bool {
    true
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            backup_timeout_ms: default_backup_timeout_ms(),
            verify_timeout_ms: default_verify_timeout_ms(),
            max_lock_rounds: default_max_lock_rounds(),
            requeue_failed_deletions: default_requeue_failed_deletions(),
        }
    }
}

impl MutationConfig {
    pub fn backup_timeout(&self) -> Duration {
        Duration::from_millis(self.backup_timeout_ms)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub dlq: DlqConfig,
    #[serde(default)]
    pub mutation: MutationConfig,
}

fn default_version() -> u32 {
    1
}

impl Config {
    pub fn new() -> Self {
        Self {
            version: default_version(),
            ..Default::default()
        }
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(CoreError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    /// Like [`Config::load`] but falls back to defaults when no file exists.
    pub fn load_or_default(root: &Path) -> Result<Self> {
        match Self::load(root) {
            Ok(cfg) => Ok(cfg),
            Err(CoreError::NotInitialized) => Ok(Self::new()),
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.breaker.failure_threshold == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "breaker.failure_threshold must be at least 1".to_string(),
            });
        }
        if self.pool.max_connections == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "pool.max_connections must be at least 1".to_string(),
            });
        }
        if self.dlq.tick_interval_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "dlq.tick_interval_secs must be at least 1".to_string(),
            });
        }
        if self.dlq.base_backoff_secs > self.dlq.max_backoff_secs {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "dlq.base_backoff_secs ({}) exceeds dlq.max_backoff_secs ({}); every retry waits the maximum",
                    self.dlq.base_backoff_secs, self.dlq.max_backoff_secs
                ),
            });
        }
        if self.dlq.default_max_retries == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "dlq.default_max_retries is 0; failures go straight to manual review"
                    .to_string(),
            });
        }
        if self.mutation.max_lock_rounds == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "mutation.max_lock_rounds must be at least 1".to_string(),
            });
        }
        if self.pool.query_timeout_ms > self.dlq.attempt_timeout_secs.saturating_mul(1000) {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "pool.query_timeout_ms exceeds dlq.attempt_timeout_secs; retries may be cut short"
                    .to_string(),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
