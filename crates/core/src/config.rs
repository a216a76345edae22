//! Global service configuration.
//!
//! Loaded from a TOML file with `${NAME}` environment expansion applied to
//! the raw text before parsing, so any string value can reference the
//! environment. `.env` loading is the binary's job (`load_dotenv`).

use std::env;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{ConductorError, Result};
use crate::task::RetryPolicy;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

// ── Env expansion ───────────────────────────────────────────────────

/// Replace every `${NAME}` occurrence with the environment value.
///
/// Unset variables are left in place and logged, so a typo surfaces in the
/// parsed config instead of silently becoming an empty string.
pub fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => {
                        tracing::warn!(var = name, "environment variable not set, left unexpanded");
                        out.push_str(&rest[start..start + 2 + end + 1]);
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated `${`; keep the remainder verbatim.
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

// ── Retention ───────────────────────────────────────────────────────

/// What the retention sweep does with an expired record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupStrategy {
    /// Leave the record alone.
    Skip,
    /// Copy into the dated archive tree, then remove the source.
    Archive,
    /// Remove the record outright.
    Delete,
}

/// Strategy table keyed on the record's last status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupStrategies {
    /// running / reviewing records. Default never touches live tasks.
    #[serde(default = "default_running_strategy")]
    pub running_tasks: CleanupStrategy,
    /// completed / approved records.
    #[serde(default = "default_archive_strategy")]
    pub completed_tasks: CleanupStrategy,
    /// failed / rejected records.
    #[serde(default = "default_archive_strategy")]
    pub failed_tasks: CleanupStrategy,
    /// Everything else (pending, cancelled, review_required).
    #[serde(default = "default_delete_strategy")]
    pub expired_tasks: CleanupStrategy,
}

fn default_running_strategy() -> CleanupStrategy {
    CleanupStrategy::Skip
}
fn default_archive_strategy() -> CleanupStrategy {
    CleanupStrategy::Archive
}
fn default_delete_strategy() -> CleanupStrategy {
    CleanupStrategy::Delete
}

impl Default for CleanupStrategies {
    fn default() -> Self {
        Self {
            running_tasks: default_running_strategy(),
            completed_tasks: default_archive_strategy(),
            failed_tasks: default_archive_strategy(),
            expired_tasks: default_delete_strategy(),
        }
    }
}

/// Age-based lifecycle policy over persisted task records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Records untouched for this many days are processed by the sweep.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,
    /// Compress archived records with zstd (`.json.zst`).
    #[serde(default = "default_compress")]
    pub compress: bool,
    #[serde(default)]
    pub cleanup_strategy: CleanupStrategies,
}

fn default_retention_days() -> u32 {
    90
}
fn default_archive_dir() -> PathBuf {
    PathBuf::from("archives")
}
fn default_compress() -> bool {
    true
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            archive_dir: default_archive_dir(),
            compress: default_compress(),
            cleanup_strategy: CleanupStrategies::default(),
        }
    }
}

// ── Top-level config ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Worker pool size.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Submission queue depth for the worker pool.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Directory scanned for task-definition YAML files.
    #[serde(default = "default_definitions_dir")]
    pub definitions_dir: PathBuf,
    /// Directory holding one JSON state record per task.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Global retry defaults; per-task overrides merge over these.
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub retention: RetentionConfig,
    /// Named resource pool totals.
    #[serde(default = "default_resources")]
    pub resources: IndexMap<String, f64>,
    /// Delayed fires older than this are dropped as misfires.
    #[serde(default = "default_misfire_grace_secs")]
    pub misfire_grace_secs: u64,
    /// How long `stop()` waits for in-flight work to drain.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// Interval between retention sweeps.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_max_concurrent_tasks() -> usize {
    5
}
fn default_queue_capacity() -> usize {
    64
}
fn default_definitions_dir() -> PathBuf {
    PathBuf::from("tasks")
}
fn default_state_dir() -> PathBuf {
    PathBuf::from("states")
}
fn default_resources() -> IndexMap<String, f64> {
    let mut pools = IndexMap::new();
    pools.insert("cpu".to_string(), 100.0); // percent
    pools.insert("memory".to_string(), 8_192.0); // MB
    pools.insert("disk".to_string(), 100_000.0); // MB
    pools.insert("network".to_string(), 1_000.0); // MB/s
    pools.insert("gpu".to_string(), 1.0); // devices
    pools
}
fn default_misfire_grace_secs() -> u64 {
    60
}
fn default_shutdown_timeout_secs() -> u64 {
    60
}
fn default_cleanup_interval_secs() -> u64 {
    86_400
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            queue_capacity: default_queue_capacity(),
            definitions_dir: default_definitions_dir(),
            state_dir: default_state_dir(),
            retry_policy: RetryPolicy::default(),
            retention: RetentionConfig::default(),
            resources: default_resources(),
            misfire_grace_secs: default_misfire_grace_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl Config {
    /// Load from a TOML file, expanding `${NAME}` references first.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConductorError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&raw)
    }

    /// Parse from raw TOML text.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let expanded = expand_env(raw);
        let config: Config = toml::from_str(&expanded)
            .map_err(|e| ConductorError::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(ConductorError::Config(
                "max_concurrent_tasks must be >= 1".to_string(),
            ));
        }
        if self.retry_policy.max_attempts == 0 {
            return Err(ConductorError::Config(
                "retry_policy.max_attempts must be >= 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry_policy.jitter) {
            return Err(ConductorError::Config(
                "retry_policy.jitter must be within [0, 1]".to_string(),
            ));
        }
        for (name, total) in &self.resources {
            if *total < 0.0 {
                return Err(ConductorError::Config(format!(
                    "resource pool '{}' has negative total {}",
                    name, total
                )));
            }
        }
        Ok(())
    }

    /// Log an overview at startup.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded:");
        tracing::info!("  workers:     max_concurrent_tasks={}", self.max_concurrent_tasks);
        tracing::info!(
            "  dirs:        definitions={}, state={}",
            self.definitions_dir.display(),
            self.state_dir.display()
        );
        tracing::info!(
            "  retry:       max_attempts={}, base={}ms, max={}ms, mult={}, jitter={}",
            self.retry_policy.max_attempts,
            self.retry_policy.base_delay_ms,
            self.retry_policy.max_delay_ms,
            self.retry_policy.backoff_multiplier,
            self.retry_policy.jitter
        );
        tracing::info!(
            "  retention:   days={}, archive={}, compress={}",
            self.retention.retention_days,
            self.retention.archive_dir.display(),
            self.retention.compress
        );
        let pools: Vec<String> = self
            .resources
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        tracing::info!("  resources:   {}", pools.join(", "));
    }
}
