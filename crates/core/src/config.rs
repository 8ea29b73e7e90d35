use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LoadError, Result};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_parse<T: std::str::FromStr>(profile: &str, key: &str) -> Option<T> {
    profiled_env_opt(profile, key).and_then(|v| v.parse().ok())
}

// ── Loader config ─────────────────────────────────────────────

/// Tunables for one cache loader run.
///
/// Built from defaults, a TOML file, or `PRELOAD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Worker threads per database server (one pool per server).
    #[serde(default = "default_threads_per_db_server")]
    pub threads_per_db_server: usize,
    /// Owner records buffered before a stripe is handed to the dependent indices.
    #[serde(default = "default_stripe_size")]
    pub stripe_size: usize,
    /// Pending dependent keys that trigger a new loading task.
    #[serde(default = "default_task_size")]
    pub task_size: usize,
    /// Largest gap between business dates that are still loaded in one query.
    #[serde(default = "default_date_cluster_max_gap_days")]
    pub date_cluster_max_gap_days: i64,
    /// Replica log usage (percent) above which queries wait. 0 disables the check.
    #[serde(default)]
    pub syslog_check_threshold: f64,
    /// Longest a query waits for the replica log to drain.
    #[serde(default = "default_syslog_check_max_wait_secs")]
    pub syslog_check_max_wait_secs: u64,
    /// Loading tasks slower than this are logged as slow.
    #[serde(default = "default_slow_task_threshold_ms")]
    pub slow_task_threshold_ms: u64,
    /// Keep a monitor entry for every loading task of the run.
    #[serde(default = "default_capture_loading_task_details")]
    pub capture_loading_task_details: bool,
    /// Stuck threads tolerated per pool name before new pools wait.
    #[serde(default = "default_max_abandoned_threads")]
    pub max_abandoned_threads: usize,
}

fn default_threads_per_db_server() -> usize {
    10
}

fn default_stripe_size() -> usize {
    2000
}

fn default_task_size() -> usize {
    25_000
}

fn default_date_cluster_max_gap_days() -> i64 {
    5
}

fn default_syslog_check_max_wait_secs() -> u64 {
    1200
}

fn default_slow_task_threshold_ms() -> u64 {
    60_000
}

fn default_capture_loading_task_details() -> bool {
    true
}

fn default_max_abandoned_threads() -> usize {
    10
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            threads_per_db_server: default_threads_per_db_server(),
            stripe_size: default_stripe_size(),
            task_size: default_task_size(),
            date_cluster_max_gap_days: default_date_cluster_max_gap_days(),
            syslog_check_threshold: 0.0,
            syslog_check_max_wait_secs: default_syslog_check_max_wait_secs(),
            slow_task_threshold_ms: default_slow_task_threshold_ms(),
            capture_loading_task_details: default_capture_loading_task_details(),
            max_abandoned_threads: default_max_abandoned_threads(),
        }
    }
}

impl LoaderConfig {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `PRELOAD_PROFILE`; when set, every key is first
    /// looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("PRELOAD_PROFILE", "").to_uppercase();
        let mut config = Self::default();
        config.apply_env_overrides(&profile);
        config
    }

    /// Parse a TOML document, then apply environment overrides.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(toml_str)?;
        let profile = env_or("PRELOAD_PROFILE", "").to_uppercase();
        config.apply_env_overrides(&profile);
        Ok(config)
    }

    /// Read and parse a TOML config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    fn apply_env_overrides(&mut self, p: &str) {
        if let Some(v) = profiled_env_parse(p, "PRELOAD_THREADS_PER_DB_SERVER") {
            self.threads_per_db_server = v;
        }
        if let Some(v) = profiled_env_parse(p, "PRELOAD_STRIPE_SIZE") {
            self.stripe_size = v;
        }
        if let Some(v) = profiled_env_parse(p, "PRELOAD_TASK_SIZE") {
            self.task_size = v;
        }
        if let Some(v) = profiled_env_parse(p, "PRELOAD_DATE_CLUSTER_MAX_GAP_DAYS") {
            self.date_cluster_max_gap_days = v;
        }
        if let Some(v) = profiled_env_parse(p, "PRELOAD_SYSLOG_CHECK_THRESHOLD") {
            self.syslog_check_threshold = v;
        }
        if let Some(v) = profiled_env_parse(p, "PRELOAD_SYSLOG_CHECK_MAX_WAIT_SECS") {
            self.syslog_check_max_wait_secs = v;
        }
        if let Some(v) = profiled_env_parse(p, "PRELOAD_SLOW_TASK_THRESHOLD_MS") {
            self.slow_task_threshold_ms = v;
        }
        if let Some(v) = profiled_env_parse(p, "PRELOAD_CAPTURE_TASK_DETAILS") {
            self.capture_loading_task_details = v;
        }
        if let Some(v) = profiled_env_parse(p, "PRELOAD_MAX_ABANDONED_THREADS") {
            self.max_abandoned_threads = v;
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.threads_per_db_server == 0 {
            return Err(LoaderConfig::invalid("threads_per_db_server must be > 0"));
        }
        if self.stripe_size == 0 {
            return Err(LoaderConfig::invalid("stripe_size must be > 0"));
        }
        if self.task_size == 0 {
            return Err(LoaderConfig::invalid("task_size must be > 0"));
        }
        if self.date_cluster_max_gap_days < 0 {
            return Err(LoaderConfig::invalid("date_cluster_max_gap_days must be >= 0"));
        }
        Ok(())
    }

    fn invalid(message: &str) -> LoadError {
        LoadError::Config(message.to_string())
    }

    pub fn syslog_check_max_wait(&self) -> Duration {
        Duration::from_secs(self.syslog_check_max_wait_secs)
    }

    pub fn slow_task_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_task_threshold_ms)
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Loader config:");
        tracing::info!("  threads:     per_db_server={}", self.threads_per_db_server);
        tracing::info!("  batching:    stripe={}, task={}", self.stripe_size, self.task_size);
        tracing::info!("  dates:       max_gap_days={}", self.date_cluster_max_gap_days);
        tracing::info!(
            "  syslog:      threshold={}, max_wait={}s",
            self.syslog_check_threshold,
            self.syslog_check_max_wait_secs
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = LoaderConfig::default();
        assert_eq!(config.threads_per_db_server, 10);
        assert_eq!(config.stripe_size, 2000);
        assert_eq!(config.task_size, 25_000);
        assert_eq!(config.date_cluster_max_gap_days, 5);
        assert!(config.capture_loading_task_details);
        assert_eq!(config.syslog_check_max_wait_secs, 1200);
        assert_eq!(config.slow_task_threshold_ms, 60_000);
        assert_eq!(config.max_abandoned_threads, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_toml_matches_default() {
        assert_eq!(LoaderConfig::from_toml("").unwrap(), LoaderConfig::default());
    }

    #[test]
    fn toml_fills_missing_fields_with_defaults() {
        let config = LoaderConfig::from_toml("threads_per_db_server = 3\ntask_size = 100\n").unwrap();
        assert_eq!(config.threads_per_db_server, 3);
        assert_eq!(config.task_size, 100);
        assert_eq!(config.stripe_size, 2000);
    }

    #[test]
    fn toml_rejects_wrong_types() {
        let err = LoaderConfig::from_toml("threads_per_db_server = \"many\"").unwrap_err();
        assert!(matches!(err, LoadError::ConfigParse(_)));
    }

    #[test]
    fn validate_rejects_zero_threads() {
        let config = LoaderConfig {
            threads_per_db_server: 0,
            ..LoaderConfig::default()
        };
        assert!(matches!(config.validate(), Err(LoadError::Config(_))));
    }

    #[test]
    fn validate_rejects_zero_task_size() {
        let config = LoaderConfig {
            task_size: 0,
            ..LoaderConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
