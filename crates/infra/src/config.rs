//! Process configuration.
//!
//! Loaded once at startup (optional JSON file, then environment overrides),
//! validated, and handed to the service and scheduler by value. Nothing reads
//! configuration from ambient global state after that.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use contentflow_jobs::JobTypeRegistry;

/// Environment variable naming an optional JSON config file.
pub const CONFIG_PATH_ENV: &str = "CONTENTFLOW_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Cadence of each maintenance sweep, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepIntervals {
    pub stale_secs: u64,
    pub retry_secs: u64,
    pub stuck_secs: u64,
    pub cleanup_secs: u64,
    pub stats_secs: u64,
}

impl Default for SweepIntervals {
    fn default() -> Self {
        Self {
            stale_secs: 5 * 60,
            retry_secs: 10 * 60,
            stuck_secs: 2 * 60,
            cleanup_secs: 24 * 60 * 60,
            stats_secs: 60 * 60,
        }
    }
}

impl SweepIntervals {
    pub fn stale(&self) -> Duration {
        Duration::from_secs(self.stale_secs)
    }

    pub fn retry(&self) -> Duration {
        Duration::from_secs(self.retry_secs)
    }

    pub fn stuck(&self) -> Duration {
        Duration::from_secs(self.stuck_secs)
    }

    pub fn cleanup(&self) -> Duration {
        Duration::from_secs(self.cleanup_secs)
    }

    pub fn stats(&self) -> Duration {
        Duration::from_secs(self.stats_secs)
    }
}

/// Upper bound for `retention_days` (one hundred years).
pub const MAX_RETENTION_DAYS: u32 = 36_500;

/// Thresholds used by the sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// QUEUED for longer than this gets force-started.
    pub queued_stuck_threshold_ms: u64,
    /// RETRYING for longer than `multiplier x backoff` gets force-resumed.
    pub retrying_stuck_multiplier: u32,
    /// COMPLETED jobs older than this are deleted.
    pub retention_days: u32,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            queued_stuck_threshold_ms: 10 * 60 * 1_000,
            retrying_stuck_multiplier: 2,
            retention_days: 30,
        }
    }
}

impl MaintenanceConfig {
    pub fn queued_stuck_threshold(&self) -> chrono::Duration {
        let ms = i64::try_from(self.queued_stuck_threshold_ms).unwrap_or(i64::MAX);
        chrono::Duration::milliseconds(ms)
    }

    /// `None` when the window cannot be represented.
    pub fn retention(&self) -> Option<chrono::Duration> {
        chrono::Duration::try_days(i64::from(self.retention_days))
    }
}

/// Behaviour of the lifecycle service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Resolve FAILED to RETRYING / PERMANENTLY_FAILED inside the FAIL command.
    pub auto_resolve_failures: bool,
    /// Re-reads after a version conflict before giving up.
    pub max_conflict_retries: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            auto_resolve_failures: true,
            max_conflict_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentflowConfig {
    pub bind_addr: String,
    pub job_types: JobTypeRegistry,
    pub sweeps: SweepIntervals,
    pub maintenance: MaintenanceConfig,
    pub lifecycle: LifecycleConfig,
}

impl Default for ContentflowConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            job_types: JobTypeRegistry::default(),
            sweeps: SweepIntervals::default(),
            maintenance: MaintenanceConfig::default(),
            lifecycle: LifecycleConfig::default(),
        }
    }
}

impl ContentflowConfig {
    /// Load from `CONTENTFLOW_CONFIG` (if set) and the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] with an injectable variable lookup.
    pub fn load_with<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(CONFIG_PATH_ENV) {
            Some(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };
        config.apply_overrides(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_overrides<F>(&mut self, lookup: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("CONTENTFLOW_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(days) = parse_var(lookup, "CONTENTFLOW_RETENTION_DAYS")? {
            self.maintenance.retention_days = days;
        }

        let sweeps: [(&'static str, &mut u64); 5] = [
            ("CONTENTFLOW_STALE_SWEEP_SECS", &mut self.sweeps.stale_secs),
            ("CONTENTFLOW_RETRY_SWEEP_SECS", &mut self.sweeps.retry_secs),
            ("CONTENTFLOW_STUCK_SWEEP_SECS", &mut self.sweeps.stuck_secs),
            ("CONTENTFLOW_CLEANUP_SWEEP_SECS", &mut self.sweeps.cleanup_secs),
            ("CONTENTFLOW_STATS_SWEEP_SECS", &mut self.sweeps.stats_secs),
        ];
        for (key, slot) in sweeps {
            if let Some(secs) = parse_var(lookup, key)? {
                *slot = secs;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.job_types
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;

        let s = &self.sweeps;
        if [s.stale_secs, s.retry_secs, s.stuck_secs, s.cleanup_secs, s.stats_secs].contains(&0) {
            return Err(ConfigError::Invalid(
                "sweep intervals must be positive".to_string(),
            ));
        }
        if !(1..=MAX_RETENTION_DAYS).contains(&self.maintenance.retention_days) {
            return Err(ConfigError::Invalid(format!(
                "retention_days must be between 1 and {MAX_RETENTION_DAYS}, got {}",
                self.maintenance.retention_days
            )));
        }
        if self.maintenance.retrying_stuck_multiplier == 0 {
            return Err(ConfigError::Invalid(
                "retrying_stuck_multiplier must be positive".to_string(),
            ));
        }
        if self.bind_addr.trim().is_empty() {
            return Err(ConfigError::Invalid("bind_addr must not be empty".to_string()));
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: core::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use contentflow_jobs::JobType;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_cadence() {
        let config = ContentflowConfig::load_with(env(&[])).unwrap();
        assert_eq!(config.sweeps.stale(), Duration::from_secs(300));
        assert_eq!(config.sweeps.retry(), Duration::from_secs(600));
        assert_eq!(config.sweeps.stuck(), Duration::from_secs(120));
        assert_eq!(config.sweeps.cleanup(), Duration::from_secs(86_400));
        assert_eq!(config.sweeps.stats(), Duration::from_secs(3_600));
        assert_eq!(config.maintenance.retention_days, 30);
        assert!(config.lifecycle.auto_resolve_failures);
    }

    #[test]
    fn environment_overrides_apply() {
        let config = ContentflowConfig::load_with(env(&[
            ("CONTENTFLOW_BIND_ADDR", "127.0.0.1:9000"),
            ("CONTENTFLOW_RETENTION_DAYS", "7"),
            ("CONTENTFLOW_STALE_SWEEP_SECS", "30"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.maintenance.retention_days, 7);
        assert_eq!(config.sweeps.stale_secs, 30);
        assert_eq!(config.sweeps.retry_secs, 600);
    }

    #[test]
    fn malformed_numbers_are_reported_with_their_key() {
        let err = ContentflowConfig::load_with(env(&[("CONTENTFLOW_RETRY_SWEEP_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { key: "CONTENTFLOW_RETRY_SWEEP_SECS", .. }
        ));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = ContentflowConfig::load_with(env(&[("CONTENTFLOW_STATS_SWEEP_SECS", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn retention_outside_bounds_is_rejected() {
        for days in ["0", "200000000"] {
            let err = ContentflowConfig::load_with(env(&[("CONTENTFLOW_RETENTION_DAYS", days)]))
                .unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.contains("retention_days")));
        }

        let config = ContentflowConfig::load_with(env(&[(
            "CONTENTFLOW_RETENTION_DAYS",
            "36500",
        )]))
        .unwrap();
        assert!(config.maintenance.retention().is_some());
    }

    #[test]
    fn file_is_read_before_overrides() {
        let path = std::env::temp_dir().join(format!(
            "contentflow-config-{}.json",
            contentflow_core::JobId::new()
        ));
        let json = serde_json::json!({
            "bind_addr": "127.0.0.1:7000",
            "job_types": {
                "clean_transcript": {
                    "max_retries": 1,
                    "timeout_ms": 1000,
                    "base_delay_ms": 10,
                    "max_delay_ms": 100,
                    "stale_threshold_ms": 5000
                }
            },
            "maintenance": { "retention_days": 3 }
        });
        std::fs::write(&path, json.to_string()).unwrap();

        let path_str = path.to_string_lossy().to_string();
        let config = ContentflowConfig::load_with(env(&[
            (CONFIG_PATH_ENV, path_str.as_str()),
            ("CONTENTFLOW_RETENTION_DAYS", "9"),
        ]))
        .unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.bind_addr, "127.0.0.1:7000");
        assert_eq!(config.maintenance.retention_days, 9);
        assert_eq!(config.maintenance.retrying_stuck_multiplier, 2);
        assert_eq!(
            config.job_types.config_for(JobType::CleanTranscript).max_retries,
            1
        );
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = ContentflowConfig::load_with(env(&[(
            CONFIG_PATH_ENV,
            "/definitely/not/here/contentflow.json",
        )]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
