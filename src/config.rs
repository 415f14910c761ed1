//! Configuration management for Kronos.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{KronosError, Result};
use crate::logging::Logger;
use crate::ratelimit::{RateLimiter, SharingMode};

/// Prefix for environment overrides, e.g. `KRONOS__LIMITER__LIMIT=5`.
const ENV_PREFIX: &str = "KRONOS";

/// Main configuration for Kronos.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KronosConfig {
    /// Rate limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Log output configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Rate limiter configuration.
///
/// Values are kept as read so that nonsensical ones (negative limits,
/// negative periods) are rejected by [`LimiterConfig::build`] instead of
/// failing deserialization or being clamped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Maximum admissions per window
    #[serde(default = "default_limit")]
    pub limit: i64,

    /// Window width in seconds
    #[serde(default = "default_time_period_secs")]
    pub time_period_secs: f64,

    /// Ledger file shared between processes; unset keeps state in-process
    #[serde(default)]
    pub ledger_path: Option<PathBuf>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            time_period_secs: default_time_period_secs(),
            ledger_path: None,
        }
    }
}

fn default_limit() -> i64 {
    10
}

fn default_time_period_secs() -> f64 {
    1.0
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl LimiterConfig {
    /// The sharing mode selected by `ledger_path`.
    pub fn mode(&self) -> SharingMode {
        match &self.ledger_path {
            Some(path) => SharingMode::CrossProcess(path.clone()),
            None => SharingMode::SingleProcess,
        }
    }

    /// The validated limit.
    pub fn limit(&self) -> Result<usize> {
        if self.limit <= 0 {
            return Err(KronosError::InvalidConfiguration(format!(
                "limit must be greater than zero, got {}",
                self.limit
            )));
        }
        usize::try_from(self.limit).map_err(|_| {
            KronosError::InvalidConfiguration(format!("limit {} is too large", self.limit))
        })
    }

    /// The validated window width.
    pub fn time_period(&self) -> Result<Duration> {
        if self.time_period_secs.is_nan() || self.time_period_secs <= 0.0 {
            return Err(KronosError::InvalidConfiguration(format!(
                "time period must be greater than zero, got {}",
                self.time_period_secs
            )));
        }
        Duration::try_from_secs_f64(self.time_period_secs).map_err(|e| {
            KronosError::InvalidConfiguration(format!(
                "time period {} is not representable: {}",
                self.time_period_secs, e
            ))
        })
    }

    /// Validate the settings and construct a limiter.
    pub fn build(&self, logger: Arc<dyn Logger>) -> Result<RateLimiter> {
        RateLimiter::new(self.limit()?, self.time_period()?, self.mode(), logger)
    }
}

impl KronosConfig {
    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| KronosError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from an optional YAML file, then apply
    /// `KRONOS__<SECTION>__<KEY>` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Like [`KronosConfig::load`], reading overrides from `env` instead of
    /// the process environment when given.
    fn load_with_env(path: Option<&Path>, env: Option<::config::Map<String, String>>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            if !path.exists() {
                return Err(KronosError::Config(format!(
                    "configuration file {} not found",
                    path.display()
                )));
            }
            builder = builder
                .add_source(::config::File::from(path).format(::config::FileFormat::Yaml));
        }

        builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .source(env),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| KronosError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::TracingLogger;

    fn limiter_config(limit: i64, time_period_secs: f64) -> LimiterConfig {
        LimiterConfig {
            limit,
            time_period_secs,
            ledger_path: None,
        }
    }

    #[test]
    fn test_defaults() {
        let config = KronosConfig::default();

        assert_eq!(config.limiter.limit, 10);
        assert_eq!(config.limiter.time_period_secs, 1.0);
        assert_eq!(config.limiter.mode(), SharingMode::SingleProcess);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
limiter:
  limit: 3
  time_period_secs: 2.5
  ledger_path: /tmp/api.ledger
logging:
  level: debug
"#;
        let config = KronosConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.limiter.limit().unwrap(), 3);
        assert_eq!(config.limiter.time_period().unwrap(), Duration::from_millis(2_500));
        assert_eq!(
            config.limiter.mode(),
            SharingMode::CrossProcess(PathBuf::from("/tmp/api.ledger"))
        );
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_from_yaml_rejects_garbage() {
        let result = KronosConfig::from_yaml("limiter: [1, 2");
        assert!(matches!(result, Err(KronosError::Config(_))));
    }

    #[test]
    fn test_build_rejects_invalid_values() {
        for (limit, period) in [(0, 1.0), (-5, 1.0), (3, 0.0), (3, -1.0), (3, f64::NAN)] {
            let result = limiter_config(limit, period).build(Arc::new(TracingLogger));
            assert!(
                matches!(result, Err(KronosError::InvalidConfiguration(_))),
                "limit={} period={} should be rejected",
                limit,
                period
            );
        }
    }

    #[test]
    fn test_build_valid_limiter() {
        let limiter = limiter_config(4, 0.25).build(Arc::new(TracingLogger)).unwrap();

        assert_eq!(limiter.limit(), 4);
        assert_eq!(limiter.time_period(), Duration::from_millis(250));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kronos.yaml");
        std::fs::write(&path, "limiter:\n  limit: 7\n  time_period_secs: 60\n").unwrap();

        let config = KronosConfig::load(Some(&path)).unwrap();

        assert_eq!(config.limiter.limit, 7);
        assert_eq!(config.limiter.time_period_secs, 60.0);
    }

    #[test]
    fn test_load_missing_file() {
        let result = KronosConfig::load(Some(Path::new("/nonexistent/kronos.yaml")));
        assert!(matches!(result, Err(KronosError::Config(_))));
    }

    #[test]
    fn test_load_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kronos.yaml");
        std::fs::write(&path, "limiter:\n  limit: 7\nlogging:\n  level: debug\n").unwrap();

        let env = ::config::Map::from([
            ("KRONOS__LOGGING__JSON".to_string(), "true".to_string()),
            ("KRONOS__LIMITER__LIMIT".to_string(), "2".to_string()),
            ("UNRELATED__LIMITER__LIMIT".to_string(), "99".to_string()),
        ]);
        let config = KronosConfig::load_with_env(Some(&path), Some(env)).unwrap();

        assert!(config.logging.json);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.limiter.limit().unwrap(), 2);
    }

    #[test]
    fn test_load_ignores_empty_env() {
        let config = KronosConfig::load_with_env(None, Some(::config::Map::new())).unwrap();

        assert_eq!(config.limiter.limit, 10);
        assert!(!config.logging.json);
    }
}
