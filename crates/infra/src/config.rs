//! Configuration loading and representation.
//!
//! Sources, later wins:
//! 1. built-in defaults
//! 2. a TOML file named by `COACHQ_CONFIG`
//! 3. individual environment variables (`DATABASE_URL`, `COACHQ_*`)

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use coachq_ai::OpenAiSettings;

use crate::jobs::{ExecutorSettings, LeaseTerms, RetryPolicy, WorkerSettings};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/coachq".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_ceiling_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_secs: 30,
            backoff_ceiling_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub stale_after_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self { stale_after_secs: 600 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub name: String,
    pub interval_ms: u64,
    pub jitter_pct: u8,
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "coach-worker".to_string(),
            interval_ms: 15_000,
            jitter_pct: 20,
            batch_size: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub generation_timeout_secs: u64,
    pub min_period_sessions: usize,
    pub precondition_is_terminal: bool,
    pub recent_activity_days: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            generation_timeout_secs: 60,
            min_period_sessions: 2,
            precondition_is_terminal: false,
            recent_activity_days: 7,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub telegram_bot_token: Option<String>,
}

/// Full service configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoachConfig {
    pub database: DatabaseConfig,
    pub retry: RetryConfig,
    pub lease: LeaseConfig,
    pub worker: WorkerConfig,
    pub executor: ExecutorConfig,
    pub generation: OpenAiSettings,
    pub notifier: NotifierConfig,
}

impl CoachConfig {
    /// Load from `COACHQ_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("COACHQ_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply environment overrides using `lookup` as the variable source.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(url) = lookup("DATABASE_URL") {
            self.database.url = url;
        }
        if let Some(key) = lookup("COACHQ_GENERATION_API_KEY") {
            self.generation.api_key = Some(key);
        }
        if let Some(endpoint) = lookup("COACHQ_GENERATION_ENDPOINT") {
            self.generation.endpoint = endpoint;
        }
        if let Some(model) = lookup("COACHQ_GENERATION_MODEL") {
            self.generation.model = model;
        }
        if let Some(token) = lookup("COACHQ_TELEGRAM_BOT_TOKEN") {
            self.notifier.telegram_bot_token = Some(token);
        }
        if let Some(n) = parse_env(&lookup, "COACHQ_MAX_ATTEMPTS")? {
            self.retry.max_attempts = n;
        }
        if let Some(n) = parse_env(&lookup, "COACHQ_WORKER_BATCH_SIZE")? {
            self.worker.batch_size = n;
        }
        if let Some(n) = parse_env(&lookup, "COACHQ_WORKER_INTERVAL_MS")? {
            self.worker.interval_ms = n;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".to_string()));
        }
        if self.retry.backoff_base_secs > self.retry.backoff_ceiling_secs {
            return Err(ConfigError::Invalid(
                "retry.backoff_base_secs must not exceed retry.backoff_ceiling_secs".to_string(),
            ));
        }
        if self.lease.stale_after_secs == 0 {
            return Err(ConfigError::Invalid("lease.stale_after_secs must be positive".to_string()));
        }
        if self.worker.jitter_pct > 100 {
            return Err(ConfigError::Invalid("worker.jitter_pct must be within 0-100".to_string()));
        }
        if self.worker.batch_size == 0 {
            return Err(ConfigError::Invalid("worker.batch_size must be at least 1".to_string()));
        }
        if self.executor.generation_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "executor.generation_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_secs(self.retry.backoff_base_secs),
            Duration::from_secs(self.retry.backoff_ceiling_secs),
        )
    }

    pub fn lease_terms(&self) -> LeaseTerms {
        LeaseTerms {
            stale_after: Duration::from_secs(self.lease.stale_after_secs),
            max_attempts: self.retry.max_attempts,
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            name: self.worker.name.clone(),
            interval: Duration::from_millis(self.worker.interval_ms),
            jitter_pct: self.worker.jitter_pct,
            batch_size: self.worker.batch_size,
        }
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            generation_timeout: Duration::from_secs(self.executor.generation_timeout_secs),
            min_period_sessions: self.executor.min_period_sessions,
            precondition_is_terminal: self.executor.precondition_is_terminal,
            recent_activity_days: self.executor.recent_activity_days,
        }
    }
}

fn parse_env<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                key: key.to_string(),
                value,
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = CoachConfig::default();
        config.validate().unwrap();
        assert_eq!(config.retry_policy().max_attempts, 3);
        assert_eq!(config.lease_terms().stale_after, Duration::from_secs(600));
        assert!(config.generation.api_key.is_none());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = CoachConfig::from_toml_str(
            r#"
            [retry]
            max_attempts = 5

            [worker]
            batch_size = 10
            jitter_pct = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.backoff_base_secs, 30);
        assert_eq!(config.worker.batch_size, 10);
        assert_eq!(config.worker.interval_ms, 15_000);
        assert_eq!(config.lease_terms().max_attempts, 5);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = CoachConfig::default();
        config
            .apply_env(env(&[
                ("DATABASE_URL", "postgres://db/coach"),
                ("COACHQ_GENERATION_API_KEY", "sk-test"),
                ("COACHQ_MAX_ATTEMPTS", "4"),
            ]))
            .unwrap();
        assert_eq!(config.database.url, "postgres://db/coach");
        assert_eq!(config.generation.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.retry.max_attempts, 4);
    }

    #[test]
    fn malformed_env_number_is_an_error() {
        let mut config = CoachConfig::default();
        let err = config.apply_env(env(&[("COACHQ_WORKER_BATCH_SIZE", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { key, .. } if key == "COACHQ_WORKER_BATCH_SIZE"));
    }

    #[test]
    fn validation_rejects_inverted_backoff() {
        let mut config = CoachConfig::default();
        config.retry.backoff_base_secs = 7200;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn unknown_toml_types_fail_to_parse() {
        assert!(matches!(
            CoachConfig::from_toml_str("[retry]\nmax_attempts = \"three\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
