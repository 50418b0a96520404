//! Runtime configuration.
//!
//! Loaded from YAML, then overridden by environment variables:
//!
//! | Variable | Field |
//! |---|---|
//! | `DEFAULT_MODEL` | `default_model` |
//! | `MODEL_TEMPERATURE` | `temperature` |
//!
//! Durations are written in human form (`3s`, `1m 30s`).

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::providers::CompletionConfig;

pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_RUBRIC_CACHE_CAPACITY: u64 = 64;

/// Errors loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

/// Per-case retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per case, including the first
    pub max_attempts: u32,

    /// Fixed pause between attempts
    #[serde(with = "duration_human")]
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            delay: Duration::from_secs(3),
        }
    }
}

/// Everything the evaluator and orchestrator need at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Used when the provider does not report a model
    pub default_model: String,

    pub temperature: f32,
    pub max_tokens: u32,

    #[serde(with = "duration_human")]
    pub request_timeout: Duration,

    pub retry: RetryConfig,

    /// Successful outcomes below this percentage are flagged for review
    pub review_threshold: f64,

    /// Flagged outcomes below this percentage are high priority
    pub high_priority_threshold: f64,

    pub rubric_cache_capacity: u64,

    /// Provider type name in the registry
    pub provider: String,

    /// Provider-specific configuration
    pub provider_options: JsonValue,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_model: DEFAULT_MODEL.to_string(),
            temperature: 0.0,
            max_tokens: 4096,
            request_timeout: Duration::from_secs(60),
            retry: RetryConfig::default(),
            review_threshold: 75.0,
            high_priority_threshold: 50.0,
            rubric_cache_capacity: DEFAULT_RUBRIC_CACHE_CAPACITY,
            provider: "openai".to_string(),
            provider_options: JsonValue::Object(Default::default()),
        }
    }
}

impl RuntimeConfig {
    /// Parse YAML, apply process environment overrides, validate.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: RuntimeConfig = serde_yaml::from_str(yaml)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Defaults plus process environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(model) = lookup("DEFAULT_MODEL").filter(|m| !m.trim().is_empty()) {
            self.default_model = model.trim().to_string();
        }

        if let Some(raw) = lookup("MODEL_TEMPERATURE") {
            self.temperature = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                field: "temperature",
                message: format!("'{}' is not a number", raw),
            })?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_model.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "default_model",
                message: "must not be empty".to_string(),
            });
        }

        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::Invalid {
                field: "temperature",
                message: format!("{} is outside 0.0..=2.0", self.temperature),
            });
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "retry.max_attempts",
                message: "at least one attempt is required".to_string(),
            });
        }

        if self.high_priority_threshold > self.review_threshold {
            return Err(ConfigError::Invalid {
                field: "high_priority_threshold",
                message: format!(
                    "{} is above review_threshold {}",
                    self.high_priority_threshold, self.review_threshold
                ),
            });
        }

        Ok(())
    }

    /// Completion settings for one inference call.
    pub fn completion_config(&self) -> CompletionConfig {
        CompletionConfig {
            model: self.default_model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            timeout: self.request_timeout,
        }
    }
}

mod duration_human {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
