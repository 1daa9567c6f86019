//! Registry configuration.
//!
//! Durations are written in milliseconds in configuration files:
//!
//! ```toml
//! idle_timeout_ms = 1800000
//! sweep_interval_ms = 60000
//! close_timeout_ms = 10000
//! max_sessions = 64
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Error as RegistryError;

/// Configuration for a [`SessionRegistry`](crate::SessionRegistry).
///
/// Fixed at construction; the registry never reconfigures itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Sessions idle longer than this are evicted by the janitor.
    #[serde(rename = "idle_timeout_ms", with = "duration_ms")]
    pub idle_timeout: Duration,
    /// Interval between janitor sweeps.
    #[serde(rename = "sweep_interval_ms", with = "duration_ms")]
    pub sweep_interval: Duration,
    /// Upper bound on closing a single handle.
    #[serde(rename = "close_timeout_ms", with = "duration_ms")]
    pub close_timeout: Duration,
    /// Maximum number of live sessions, unbounded when `None`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_sessions: Option<usize>,
    /// How many ids `create` tries before reporting exhaustion.
    pub max_id_attempts: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            close_timeout: Duration::from_secs(10),
            max_sessions: None,
            max_id_attempts: 16,
        }
    }
}

impl RegistryConfig {
    /// Sets the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the janitor sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Sets the per-handle close timeout.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Caps the number of live sessions.
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = Some(max);
        self
    }

    /// Sets the id retry budget for `create`.
    pub fn with_max_id_attempts(mut self, attempts: usize) -> Self {
        self.max_id_attempts = attempts;
        self
    }

    /// Checks that every setting is usable.
    ///
    /// # Errors
    /// Returns [`RegistryError::Configuration`] naming the first invalid field.
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.idle_timeout.is_zero() {
            return Err(RegistryError::Configuration("idle_timeout must be non-zero".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(RegistryError::Configuration(
                "sweep_interval must be non-zero".into(),
            ));
        }
        if self.close_timeout.is_zero() {
            return Err(RegistryError::Configuration("close_timeout must be non-zero".into()));
        }
        if self.max_id_attempts == 0 {
            return Err(RegistryError::Configuration(
                "max_id_attempts must be at least 1".into(),
            ));
        }
        if self.max_sessions == Some(0) {
            return Err(RegistryError::Configuration(
                "max_sessions must be at least 1 when set".into(),
            ));
        }
        Ok(())
    }

    /// Load a configuration from TOML text.
    ///
    /// Missing fields take their default values.
    ///
    /// # Errors
    /// Returns `ConfigLoadError` if TOML parsing or validation fails.
    pub fn from_toml(toml: &str) -> Result<Self, ConfigLoadError> {
        let config: RegistryConfig = toml::from_str(toml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file.
    ///
    /// # Errors
    /// Returns `ConfigLoadError` if reading, parsing, or validation fails.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigLoadError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Serialize this configuration to TOML.
    ///
    /// # Errors
    /// Returns the serializer error if encoding fails.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// Error loading a configuration.
#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Validation error: {0}")]
    Validation(#[from] RegistryError),
}

/// Serde adapter storing a `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RegistryConfig::default();
        assert_eq!(config.idle_timeout, Duration::from_secs(1800));
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.close_timeout, Duration::from_secs(10));
        assert_eq!(config.max_sessions, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_setters() {
        let config = RegistryConfig::default()
            .with_idle_timeout(Duration::from_millis(100))
            .with_sweep_interval(Duration::from_millis(10))
            .with_close_timeout(Duration::from_millis(50))
            .with_max_sessions(4)
            .with_max_id_attempts(3);
        assert_eq!(config.idle_timeout, Duration::from_millis(100));
        assert_eq!(config.sweep_interval, Duration::from_millis(10));
        assert_eq!(config.close_timeout, Duration::from_millis(50));
        assert_eq!(config.max_sessions, Some(4));
        assert_eq!(config.max_id_attempts, 3);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let zero = Duration::ZERO;
        let cases = [
            RegistryConfig::default().with_idle_timeout(zero),
            RegistryConfig::default().with_sweep_interval(zero),
            RegistryConfig::default().with_close_timeout(zero),
            RegistryConfig::default().with_max_id_attempts(0),
            RegistryConfig::default().with_max_sessions(0),
        ];
        for config in cases {
            assert!(matches!(config.validate(), Err(RegistryError::Configuration(_))));
        }
    }

    #[test]
    fn test_from_toml_partial() {
        let config = RegistryConfig::from_toml("idle_timeout_ms = 100\nmax_sessions = 8\n").unwrap();
        assert_eq!(config.idle_timeout, Duration::from_millis(100));
        assert_eq!(config.max_sessions, Some(8));
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_from_toml_invalid() {
        let err = RegistryConfig::from_toml("sweep_interval_ms = 0").unwrap_err();
        assert!(matches!(err, ConfigLoadError::Validation(_)));

        let err = RegistryConfig::from_toml("idle_timeout_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, ConfigLoadError::Toml(_)));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = RegistryConfig::default().with_max_sessions(12);
        let text = config.to_toml().unwrap();
        assert!(text.contains("idle_timeout_ms = 1800000"));
        assert_eq!(RegistryConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "close_timeout_ms = 250").unwrap();
        let config = RegistryConfig::from_file(file.path()).unwrap();
        assert_eq!(config.close_timeout, Duration::from_millis(250));

        let err = RegistryConfig::from_file("/nonexistent/tether.toml").unwrap_err();
        assert!(matches!(err, ConfigLoadError::Io(_)));
    }
}
