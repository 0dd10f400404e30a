//! Process-wide configuration for context propagation.

use crate::errors::ContextflowError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Environment variable toggling capture/reactivate timing.
pub const ENV_TIMING_ENABLED: &str = "CONTEXTFLOW_TIMING_ENABLED";
/// Environment variable for the slow-operation warning threshold.
pub const ENV_SLOW_THRESHOLD_MS: &str = "CONTEXTFLOW_SLOW_OPERATION_THRESHOLD_MS";
/// Environment variable for the worker thread name.
pub const ENV_WORKER_THREAD_NAME: &str = "CONTEXTFLOW_WORKER_THREAD_NAME";

/// Configuration for snapshot capture, reactivation and worker threads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropagationConfig {
    /// Whether capture and reactivation are timed and reported to the context timer.
    #[serde(default = "default_timing_enabled")]
    pub timing_enabled: bool,
    /// Capture or reactivation slower than this is logged as a warning.
    #[serde(default = "default_slow_threshold")]
    pub slow_operation_threshold_ms: f64,
    /// Name given to threads spawned by the thread executor.
    #[serde(default = "default_worker_thread_name")]
    pub worker_thread_name: String,
}

fn default_timing_enabled() -> bool {
    true
}

fn default_slow_threshold() -> f64 {
    50.0
}

fn default_worker_thread_name() -> String {
    "contextflow-worker".to_string()
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            timing_enabled: default_timing_enabled(),
            slow_operation_threshold_ms: default_slow_threshold(),
            worker_thread_name: default_worker_thread_name(),
        }
    }
}

impl PropagationConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables timing.
    #[must_use]
    pub fn with_timing_enabled(mut self, enabled: bool) -> Self {
        self.timing_enabled = enabled;
        self
    }

    /// Sets the slow-operation threshold.
    #[must_use]
    pub fn with_slow_operation_threshold_ms(mut self, threshold_ms: f64) -> Self {
        self.slow_operation_threshold_ms = threshold_ms;
        self
    }

    /// Sets the worker thread name.
    #[must_use]
    pub fn with_worker_thread_name(mut self, name: impl Into<String>) -> Self {
        self.worker_thread_name = name.into();
        self
    }

    /// Gets the slow-operation threshold as a Duration.
    #[must_use]
    pub fn slow_operation_threshold(&self) -> Duration {
        let micros = (self.slow_operation_threshold_ms.max(0.0) * 1000.0).round();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let micros = micros as u64;
        Duration::from_micros(micros)
    }

    /// Parses a configuration from JSON, filling missing fields with defaults.
    pub fn from_json(json: &str) -> Result<Self, ContextflowError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ContextflowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the configuration from `CONTEXTFLOW_*` environment variables.
    pub fn from_env() -> Result<Self, ContextflowError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ContextflowError> {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_TIMING_ENABLED) {
            config.timing_enabled = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(ContextflowError::Config(format!(
                        "{ENV_TIMING_ENABLED} must be a boolean, got '{other}'"
                    )))
                }
            };
        }

        if let Some(value) = lookup(ENV_SLOW_THRESHOLD_MS) {
            config.slow_operation_threshold_ms = value.trim().parse().map_err(|_| {
                ContextflowError::Config(format!(
                    "{ENV_SLOW_THRESHOLD_MS} must be a number, got '{value}'"
                ))
            })?;
        }

        if let Some(value) = lookup(ENV_WORKER_THREAD_NAME) {
            config.worker_thread_name = value;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks that the values are usable.
    pub fn validate(&self) -> Result<(), ContextflowError> {
        if !self.slow_operation_threshold_ms.is_finite() || self.slow_operation_threshold_ms < 0.0 {
            return Err(ContextflowError::Config(
                "slow_operation_threshold_ms must be a non-negative number".to_string(),
            ));
        }
        if self.worker_thread_name.trim().is_empty() {
            return Err(ContextflowError::Config(
                "worker_thread_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

static GLOBAL_CONFIG: RwLock<Option<Arc<PropagationConfig>>> = RwLock::new(None);

/// Installs the process-wide configuration.
pub fn set_config(config: PropagationConfig) {
    *GLOBAL_CONFIG.write() = Some(Arc::new(config));
}

/// Restores the default configuration.
pub fn reset_config() {
    *GLOBAL_CONFIG.write() = None;
}

/// Returns the current process-wide configuration.
pub fn config() -> Arc<PropagationConfig> {
    GLOBAL_CONFIG
        .read()
        .clone()
        .unwrap_or_else(|| Arc::new(PropagationConfig::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = PropagationConfig::new();
        assert!(config.timing_enabled);
        assert_eq!(config.slow_operation_threshold(), Duration::from_millis(50));
        assert_eq!(config.worker_thread_name, "contextflow-worker");
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = PropagationConfig::from_json(r#"{"timing_enabled": false}"#).unwrap();
        assert_eq!(
            config,
            PropagationConfig::new().with_timing_enabled(false)
        );
    }

    #[test]
    fn test_from_json_rejects_negative_threshold() {
        let result = PropagationConfig::from_json(r#"{"slow_operation_threshold_ms": -1}"#);
        assert!(matches!(result, Err(ContextflowError::Config(_))));
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            (ENV_TIMING_ENABLED, "off"),
            (ENV_SLOW_THRESHOLD_MS, "12.5"),
            (ENV_WORKER_THREAD_NAME, "ctx-pool"),
        ]
        .into_iter()
        .collect();

        let config =
            PropagationConfig::from_lookup(|key| vars.get(key).map(|v| (*v).to_string())).unwrap();

        assert!(!config.timing_enabled);
        assert!((config.slow_operation_threshold_ms - 12.5).abs() < f64::EPSILON);
        assert_eq!(config.worker_thread_name, "ctx-pool");
    }

    #[test]
    fn test_from_lookup_rejects_bad_bool() {
        let result = PropagationConfig::from_lookup(|key| {
            (key == ENV_TIMING_ENABLED).then(|| "maybe".to_string())
        });
        assert!(matches!(result, Err(ContextflowError::Config(_))));
    }
}
