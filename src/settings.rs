//! # Operation Settings Registry
//!
//! Per-operation configuration: timeout, concurrency limit, request-volume
//! threshold, sleep window, and error-percent threshold. Settings are
//! materialized lazily with documented defaults the first time an operation
//! name is referenced, and reconfiguration is last-write-wins.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// How long to wait for a command to complete, in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;
/// How many commands of the same operation can run at the same time
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: u32 = 10;
/// Minimum number of rolling requests before a circuit can trip on health
pub const DEFAULT_REQUEST_VOLUME_THRESHOLD: u64 = 20;
/// How long to wait after a circuit opens before testing for recovery, in milliseconds
pub const DEFAULT_SLEEP_WINDOW_MS: u64 = 5000;
/// Rolling error percentage at or above which a circuit opens
pub const DEFAULT_ERROR_PERCENT_THRESHOLD: u32 = 50;

/// User-facing configuration for one operation.
///
/// Zero-valued fields are filled with the documented defaults when the
/// configuration is resolved; nothing is validated beyond that.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationConfig {
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub max_concurrent_requests: u32,
    #[serde(default)]
    pub request_volume_threshold: u64,
    #[serde(default)]
    pub sleep_window_ms: u64,
    #[serde(default)]
    pub error_percent_threshold: u32,
}

/// Resolved settings for one operation, immutable after creation and shared
/// read-only by every execution of that operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationSettings {
    pub timeout: Duration,
    pub max_concurrent_requests: u32,
    pub request_volume_threshold: u64,
    pub sleep_window: Duration,
    pub error_percent_threshold: u32,
}

impl OperationSettings {
    fn resolve(config: OperationConfig) -> Self {
        let timeout_ms = if config.timeout_ms == 0 {
            DEFAULT_TIMEOUT_MS
        } else {
            config.timeout_ms
        };
        let max_concurrent = if config.max_concurrent_requests == 0 {
            DEFAULT_MAX_CONCURRENT_REQUESTS
        } else {
            config.max_concurrent_requests
        };
        let volume_threshold = if config.request_volume_threshold == 0 {
            DEFAULT_REQUEST_VOLUME_THRESHOLD
        } else {
            config.request_volume_threshold
        };
        let sleep_window_ms = if config.sleep_window_ms == 0 {
            DEFAULT_SLEEP_WINDOW_MS
        } else {
            config.sleep_window_ms
        };
        let error_percent = if config.error_percent_threshold == 0 {
            DEFAULT_ERROR_PERCENT_THRESHOLD
        } else {
            config.error_percent_threshold
        };

        Self {
            timeout: Duration::from_millis(timeout_ms),
            max_concurrent_requests: max_concurrent,
            request_volume_threshold: volume_threshold,
            sleep_window: Duration::from_millis(sleep_window_ms),
            error_percent_threshold: error_percent,
        }
    }
}

impl Default for OperationSettings {
    fn default() -> Self {
        Self::resolve(OperationConfig::default())
    }
}

/// Process-scoped store of resolved settings by operation name.
#[derive(Debug, Default)]
pub struct SettingsRegistry {
    settings: RwLock<HashMap<String, Arc<OperationSettings>>>,
}

impl SettingsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store resolved settings for `name`, overwriting any prior
    /// configuration. Idempotent, last-write-wins.
    pub fn configure(&self, name: &str, config: OperationConfig) {
        let resolved = Arc::new(OperationSettings::resolve(config));
        debug!(
            operation = name,
            timeout_ms = resolved.timeout.as_millis() as u64,
            max_concurrent_requests = resolved.max_concurrent_requests,
            request_volume_threshold = resolved.request_volume_threshold,
            sleep_window_ms = resolved.sleep_window.as_millis() as u64,
            error_percent_threshold = resolved.error_percent_threshold,
            "Operation configured"
        );
        self.settings.write().insert(name.to_string(), resolved);
    }

    /// Settings for `name`, configuring defaults first if none exist.
    pub fn get(&self, name: &str) -> Arc<OperationSettings> {
        {
            let settings = self.settings.read();
            if let Some(existing) = settings.get(name) {
                return Arc::clone(existing);
            }
        }

        let mut settings = self.settings.write();
        // Double-check: another caller may have configured the name between
        // the read release and the write acquire.
        if let Some(existing) = settings.get(name) {
            return Arc::clone(existing);
        }
        let resolved = Arc::new(OperationSettings::default());
        settings.insert(name.to_string(), Arc::clone(&resolved));
        resolved
    }

    /// Names with stored settings, in no particular order.
    pub fn configured_names(&self) -> Vec<String> {
        self.settings.read().keys().cloned().collect()
    }

    /// Drop all stored settings.
    pub fn flush(&self) {
        self.settings.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_fields_filled_with_defaults() {
        let registry = SettingsRegistry::new();
        registry.configure("lookup", OperationConfig::default());

        let settings = registry.get("lookup");
        assert_eq!(settings.timeout, Duration::from_millis(1000));
        assert_eq!(settings.max_concurrent_requests, 10);
        assert_eq!(settings.request_volume_threshold, 20);
        assert_eq!(settings.sleep_window, Duration::from_millis(5000));
        assert_eq!(settings.error_percent_threshold, 50);
    }

    #[test]
    fn test_partial_config_keeps_explicit_values() {
        let registry = SettingsRegistry::new();
        registry.configure(
            "lookup",
            OperationConfig {
                timeout_ms: 250,
                error_percent_threshold: 25,
                ..Default::default()
            },
        );

        let settings = registry.get("lookup");
        assert_eq!(settings.timeout, Duration::from_millis(250));
        assert_eq!(settings.error_percent_threshold, 25);
        assert_eq!(settings.max_concurrent_requests, 10);
    }

    #[test]
    fn test_get_materializes_defaults() {
        let registry = SettingsRegistry::new();
        let settings = registry.get("never-configured");

        assert_eq!(settings.timeout, Duration::from_millis(1000));
        assert_eq!(registry.configured_names(), vec!["never-configured"]);
    }

    #[test]
    fn test_reconfigure_is_last_write_wins() {
        let registry = SettingsRegistry::new();
        registry.configure(
            "lookup",
            OperationConfig {
                timeout_ms: 100,
                ..Default::default()
            },
        );
        registry.configure(
            "lookup",
            OperationConfig {
                timeout_ms: 900,
                ..Default::default()
            },
        );

        assert_eq!(registry.get("lookup").timeout, Duration::from_millis(900));
    }

    #[test]
    fn test_flush_drops_settings() {
        let registry = SettingsRegistry::new();
        registry.configure("lookup", OperationConfig::default());
        registry.flush();

        assert!(registry.configured_names().is_empty());
    }

    #[test]
    fn test_config_deserializes_with_missing_fields() {
        let config: OperationConfig = serde_json::from_str(r#"{"timeout_ms": 300}"#).unwrap();
        assert_eq!(config.timeout_ms, 300);
        assert_eq!(config.max_concurrent_requests, 0);
    }
}
