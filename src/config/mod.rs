//! Dispatcher configuration.
//!
//! Options come from a JSON document resolved against defaults, then
//! environment overrides. Unknown options are rejected at load.

mod helpers;
mod weights;

pub use weights::{DEFAULT_WEIGHT_KEY, WeightTable};

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use helpers::parse_env;

/// Raw settings document. Every field is optional; absent fields take
/// the defaults below. `deny_unknown_fields` rejects misspelled or
/// unsupported options.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSettings {
    min_active: Option<usize>,
    max_active: Option<usize>,
    standby_count: Option<usize>,
    scale_up_pct: Option<u8>,
    scale_down_idle_seconds: Option<f64>,
    max_load_per_worker: Option<u32>,
    supervisor_period_seconds: Option<f64>,
    priority_min_active: Option<usize>,
    priority_max_active: Option<usize>,
    shutdown_grace_seconds: Option<f64>,
}

/// Resolved dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Active workers kept in the normal lane at all times.
    pub min_active: usize,
    /// Ceiling on normal-lane active workers.
    pub max_active: usize,
    /// Pre-warmed idle workers held to absorb bursts.
    pub standby_count: usize,
    /// Average-load percentage that triggers scale-up.
    pub scale_up_pct: u8,
    /// How long a zero-load worker may idle before demotion to standby.
    pub scale_down_idle: Duration,
    /// Soft per-worker load ceiling; at or above it the worker is
    /// unavailable to placement.
    pub max_load_per_worker: u32,
    /// Supervisor tick period.
    pub supervisor_period: Duration,
    /// Active workers kept in the priority lane at all times.
    pub priority_min_active: usize,
    /// Ceiling on priority-lane active workers.
    pub priority_max_active: usize,
    /// How long `stop` waits for in-flight work before force-closing.
    pub shutdown_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            min_active: 1,
            max_active: 4,
            standby_count: 1,
            scale_up_pct: 80,
            scale_down_idle: Duration::from_secs(300),
            max_load_per_worker: 100,
            supervisor_period: Duration::from_secs(1),
            priority_min_active: 1,
            priority_max_active: 2,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl DispatcherConfig {
    /// Parse a JSON settings document, apply env overrides, validate.
    pub fn from_json(doc: &str) -> Result<Self, ConfigError> {
        let raw: RawSettings =
            serde_json::from_str(doc).map_err(|e| ConfigError::Parse {
                reason: e.to_string(),
            })?;
        Self::resolve(raw)
    }

    /// Defaults plus env overrides, no document.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::resolve(RawSettings::default())
    }

    fn resolve(raw: RawSettings) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            min_active: parse_env("MCPOOL_MIN_ACTIVE")?
                .or(raw.min_active)
                .unwrap_or(defaults.min_active),
            max_active: parse_env("MCPOOL_MAX_ACTIVE")?
                .or(raw.max_active)
                .unwrap_or(defaults.max_active),
            standby_count: parse_env("MCPOOL_STANDBY_COUNT")?
                .or(raw.standby_count)
                .unwrap_or(defaults.standby_count),
            scale_up_pct: parse_env("MCPOOL_SCALE_UP_PCT")?
                .or(raw.scale_up_pct)
                .unwrap_or(defaults.scale_up_pct),
            scale_down_idle: secs_f64(
                "scale_down_idle_seconds",
                parse_env("MCPOOL_SCALE_DOWN_IDLE_SECS")?
                    .or(raw.scale_down_idle_seconds)
                    .unwrap_or(defaults.scale_down_idle.as_secs_f64()),
            )?,
            max_load_per_worker: parse_env("MCPOOL_MAX_LOAD_PER_WORKER")?
                .or(raw.max_load_per_worker)
                .unwrap_or(defaults.max_load_per_worker),
            supervisor_period: secs_f64(
                "supervisor_period_seconds",
                parse_env("MCPOOL_SUPERVISOR_PERIOD_SECS")?
                    .or(raw.supervisor_period_seconds)
                    .unwrap_or(defaults.supervisor_period.as_secs_f64()),
            )?,
            priority_min_active: parse_env("MCPOOL_PRIORITY_MIN_ACTIVE")?
                .or(raw.priority_min_active)
                .unwrap_or(defaults.priority_min_active),
            priority_max_active: parse_env("MCPOOL_PRIORITY_MAX_ACTIVE")?
                .or(raw.priority_max_active)
                .unwrap_or(defaults.priority_max_active),
            shutdown_grace: secs_f64(
                "shutdown_grace_seconds",
                parse_env("MCPOOL_SHUTDOWN_GRACE_SECS")?
                    .or(raw.shutdown_grace_seconds)
                    .unwrap_or(defaults.shutdown_grace.as_secs_f64()),
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Range checks for hand-built configs as well as parsed ones.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_active < 1 {
            return Err(invalid("min_active", "must be at least 1"));
        }
        if self.max_active < self.min_active {
            return Err(invalid("max_active", "must be >= min_active"));
        }
        if !(1..=100).contains(&self.scale_up_pct) {
            return Err(invalid("scale_up_pct", "must be in 1..=100"));
        }
        if self.max_load_per_worker == 0 {
            return Err(invalid("max_load_per_worker", "must be positive"));
        }
        if self.supervisor_period.is_zero() {
            return Err(invalid("supervisor_period_seconds", "must be positive"));
        }
        if self.scale_down_idle.is_zero() {
            return Err(invalid("scale_down_idle_seconds", "must be positive"));
        }
        if self.priority_max_active < self.priority_min_active {
            return Err(invalid(
                "priority_max_active",
                "must be >= priority_min_active",
            ));
        }
        if self.shutdown_grace.is_zero() {
            return Err(invalid("shutdown_grace_seconds", "must be positive"));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn secs_f64(key: &str, value: f64) -> Result<Duration, ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(invalid(key, "must be a positive number of seconds"));
    }
    Ok(Duration::from_secs_f64(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        DispatcherConfig::default().validate().expect("defaults");
    }

    #[test]
    fn document_overrides_defaults() {
        let config = DispatcherConfig::from_json(
            r#"{"min_active": 2, "max_active": 8, "supervisor_period_seconds": 0.25}"#,
        )
        .expect("valid document");
        assert_eq!(config.min_active, 2);
        assert_eq!(config.max_active, 8);
        assert_eq!(config.supervisor_period, Duration::from_millis(250));
        assert_eq!(config.standby_count, DispatcherConfig::default().standby_count);
    }

    #[test]
    fn unknown_options_are_rejected() {
        let err = DispatcherConfig::from_json(r#"{"min_actve": 2}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn range_violations_are_rejected() {
        for (doc, key) in [
            (r#"{"min_active": 0}"#, "min_active"),
            (r#"{"min_active": 3, "max_active": 2}"#, "max_active"),
            (r#"{"scale_up_pct": 0}"#, "scale_up_pct"),
            (r#"{"scale_up_pct": 101}"#, "scale_up_pct"),
            (r#"{"max_load_per_worker": 0}"#, "max_load_per_worker"),
            (
                r#"{"scale_down_idle_seconds": 0}"#,
                "scale_down_idle_seconds",
            ),
            (
                r#"{"priority_min_active": 3, "priority_max_active": 1}"#,
                "priority_max_active",
            ),
        ] {
            match DispatcherConfig::from_json(doc) {
                Err(ConfigError::InvalidValue { key: k, .. }) => assert_eq!(k, key),
                other => panic!("{doc}: expected InvalidValue({key}), got {other:?}"),
            }
        }
    }
}
