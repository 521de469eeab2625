//! Engine configuration.
//!
//! Every section has a `Default` and deserializes with `#[serde(default)]`, so a
//! TOML file only needs the keys it overrides. Durations are milliseconds.
//!
//! ```toml
//! [subscriber]
//! ping_interval_ms = 5000
//! max_attempts = 3
//!
//! [tracker]
//! default_timeout_ms = 8000
//! retention_ms = 60000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfirmError, ConfirmResult, ValidationError};

/// Event subscriber settings: liveness, reconnect policy, diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberConfig {
    /// Idle time after which a liveness ping is sent.
    pub ping_interval_ms: u64,
    /// Time allowed for any reply after a ping before the connection is stale.
    pub pong_timeout_ms: u64,
    /// First reconnect delay.
    pub backoff_base_ms: u64,
    /// Upper bound on a single reconnect delay.
    pub max_backoff_ms: u64,
    /// Fraction of each delay added as uniform random jitter (0.0..=1.0).
    pub jitter: f64,
    /// Consecutive failed attempts before listeners are told the feed is degraded.
    pub max_attempts: u32,
    /// Capacity of the lossy diagnostics tap.
    pub diagnostics_capacity: usize,
    /// Max queued control messages (register/unregister).
    pub control_queue_capacity: usize,
    /// Read timeout on the connection; bounds shutdown latency.
    pub poll_interval_ms: u64,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 10_000,
            pong_timeout_ms: 5_000,
            backoff_base_ms: 250,
            max_backoff_ms: 30_000,
            jitter: 0.2,
            max_attempts: 5,
            diagnostics_capacity: 1024,
            control_queue_capacity: 1024,
            poll_interval_ms: 25,
        }
    }
}

impl SubscriberConfig {
    #[must_use]
    pub const fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    #[must_use]
    pub const fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Command dispatcher settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Upper bound on concurrent calls for a parallel intent.
    pub max_parallel_calls: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { max_parallel_calls: 16 }
    }
}

/// Operation tracker settings: timeouts and retention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Timeout applied when a dispatch does not specify one.
    pub default_timeout_ms: u64,
    /// Largest timeout a caller may request.
    pub max_timeout_ms: u64,
    /// How long a terminal record stays queryable.
    pub retention_ms: u64,
    /// Period of the background purge.
    pub gc_interval_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 10_000,
            max_timeout_ms: 300_000,
            retention_ms: 300_000,
            gc_interval_ms: 5_000,
        }
    }
}

impl TrackerConfig {
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    #[must_use]
    pub const fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }

    /// Resolves an optional caller timeout against the default and the cap.
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Result<Duration, ValidationError> {
        let timeout = requested.unwrap_or_else(|| self.default_timeout());
        let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        if ms == 0 || ms > self.max_timeout_ms {
            return Err(ValidationError::InvalidTimeout {
                timeout_ms: ms,
                max_ms: self.max_timeout_ms,
            });
        }
        Ok(timeout)
    }
}

/// Tolerances used by the per-domain predicate table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredicateConfig {
    /// Light brightness, on the 0-255 attribute scale.
    pub brightness_tolerance: f64,
    pub color_temp_tolerance: f64,
    /// Cover position and tilt, percent.
    pub position_tolerance: f64,
    /// Climate target temperature, degrees.
    pub temperature_tolerance: f64,
    /// Media player volume, 0.0..=1.0.
    pub volume_tolerance: f64,
    /// Fan speed, percent.
    pub percentage_tolerance: f64,
    /// Numeric entities whose state itself is the value.
    pub numeric_state_tolerance: f64,
}

impl Default for PredicateConfig {
    fn default() -> Self {
        Self {
            brightness_tolerance: 3.0,
            color_temp_tolerance: 50.0,
            position_tolerance: 2.0,
            temperature_tolerance: 0.5,
            volume_tolerance: 0.02,
            percentage_tolerance: 1.0,
            numeric_state_tolerance: 0.001,
        }
    }
}

/// Top-level engine configuration.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub subscriber: SubscriberConfig,
    pub dispatcher: DispatcherConfig,
    pub tracker: TrackerConfig,
    pub predicates: PredicateConfig,
}

impl EngineConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(input: &str) -> ConfirmResult<Self> {
        let cfg: Self = toml::from_str(input).map_err(|e| ValidationError::InvalidConfig {
            reason: e.to_string(),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads, parses and validates a TOML file.
    pub fn from_path(path: impl AsRef<Path>) -> ConfirmResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfirmError::internal(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Rejects settings that would make the engine misbehave.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |reason: &str| {
            Err(ValidationError::InvalidConfig {
                reason: reason.to_string(),
            })
        };

        let s = &self.subscriber;
        if s.ping_interval_ms == 0 || s.pong_timeout_ms == 0 {
            return invalid("subscriber ping_interval_ms and pong_timeout_ms must be positive");
        }
        if s.backoff_base_ms == 0 || s.max_backoff_ms < s.backoff_base_ms {
            return invalid("subscriber backoff_base_ms must be positive and <= max_backoff_ms");
        }
        if !(0.0..=1.0).contains(&s.jitter) {
            return invalid("subscriber jitter must be within 0.0..=1.0");
        }
        if s.poll_interval_ms == 0 {
            return invalid("subscriber poll_interval_ms must be positive");
        }

        let t = &self.tracker;
        if t.default_timeout_ms == 0 || t.default_timeout_ms > t.max_timeout_ms {
            return invalid("tracker default_timeout_ms must be within 1..=max_timeout_ms");
        }
        if t.gc_interval_ms == 0 {
            return invalid("tracker gc_interval_ms must be positive");
        }

        if self.dispatcher.max_parallel_calls == 0 {
            return invalid("dispatcher max_parallel_calls must be positive");
        }

        let p = &self.predicates;
        let tolerances = [
            p.brightness_tolerance,
            p.color_temp_tolerance,
            p.position_tolerance,
            p.temperature_tolerance,
            p.volume_tolerance,
            p.percentage_tolerance,
            p.numeric_state_tolerance,
        ];
        if tolerances.iter().any(|t| !t.is_finite() || *t < 0.0) {
            return invalid("predicate tolerances must be finite and non-negative");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = EngineConfig::from_toml_str(
            r#"
            [subscriber]
            max_attempts = 2

            [tracker]
            retention_ms = 1000
            "#,
        )
        .unwrap();
        assert_eq!(cfg.subscriber.max_attempts, 2);
        assert_eq!(cfg.subscriber.ping_interval_ms, 10_000);
        assert_eq!(cfg.tracker.retention(), Duration::from_secs(1));
        assert_eq!(cfg.predicates, PredicateConfig::default());
    }

    #[test]
    fn invalid_jitter_is_rejected() {
        let err = EngineConfig::from_toml_str("[subscriber]\njitter = 2.5\n").unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn malformed_toml_is_a_validation_error() {
        let err = EngineConfig::from_toml_str("[tracker\nretention_ms = ").unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn effective_timeout_bounds() {
        let t = TrackerConfig::default();
        assert_eq!(t.effective_timeout(None).unwrap(), Duration::from_secs(10));
        assert_eq!(
            t.effective_timeout(Some(Duration::from_millis(1500))).unwrap(),
            Duration::from_millis(1500)
        );
        assert!(t.effective_timeout(Some(Duration::ZERO)).is_err());
        assert!(t.effective_timeout(Some(Duration::from_secs(3600))).is_err());
    }

    #[test]
    fn from_path_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devconfirm.toml");
        std::fs::write(&path, "[dispatcher]\nmax_parallel_calls = 4\n").unwrap();
        let cfg = EngineConfig::from_path(&path).unwrap();
        assert_eq!(cfg.dispatcher.max_parallel_calls, 4);
    }
}
