//! Executor settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Scheduling knobs for an `Executor`.
///
/// Every field has a default, so a JSON document only needs the fields it
/// changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Longest sleep when no transfer can make progress.
    pub idle_wait_ms: u64,
    /// Transport events handled per transfer before moving to the next one.
    /// `0` is treated as `1`.
    pub events_per_step: usize,
    /// Deadline for handles that do not set `TIMEOUT_MS`.
    pub default_timeout_ms: Option<u64>,
    /// Cap on transfers running at once in `run_many`; `0` means no cap.
    pub max_concurrent: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            idle_wait_ms: 10,
            events_per_step: 32,
            default_timeout_ms: None,
            max_concurrent: 0,
        }
    }
}

impl ExecutorConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms.max(1))
    }

    pub fn events_per_step(&self) -> usize {
        self.events_per_step.max(1)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = ExecutorConfig::from_json(r#"{ "max_concurrent": 2, "default_timeout_ms": 500 }"#).unwrap();
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.default_timeout(), Some(Duration::from_millis(500)));
        assert_eq!(config.events_per_step, 32);
        assert_eq!(config.idle_wait(), Duration::from_millis(10));
    }

    #[test]
    fn zero_default_timeout_means_none() {
        let config = ExecutorConfig {
            default_timeout_ms: Some(0),
            ..ExecutorConfig::default()
        };
        assert_eq!(config.default_timeout(), None);
    }

    #[test]
    fn zero_events_per_step_still_makes_progress() {
        let config = ExecutorConfig::from_json(r#"{ "events_per_step": 0, "idle_wait_ms": 0 }"#).unwrap();
        assert_eq!(config.events_per_step(), 1);
        assert_eq!(config.idle_wait(), Duration::from_millis(1));
    }

    #[test]
    fn rejects_wrong_types() {
        assert!(ExecutorConfig::from_json(r#"{ "idle_wait_ms": "fast" }"#).is_err());
    }
}
