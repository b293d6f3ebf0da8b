//! Configuration for the session core
//!
//! Durations are plain millisecond integers so the config reads naturally from
//! JSON/YAML; accessors convert them to `Duration`.

use crate::error::{Result, SessionError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreConfig {
    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub guardrail: GuardrailConfig,
}

/// Session registry limits and timers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    /// Hard bound on concurrently live sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Evict sessions with no activity for this long
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Evict sessions older than this regardless of activity
    #[serde(default = "default_max_age_ms")]
    pub max_age_ms: u64,

    /// How often the sweeper runs
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// A turn without a terminal result for this long is force-completed
    #[serde(default = "default_turn_timeout_ms")]
    pub turn_timeout_ms: u64,

    /// Events retained per session for reconnect replay
    #[serde(default = "default_replay_capacity")]
    pub replay_capacity: usize,

    /// In-flight tool-use correlation ids retained per session
    #[serde(default = "default_tool_queue_capacity")]
    pub tool_queue_capacity: usize,
}

fn default_max_sessions() -> usize {
    100
}

fn default_idle_timeout_ms() -> u64 {
    30 * 60 * 1000
}

fn default_max_age_ms() -> u64 {
    4 * 60 * 60 * 1000
}

fn default_sweep_interval_ms() -> u64 {
    60 * 1000
}

fn default_turn_timeout_ms() -> u64 {
    10 * 60 * 1000
}

fn default_replay_capacity() -> usize {
    crate::event_bus::DEFAULT_REPLAY_CAPACITY
}

fn default_tool_queue_capacity() -> usize {
    256
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_age_ms: default_max_age_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            turn_timeout_ms: default_turn_timeout_ms(),
            replay_capacity: default_replay_capacity(),
            tool_queue_capacity: default_tool_queue_capacity(),
        }
    }
}

impl RegistryConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_millis(self.turn_timeout_ms)
    }
}

/// Approval gate settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardrailConfig {
    /// How long a gated call waits for a human decision
    #[serde(default = "default_approval_timeout_ms")]
    pub approval_timeout_ms: u64,
}

fn default_approval_timeout_ms() -> u64 {
    5 * 60 * 1000
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            approval_timeout_ms: default_approval_timeout_ms(),
        }
    }
}

impl GuardrailConfig {
    pub fn approval_timeout(&self) -> Duration {
        Duration::from_millis(self.approval_timeout_ms)
    }
}

impl CoreConfig {
    /// Load from a `.json`, `.yaml` or `.yml` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SessionError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: CoreConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content).map_err(|e| {
                SessionError::Config(format!(
                    "Failed to parse config file {}: {}",
                    path.display(),
                    e
                ))
            })?,
            _ => serde_json::from_str(&content).map_err(|e| {
                SessionError::Config(format!(
                    "Failed to parse config file {}: {}",
                    path.display(),
                    e
                ))
            })?,
        };

        config.validate()?;
        tracing::debug!(path = %path.display(), "Config loaded");
        Ok(config)
    }

    /// Reject values that would make the registry unusable
    pub fn validate(&self) -> Result<()> {
        let r = &self.registry;
        if r.max_sessions == 0 {
            return Err(SessionError::Config("maxSessions must be at least 1".into()));
        }
        if r.replay_capacity == 0 {
            return Err(SessionError::Config("replayCapacity must be at least 1".into()));
        }
        if r.tool_queue_capacity == 0 {
            return Err(SessionError::Config("toolQueueCapacity must be at least 1".into()));
        }
        if r.sweep_interval_ms == 0 {
            return Err(SessionError::Config("sweepIntervalMs must be positive".into()));
        }
        if r.turn_timeout_ms == 0 || self.guardrail.approval_timeout_ms == 0 {
            return Err(SessionError::Config("timeouts must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.registry.max_sessions, 100);
        assert_eq!(config.registry.replay_capacity, 100);
        assert_eq!(config.guardrail.approval_timeout(), Duration::from_secs(300));
        assert_eq!(config.registry.idle_timeout(), Duration::from_secs(1800));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, r#"{"registry": {"maxSessions": 2}}"#).unwrap();

        let config = CoreConfig::from_file(&path).unwrap();
        assert_eq!(config.registry.max_sessions, 2);
        assert_eq!(config.registry.turn_timeout_ms, 600_000);
        assert_eq!(config.guardrail.approval_timeout_ms, 300_000);
    }

    #[test]
    fn test_yaml_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.yaml");
        std::fs::write(
            &path,
            "registry:\n  idleTimeoutMs: 1000\nguardrail:\n  approvalTimeoutMs: 50\n",
        )
        .unwrap();

        let config = CoreConfig::from_file(&path).unwrap();
        assert_eq!(config.registry.idle_timeout(), Duration::from_secs(1));
        assert_eq!(config.guardrail.approval_timeout(), Duration::from_millis(50));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, r#"{"registry": {"maxSessions": 0}}"#).unwrap();
        assert!(matches!(
            CoreConfig::from_file(&path),
            Err(SessionError::Config(_))
        ));

        assert!(CoreConfig::from_file(dir.path().join("missing.json")).is_err());
    }
}
