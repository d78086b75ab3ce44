//! devgrid.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DevGridConfig {
    pub daemon: Option<DaemonConfig>,
    pub health: Option<HealthConfig>,
    pub relay: Option<RelayConfig>,
    pub metrics: Option<MetricsConfig>,
    pub retry: Option<RetryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub data_dir: Option<String>,
    /// Seconds between provisioning-poll attempts while an environment
    /// is coming up.
    pub provision_poll_secs: Option<u64>,
    /// Give up on provisioning after this many seconds.
    pub provision_deadline_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub interval_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
    /// Consecutive failures before a cluster is marked unreachable.
    pub unreachable_threshold: Option<u32>,
    /// Consecutive successes (after the first recovery probe) before a
    /// cluster is marked healthy again.
    pub healthy_threshold: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Idle timeout before the sweep reaps a session, in seconds.
    pub idle_timeout_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
    /// Token bucket burst capacity for input frames.
    pub input_burst: Option<u32>,
    /// Token bucket refill rate, input frames per second.
    pub input_per_sec: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub sample_interval_secs: Option<u64>,
    /// Samples older than this are purged, in seconds.
    pub retention_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: Option<u32>,
    pub base_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub call_timeout_secs: Option<u64>,
}

impl DevGridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DevGridConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn provision_poll(&self) -> Duration {
        Duration::from_secs(
            self.daemon
                .as_ref()
                .and_then(|d| d.provision_poll_secs)
                .unwrap_or(2),
        )
    }

    pub fn provision_deadline(&self) -> Duration {
        Duration::from_secs(
            self.daemon
                .as_ref()
                .and_then(|d| d.provision_deadline_secs)
                .unwrap_or(300),
        )
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(
            self.health
                .as_ref()
                .and_then(|h| h.interval_secs)
                .unwrap_or(15),
        )
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(
            self.health
                .as_ref()
                .and_then(|h| h.timeout_secs)
                .unwrap_or(5),
        )
    }

    pub fn unreachable_threshold(&self) -> u32 {
        self.health
            .as_ref()
            .and_then(|h| h.unreachable_threshold)
            .unwrap_or(3)
    }

    pub fn healthy_threshold(&self) -> u32 {
        self.health
            .as_ref()
            .and_then(|h| h.healthy_threshold)
            .unwrap_or(2)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(
            self.relay
                .as_ref()
                .and_then(|r| r.idle_timeout_secs)
                .unwrap_or(600),
        )
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(
            self.relay
                .as_ref()
                .and_then(|r| r.sweep_interval_secs)
                .unwrap_or(30),
        )
    }

    pub fn input_burst(&self) -> u32 {
        self.relay.as_ref().and_then(|r| r.input_burst).unwrap_or(200)
    }

    pub fn input_per_sec(&self) -> u32 {
        self.relay.as_ref().and_then(|r| r.input_per_sec).unwrap_or(50)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(
            self.metrics
                .as_ref()
                .and_then(|m| m.sample_interval_secs)
                .unwrap_or(60),
        )
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(
            self.metrics
                .as_ref()
                .and_then(|m| m.retention_secs)
                .unwrap_or(24 * 60 * 60),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry.as_ref().and_then(|r| r.max_attempts).unwrap_or(4)
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(
            self.retry
                .as_ref()
                .and_then(|r| r.base_backoff_ms)
                .unwrap_or(250),
        )
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(
            self.retry
                .as_ref()
                .and_then(|r| r.max_backoff_ms)
                .unwrap_or(5_000),
        )
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(
            self.retry
                .as_ref()
                .and_then(|r| r.call_timeout_secs)
                .unwrap_or(10),
        )
    }
}
