//! # config
//!
//! why: keep every timing and sizing knob of a node in one validated place
//! relations: read by node.rs and role/ timers, loaded from json by cohort-sim
//! what: RaftConfig with defaults, json loading, validation

use crate::error::ConfigError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Node timing and sizing. All durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Minimum election timeout
    pub election_timeout_min: u64,
    /// Maximum election timeout
    pub election_timeout_max: u64,
    /// Leader heartbeat interval
    pub heartbeat_interval: u64,
    /// How long a single rpc may take before it counts as a soft failure
    pub rpc_timeout: u64,
    /// Bound of the internal proposal queue
    pub work_queue_capacity: usize,
    /// How often a node announces itself and sweeps silent peers
    pub presence_interval: u64,
    /// Sweeps a provisional peer survives without being heard from
    pub liveness_credits: u32,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            rpc_timeout: 40,
            work_queue_capacity: 64,
            presence_interval: 200,
            liveness_credits: 2,
        }
    }
}

impl RaftConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Reject settings under which heartbeats cannot keep followers quiet.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.election_timeout_min == 0 || self.election_timeout_min > self.election_timeout_max {
            return Err(ConfigError::Invalid(format!(
                "election timeout range {}..={} is empty",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval == 0 || self.heartbeat_interval >= self.election_timeout_min {
            return Err(ConfigError::Invalid(format!(
                "heartbeat interval {} must be below the election timeout {}",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        if self.rpc_timeout == 0 || self.rpc_timeout >= self.election_timeout_min {
            return Err(ConfigError::Invalid(format!(
                "rpc timeout {} must be below the election timeout {}",
                self.rpc_timeout, self.election_timeout_min
            )));
        }
        if self.work_queue_capacity == 0 {
            return Err(ConfigError::Invalid("work queue capacity is 0".into()));
        }
        if self.liveness_credits == 0 || self.presence_interval == 0 {
            return Err(ConfigError::Invalid(
                "presence interval and liveness credits must be positive".into(),
            ));
        }
        Ok(())
    }

    /// A fresh randomised election timeout.
    pub fn election_timeout(&self) -> Duration {
        let ms = rand::thread_rng().gen_range(self.election_timeout_min..=self.election_timeout_max);
        Duration::from_millis(ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn rpc_deadline(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout)
    }

    pub fn presence(&self) -> Duration {
        Duration::from_millis(self.presence_interval)
    }
}
