use std::env;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedError};

/// Upper bound for any stage's max parallelism (number of fixed partition units).
pub const UPPER_BOUND_MAX_PARALLELISM: u32 = 1 << 15;

/// Max parallelism assigned to adaptive stages that do not declare one.
pub const DEFAULT_MAX_PARALLELISM: u32 = 128;

/// Scheduler behavior/configuration knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Target bytes each consumer instance should read behind a blocking edge.
    pub target_bytes_per_instance: u64,
    /// Parallelism given to undetermined stages without any inputs.
    pub default_source_parallelism: u32,
    /// Max parallelism for adaptive stages that leave it unspecified.
    pub default_max_parallelism: u32,
    /// Largest max parallelism the rescale path will accept.
    pub upper_bound_max_parallelism: u32,
    /// Capacity of the coordinator event channel.
    pub event_channel_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            target_bytes_per_instance: 128 * 1024 * 1024,
            default_source_parallelism: 4,
            default_max_parallelism: DEFAULT_MAX_PARALLELISM,
            upper_bound_max_parallelism: UPPER_BOUND_MAX_PARALLELISM,
            event_channel_capacity: 1024,
        }
    }
}

impl SchedulerConfig {
    /// Build a config from `FLOWSCHED_*` environment variables, falling back
    /// to defaults for unset keys.
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        let cfg = Self {
            target_bytes_per_instance: env_u64_or_default(
                "FLOWSCHED_TARGET_BYTES_PER_INSTANCE",
                d.target_bytes_per_instance,
            )?,
            default_source_parallelism: env_u32_or_default(
                "FLOWSCHED_DEFAULT_SOURCE_PARALLELISM",
                d.default_source_parallelism,
            )?,
            default_max_parallelism: env_u32_or_default(
                "FLOWSCHED_DEFAULT_MAX_PARALLELISM",
                d.default_max_parallelism,
            )?,
            upper_bound_max_parallelism: env_u32_or_default(
                "FLOWSCHED_UPPER_BOUND_MAX_PARALLELISM",
                d.upper_bound_max_parallelism,
            )?,
            event_channel_capacity: env_u64_or_default(
                "FLOWSCHED_EVENT_CHANNEL_CAPACITY",
                d.event_channel_capacity as u64,
            )? as usize,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations the scheduler can never honor.
    pub fn validate(&self) -> Result<()> {
        if self.target_bytes_per_instance == 0 {
            return Err(SchedError::InvalidConfig(
                "target_bytes_per_instance must be > 0".to_string(),
            ));
        }
        if self.default_source_parallelism == 0 {
            return Err(SchedError::InvalidConfig(
                "default_source_parallelism must be > 0".to_string(),
            ));
        }
        if self.default_max_parallelism == 0
            || self.default_max_parallelism > self.upper_bound_max_parallelism
        {
            return Err(SchedError::InvalidConfig(format!(
                "default_max_parallelism must be in [1, {}], got {}",
                self.upper_bound_max_parallelism, self.default_max_parallelism
            )));
        }
        if self.event_channel_capacity == 0 {
            return Err(SchedError::InvalidConfig(
                "event_channel_capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Read a string env var, or `default` when unset.
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u32_or_default(key: &str, default: u32) -> Result<u32> {
    match env::var(key) {
        Ok(v) => v
            .trim()
            .parse::<u32>()
            .map_err(|e| SchedError::InvalidConfig(format!("{key}={v}: {e}"))),
        Err(_) => Ok(default),
    }
}

fn env_u64_or_default(key: &str, default: u64) -> Result<u64> {
    match env::var(key) {
        Ok(v) => v
            .trim()
            .parse::<u64>()
            .map_err(|e| SchedError::InvalidConfig(format!("{key}={v}: {e}"))),
        Err(_) => Ok(default),
    }
}
