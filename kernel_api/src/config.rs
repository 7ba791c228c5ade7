//! Boot-time kernel configuration
//!
//! The configuration is fixed for the lifetime of a kernel instance. It can
//! be built in code or parsed from JSON; either way it must pass
//! [`KernelConfig::validate`] before the kernel boots.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Word size used by the slot table bitmaps
pub const BITS_PER_LONG: usize = 64;

/// Scheduling policy selected at boot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SchedPolicyKind {
    /// One FIFO queue per CPU, budget-driven rotation
    RoundRobin,
    /// Strict priority, round-robin within a priority
    #[default]
    PriorityRoundRobin,
    /// Strict priority, run-to-block within a priority
    PriorityFifo,
}

/// Why a configuration was rejected
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(&'static str),
}

/// Kernel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Number of CPUs
    pub cpu_count: usize,
    pub sched_policy: SchedPolicyKind,
    /// Budget in ticks handed to every scheduling context
    pub default_budget: u32,
    /// Length of one timer tick
    pub tick_ns: u64,
    /// Slots in a freshly created cap group
    pub initial_slot_table_size: usize,
    /// Upper bound for slot table growth
    pub max_slot_table_size: usize,
    /// Priority of root threads
    pub default_prio: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            cpu_count: 4,
            sched_policy: SchedPolicyKind::PriorityRoundRobin,
            default_budget: 2,
            tick_ns: 10_000_000,
            initial_slot_table_size: BITS_PER_LONG,
            max_slot_table_size: 65536,
            default_prio: 10,
        }
    }
}

impl KernelConfig {
    /// Highest schedulable priority
    pub const MAX_PRIO: u32 = 255;

    /// Parses and validates a JSON configuration
    ///
    /// Missing fields take their default value.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: KernelConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Checks internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cpu_count == 0 {
            return Err(ConfigError::Invalid("cpu_count must be at least 1"));
        }
        if self.default_budget == 0 {
            return Err(ConfigError::Invalid("default_budget must be at least 1"));
        }
        if self.tick_ns == 0 {
            return Err(ConfigError::Invalid("tick_ns must be non-zero"));
        }
        if self.initial_slot_table_size == 0
            || self.initial_slot_table_size % BITS_PER_LONG != 0
            || self.max_slot_table_size % BITS_PER_LONG != 0
        {
            return Err(ConfigError::Invalid(
                "slot table sizes must be non-zero multiples of 64",
            ));
        }
        if self.initial_slot_table_size > self.max_slot_table_size {
            return Err(ConfigError::Invalid(
                "initial_slot_table_size exceeds max_slot_table_size",
            ));
        }
        if self.default_prio == 0 || self.default_prio > Self::MAX_PRIO {
            return Err(ConfigError::Invalid("default_prio must be in 1..=255"));
        }
        Ok(())
    }

    /// Uses a single CPU
    pub fn single_cpu(mut self) -> Self {
        self.cpu_count = 1;
        self
    }

    pub fn with_policy(mut self, policy: SchedPolicyKind) -> Self {
        self.sched_policy = policy;
        self
    }

    pub fn with_slot_limits(mut self, initial: usize, max: usize) -> Self {
        self.initial_slot_table_size = initial;
        self.max_slot_table_size = max;
        self
    }
}
