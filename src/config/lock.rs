use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use super::budget_from_ms;
use super::config_error;
use crate::Result;

/// Tuning for the bounded RW lock wait loop
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LockConfig {
    /// Busy-spin iterations before the waiter starts sleeping
    #[serde(default = "default_spin_attempts")]
    pub spin_attempts: u32,

    /// First sleep between probes (unit: microseconds)
    #[serde(default = "default_base_delay_us")]
    pub base_delay_us: u64,

    /// Upper bound of the sleep between probes (unit: microseconds). Also
    /// bounds how long a dead holder can block a waiter.
    #[serde(default = "default_probe_interval_us")]
    pub probe_interval_us: u64,

    /// Default budget for Ext Lock operations such as unsubscribe
    /// (unit: milliseconds, 0 blocks indefinitely)
    #[serde(default = "default_ext_lock_timeout_ms")]
    pub ext_lock_timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            spin_attempts: default_spin_attempts(),
            base_delay_us: default_base_delay_us(),
            probe_interval_us: default_probe_interval_us(),
            ext_lock_timeout_ms: default_ext_lock_timeout_ms(),
        }
    }
}

impl LockConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base_delay_us == 0 {
            return Err(config_error("lock.base_delay_us must be > 0"));
        }

        if self.probe_interval_us < self.base_delay_us {
            return Err(config_error(format!(
                "lock.probe_interval_us {}us should not be less than base_delay_us {}us",
                self.probe_interval_us, self.base_delay_us
            )));
        }

        Ok(())
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_micros(self.base_delay_us)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_micros(self.probe_interval_us)
    }

    pub fn ext_lock_timeout(&self) -> Option<Duration> {
        budget_from_ms(self.ext_lock_timeout_ms)
    }
}

fn default_spin_attempts() -> u32 {
    64
}
fn default_base_delay_us() -> u64 {
    20
}
fn default_probe_interval_us() -> u64 {
    2_000
}
fn default_ext_lock_timeout_ms() -> u64 {
    15_000
}
