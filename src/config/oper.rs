use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use super::config_error;
use crate::Result;

/// Operational overlay settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OperConfig {
    /// Slice granted to one pull provider (unit: milliseconds). The slice
    /// is further capped by whatever remains of the caller's budget.
    #[serde(default = "default_pull_timeout_ms")]
    pub pull_timeout_ms: u64,
}

impl Default for OperConfig {
    fn default() -> Self {
        Self {
            pull_timeout_ms: default_pull_timeout_ms(),
        }
    }
}

impl OperConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pull_timeout_ms == 0 {
            return Err(config_error("oper.pull_timeout_ms must be > 0"));
        }
        Ok(())
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_millis(self.pull_timeout_ms)
    }
}

fn default_pull_timeout_ms() -> u64 {
    5_000
}
