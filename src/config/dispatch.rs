use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use super::config_error;
use crate::Result;

/// Budgets for user callbacks run by the notification dispatcher
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DispatchConfig {
    /// Budget of one module-change callback in the EVENT phase (unit: milliseconds)
    #[serde(default = "default_callback_timeout_ms")]
    pub callback_timeout_ms: u64,

    /// Budget of one DONE/ABORT callback (unit: milliseconds)
    #[serde(default = "default_done_timeout_ms")]
    pub done_timeout_ms: u64,

    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    #[serde(default = "default_notification_timeout_ms")]
    pub notification_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            callback_timeout_ms: default_callback_timeout_ms(),
            done_timeout_ms: default_done_timeout_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            notification_timeout_ms: default_notification_timeout_ms(),
        }
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("callback_timeout_ms", self.callback_timeout_ms),
            ("done_timeout_ms", self.done_timeout_ms),
            ("rpc_timeout_ms", self.rpc_timeout_ms),
            ("notification_timeout_ms", self.notification_timeout_ms),
        ] {
            if value == 0 {
                return Err(config_error(format!("dispatch.{name} must be > 0")));
            }
        }
        Ok(())
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }

    pub fn done_timeout(&self) -> Duration {
        Duration::from_millis(self.done_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn notification_timeout(&self) -> Duration {
        Duration::from_millis(self.notification_timeout_ms)
    }
}

fn default_callback_timeout_ms() -> u64 {
    5_000
}
fn default_done_timeout_ms() -> u64 {
    5_000
}
fn default_rpc_timeout_ms() -> u64 {
    2_000
}
fn default_notification_timeout_ms() -> u64 {
    1_000
}
