use std::time::Duration;

use rand::Rng;

use crate::config::LockConfig;
use crate::utils::time::Deadline;

/// Spin-then-sleep waiting strategy for shared-memory wait loops.
///
/// There is no cross-process wakeup primitive, so waiters poll. The sleep
/// doubles from `base_delay` up to `max_delay` with up to 25% jitter so that
/// competing processes do not probe in lockstep.
#[derive(Debug)]
pub struct Backoff {
    spin_attempts: u32,
    attempt: u32,
    delay: Duration,
    base_delay: Duration,
    max_delay: Duration,
}

impl Backoff {
    pub fn new(config: &LockConfig) -> Self {
        Self {
            spin_attempts: config.spin_attempts,
            attempt: 0,
            delay: config.base_delay(),
            base_delay: config.base_delay(),
            max_delay: config.probe_interval(),
        }
    }

    /// Waits one step, never sleeping past `deadline`.
    pub fn snooze(
        &mut self,
        deadline: &Deadline,
    ) {
        self.attempt = self.attempt.saturating_add(1);
        if self.attempt <= self.spin_attempts {
            std::hint::spin_loop();
            std::thread::yield_now();
            return;
        }

        let jitter_cap = (self.delay.as_micros() as u64 / 4).max(1);
        let jitter = Duration::from_micros(rand::thread_rng().gen_range(0..=jitter_cap));
        let sleep = deadline.slice(self.delay + jitter);
        if !sleep.is_zero() {
            std::thread::sleep(sleep);
        }
        self.delay = (self.delay * 2).min(self.max_delay);
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.delay = self.base_delay;
    }
}
