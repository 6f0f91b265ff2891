use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// return millisecond since epoch
pub(crate) fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Absolute point in time by which a blocking call must give up.
///
/// `None` inside means the call may block indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub fn never() -> Self {
        Self { at: None }
    }

    pub fn after(timeout: Option<Duration>) -> Self {
        Self {
            at: timeout.map(|t| Instant::now() + t),
        }
    }

    /// `Duration::ZERO` is read as "no budget", i.e. block indefinitely.
    pub fn from_timeout(timeout: Duration) -> Self {
        if timeout.is_zero() {
            Self::never()
        } else {
            Self::after(Some(timeout))
        }
    }

    pub fn is_bounded(&self) -> bool {
        self.at.is_some()
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.at, Some(at) if Instant::now() >= at)
    }

    /// Time left, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Carves a slice of at most `budget` out of what is left.
    pub fn slice(
        &self,
        budget: Duration,
    ) -> Duration {
        match self.remaining() {
            Some(left) => left.min(budget),
            None => budget,
        }
    }

    /// Time left, but never more than `cap`. `None` only when both are
    /// unbounded.
    pub fn capped(
        &self,
        cap: Option<Duration>,
    ) -> Option<Duration> {
        match (self.remaining(), cap) {
            (Some(left), Some(cap)) => Some(left.min(cap)),
            (left, None) => left,
            (None, cap) => cap,
        }
    }

    pub fn instant(&self) -> Option<Instant> {
        self.at
    }
}

/// `Duration::ZERO` means no budget.
pub(crate) fn optional_timeout(timeout: Duration) -> Option<Duration> {
    (!timeout.is_zero()).then_some(timeout)
}
