use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use tracing::error;
use tracing::trace;
use tracing::warn;

use super::HolderId;
use super::HolderRecord;
use super::LockMode;
use crate::config::LockConfig;
use crate::constants::READ_LIMIT;
use crate::shm::SharedRegion;
use crate::utils::backoff::Backoff;
use crate::utils::process::current_pid;
use crate::utils::time::Deadline;
use crate::LockError;
use crate::Result;

/// Reader/writer lock living in a [`SharedRegion`], usable by any process
/// that maps the same file.
///
/// At most [`READ_LIMIT`] readers hold it at once; a writer first claims the
/// writer slot, which bars new readers, then waits for the readers to drain.
/// Waiters reclaim slots whose recorded process has died.
#[derive(Debug)]
pub struct BoundedRwLock {
    name: String,
    region: Arc<SharedRegion>,
    config: LockConfig,
    pid: u32,
}

impl BoundedRwLock {
    pub fn new(
        name: impl Into<String>,
        region: Arc<SharedRegion>,
        config: LockConfig,
    ) -> Self {
        Self {
            name: name.into(),
            region,
            config,
            pid: current_pid(),
        }
    }

    pub fn open(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        config: LockConfig,
    ) -> Result<Self> {
        let region = Arc::new(SharedRegion::open(path)?);
        Ok(Self::new(name, region, config))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    /// Blocks until the lock is obtained in `mode`, or `timeout` elapses.
    /// `None` waits indefinitely.
    ///
    /// A failed attempt leaves no holder record behind.
    pub fn acquire(
        self: &Arc<Self>,
        mode: LockMode,
        holder: HolderId,
        timeout: Option<Duration>,
    ) -> Result<LockGuard> {
        self.check_reentrancy(holder)?;

        let started = Instant::now();
        let deadline = Deadline::after(timeout);
        let slot = match mode {
            LockMode::Read => self.acquire_read(holder, &deadline),
            LockMode::Write => self.acquire_write(holder, &deadline),
        }
        .ok_or_else(|| self.timed_out(mode, started.elapsed()))?;

        trace!(lock = %self.name, ?mode, slot, holder = holder.raw(), "Lock acquired");
        Ok(LockGuard {
            lock: self.clone(),
            mode,
            slot,
            holder,
        })
    }

    fn acquire_read(
        &self,
        holder: HolderId,
        deadline: &Deadline,
    ) -> Option<usize> {
        let mut backoff = Backoff::new(&self.config);
        loop {
            if let Some(slot) = self.try_read(holder) {
                return Some(slot);
            }
            if self.reclaim_dead_holders() > 0 {
                backoff.reset();
                continue;
            }
            if deadline.is_expired() {
                return None;
            }
            backoff.snooze(deadline);
        }
    }

    fn try_read(
        &self,
        holder: HolderId,
    ) -> Option<usize> {
        let layout = self.region.layout();
        if layout.writer.is_occupied() {
            return None;
        }

        for (index, slot) in layout.readers.iter().enumerate() {
            if !slot.try_claim(self.pid, LockMode::Read, false, holder) {
                continue;
            }
            // Both sides publish their claim before checking the other, so a
            // racing writer and reader cannot both proceed.
            if layout.writer.is_occupied() {
                slot.release(self.pid, holder);
                return None;
            }
            return Some(index);
        }
        None
    }

    fn acquire_write(
        &self,
        holder: HolderId,
        deadline: &Deadline,
    ) -> Option<usize> {
        let layout = self.region.layout();
        let mut backoff = Backoff::new(&self.config);

        while !layout.writer.try_claim(self.pid, LockMode::Write, true, holder) {
            if self.reclaim_dead_holders() > 0 {
                backoff.reset();
                continue;
            }
            if deadline.is_expired() {
                return None;
            }
            backoff.snooze(deadline);
        }

        backoff.reset();
        loop {
            if layout.readers.iter().all(|slot| !slot.is_occupied()) {
                layout.writer.promote();
                return Some(0);
            }
            if self.reclaim_dead_holders() > 0 {
                backoff.reset();
                continue;
            }
            if deadline.is_expired() {
                layout.writer.release(self.pid, holder);
                return None;
            }
            backoff.snooze(deadline);
        }
    }

    /// Frees every slot whose recorded process is gone. Returns how many
    /// slots this call reclaimed.
    pub fn reclaim_dead_holders(&self) -> usize {
        let layout = self.region.layout();
        let mut reclaimed = 0;

        let slots = std::iter::once((0, &layout.writer)).chain(layout.readers.iter().enumerate());
        for (index, slot) in slots {
            if let Some(record) = slot.reclaim_if_dead(index, self.pid) {
                warn!(
                    lock = %self.name,
                    pid = record.pid,
                    slot = record.slot,
                    holder = record.holder,
                    mode = ?record.mode,
                    "Reclaimed lock slot of dead process"
                );
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Snapshot of the occupied slots, writer first.
    pub fn holders(&self) -> Vec<HolderRecord> {
        let layout = self.region.layout();
        let mut records: Vec<HolderRecord> = layout.writer.record(0).into_iter().collect();
        records.extend(
            layout
                .readers
                .iter()
                .enumerate()
                .filter_map(|(index, slot)| slot.record(index)),
        );
        records
    }

    pub fn reader_count(&self) -> usize {
        self.region
            .layout()
            .readers
            .iter()
            .filter(|slot| slot.is_occupied())
            .count()
    }

    /// True while a writer holds or waits for the lock.
    pub fn is_write_locked(&self) -> bool {
        self.region.layout().writer.is_occupied()
    }

    fn check_reentrancy(
        &self,
        holder: HolderId,
    ) -> Result<()> {
        let layout = self.region.layout();
        let held = layout.writer.owned_by(self.pid, holder)
            || layout.readers.iter().any(|slot| slot.owned_by(self.pid, holder));
        if held {
            return Err(LockError::Reentrant {
                lock: self.name.clone(),
                holder: holder.raw(),
            }
            .into());
        }
        Ok(())
    }

    fn timed_out(
        &self,
        mode: LockMode,
        waited: Duration,
    ) -> crate::Error {
        let holders = self.holders();
        warn!(lock = %self.name, ?mode, ?waited, ?holders, "Lock acquisition timed out");
        LockError::TimedOut {
            lock: self.name.clone(),
            mode,
            waited,
            holders,
        }
        .into()
    }

    fn release(
        &self,
        mode: LockMode,
        slot: usize,
        holder: HolderId,
    ) {
        let layout = self.region.layout();
        let target = match mode {
            LockMode::Read => layout.readers.get(slot),
            LockMode::Write => Some(&layout.writer),
        };

        let released = target.map(|s| s.release(self.pid, holder)).unwrap_or(false);
        if released {
            trace!(lock = %self.name, ?mode, slot, "Lock released");
        } else {
            let err = LockError::Corrupted {
                lock: self.name.clone(),
                slot,
                reason: format!("slot no longer owned by holder {:#x}", holder.raw()),
            };
            error!(%err, "Failed to release lock");
        }
    }
}

/// Held lock; releases its slot when dropped.
///
/// The guard owns a reference to its lock, so it can be moved to or shared
/// with other threads (e.g. as `Arc<LockGuard>`).
#[derive(Debug)]
pub struct LockGuard {
    lock: Arc<BoundedRwLock>,
    mode: LockMode,
    slot: usize,
    holder: HolderId,
}

impl LockGuard {
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn holder(&self) -> HolderId {
        self.holder
    }

    pub fn lock(&self) -> &Arc<BoundedRwLock> {
        &self.lock
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.lock.release(self.mode, self.slot, self.holder);
    }
}
