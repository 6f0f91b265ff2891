use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use super::DataFile;
use super::SharedRegion;
use crate::config::LockConfig;
use crate::lock::BoundedRwLock;
use crate::lock::HolderId;
use crate::lock::LockGuard;
use crate::lock::LockMode;
use crate::Result;

/// A shared value guarded by a [`BoundedRwLock`].
///
/// The value is persisted as a [`DataFile`] snapshot; each process keeps a
/// decoded copy keyed by the region's data version so repeated reads skip
/// decoding.
pub struct SharedStore<T> {
    lock: Arc<BoundedRwLock>,
    file: DataFile<T>,
    cache: ArcSwapOption<(u64, Arc<T>)>,
}

/// Read access; the snapshot stays consistent while the guard lives.
pub struct ReadTxn<T> {
    guard: LockGuard,
    value: Arc<T>,
}

impl<T> ReadTxn<T> {
    pub fn value(&self) -> &Arc<T> {
        &self.value
    }

    pub fn guard(&self) -> &LockGuard {
        &self.guard
    }

    /// Keeps the decoded value and releases the lock.
    pub fn into_value(self) -> Arc<T> {
        self.value
    }

    pub fn into_guard(self) -> LockGuard {
        self.guard
    }
}

/// Exclusive access. Dropping without [`WriteTxn::commit`] leaves the stored
/// value untouched.
pub struct WriteTxn<'a, T> {
    store: &'a SharedStore<T>,
    guard: LockGuard,
    current: Arc<T>,
}

impl<T> WriteTxn<'_, T>
where
    T: Serialize + DeserializeOwned + Default + Send + Sync,
{
    pub fn current(&self) -> &Arc<T> {
        &self.current
    }

    pub fn guard(&self) -> &LockGuard {
        &self.guard
    }

    /// Publishes `value` and releases the lock.
    pub fn commit(
        self,
        value: T,
    ) -> Result<Arc<T>> {
        let region = self.store.lock.region();
        // Bump first: a crash between bump and publish only forces readers
        // to reload the unchanged file.
        let version = region.bump_data_version();
        self.store.file.publish(&value)?;

        let value = Arc::new(value);
        self.store.cache.store(Some(Arc::new((version, value.clone()))));
        trace!(lock = %self.store.lock.name(), version, "Published snapshot");
        Ok(value)
    }
}

impl<T> SharedStore<T>
where
    T: Serialize + DeserializeOwned + Default + Send + Sync,
{
    pub fn open(
        name: impl Into<String>,
        region_path: impl Into<std::path::PathBuf>,
        data_path: impl Into<std::path::PathBuf>,
        config: LockConfig,
    ) -> Result<Self> {
        let region = Arc::new(SharedRegion::open(region_path)?);
        Ok(Self {
            lock: Arc::new(BoundedRwLock::new(name, region, config)),
            file: DataFile::new(data_path),
            cache: ArcSwapOption::empty(),
        })
    }

    pub fn lock(&self) -> &Arc<BoundedRwLock> {
        &self.lock
    }

    /// Whether a snapshot was ever published.
    pub fn data_exists(&self) -> bool {
        self.file.exists()
    }

    pub fn read(
        &self,
        holder: HolderId,
        timeout: Option<Duration>,
    ) -> Result<ReadTxn<T>> {
        let guard = self.lock.acquire(LockMode::Read, holder, timeout)?;
        let value = self.load_current()?;
        Ok(ReadTxn { guard, value })
    }

    pub fn write(
        &self,
        holder: HolderId,
        timeout: Option<Duration>,
    ) -> Result<WriteTxn<'_, T>> {
        let guard = self.lock.acquire(LockMode::Write, holder, timeout)?;
        let current = self.load_current()?;
        Ok(WriteTxn {
            store: self,
            guard,
            current,
        })
    }

    fn load_current(&self) -> Result<Arc<T>> {
        let version = self.lock.region().data_version();
        if let Some(cached) = self.cache.load_full() {
            if cached.0 == version {
                return Ok(cached.1.clone());
            }
        }

        let value = Arc::new(self.file.load()?);
        self.cache.store(Some(Arc::new((version, value.clone()))));
        Ok(value)
    }
}
