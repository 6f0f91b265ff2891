use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::mem::size_of;
use std::path::Path;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use memmap2::MmapMut;
use memmap2::MmapOptions;
use tracing::debug;

use crate::constants::READ_LIMIT;
use crate::constants::REGION_MAGIC;
use crate::constants::REGION_VERSION;
use crate::lock::HolderSlot;
use crate::Result;
use crate::StorageError;

/// Byte layout shared by every process mapping the same region file.
///
/// A zero-filled file is a valid region: no holders, version 0 data.
#[repr(C)]
pub(crate) struct RegionLayout {
    magic: AtomicU32,
    version: AtomicU32,
    /// Bumped before every committed snapshot publish
    pub(crate) data_version: AtomicU64,
    /// Id allocator, only meaningful in the main region
    pub(crate) next_id: AtomicU64,
    pub(crate) writer: HolderSlot,
    pub(crate) readers: [HolderSlot; READ_LIMIT],
}

/// A file-backed, `MAP_SHARED` mapping of a [`RegionLayout`].
pub struct SharedRegion {
    path: PathBuf,
    layout: NonNull<RegionLayout>,
    _mmap: MmapMut,
    _file: File,
}

// SAFETY: the mapping is only accessed through the atomics of
// `RegionLayout`, which tolerate concurrent access from any thread or process.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl std::fmt::Debug for SharedRegion {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("path", &self.path)
            .field("data_version", &self.data_version())
            .finish()
    }
}

impl SharedRegion {
    /// Maps the region at `path`, creating and zero-filling it if needed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| StorageError::PathError {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| StorageError::PathError {
                path: path.clone(),
                source,
            })?;

        let len = size_of::<RegionLayout>() as u64;
        // set_len only grows with zeroes, concurrent openers agree on the size
        if file.metadata().map_err(StorageError::IoError)?.len() < len {
            file.set_len(len).map_err(StorageError::IoError)?;
        }

        // SAFETY: the file is at least `len` bytes and stays open for the
        // lifetime of the mapping.
        let mut mmap = unsafe { MmapOptions::new().len(len as usize).map_mut(&file) }
            .map_err(StorageError::IoError)?;
        let layout = NonNull::new(mmap.as_mut_ptr() as *mut RegionLayout).ok_or_else(|| {
            StorageError::RegionLayout {
                path: path.clone(),
                reason: "null mapping".to_string(),
            }
        })?;

        let region = Self {
            path,
            layout,
            _mmap: mmap,
            _file: file,
        };
        region.install_header()?;
        Ok(region)
    }

    fn install_header(&self) -> Result<()> {
        let layout = self.layout();

        // Both fields are written with CAS from zero, so racing creators
        // agree without any ordering between them.
        match layout
            .version
            .compare_exchange(0, REGION_VERSION, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) | Err(REGION_VERSION) => {}
            Err(other) => {
                return Err(StorageError::RegionLayout {
                    path: self.path.clone(),
                    reason: format!("unsupported version {other}"),
                }
                .into())
            }
        }

        match layout
            .magic
            .compare_exchange(0, REGION_MAGIC, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => debug!(path = %self.path.display(), "Created shared region"),
            Err(REGION_MAGIC) => {}
            Err(other) => {
                return Err(StorageError::RegionLayout {
                    path: self.path.clone(),
                    reason: format!("foreign magic {other:#x}"),
                }
                .into())
            }
        }

        Ok(())
    }

    pub(crate) fn layout(&self) -> &RegionLayout {
        // SAFETY: see `open`; all fields are atomics.
        unsafe { self.layout.as_ref() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data_version(&self) -> u64 {
        self.layout().data_version.load(Ordering::Acquire)
    }

    /// Only called while holding the region lock in write mode.
    pub(crate) fn bump_data_version(&self) -> u64 {
        self.layout().data_version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Allocates an id unique among every process sharing this region.
    /// Ids start at 1 and are never reused.
    pub fn allocate_id(&self) -> u64 {
        self.layout().next_id.fetch_add(1, Ordering::AcqRel) + 1
    }
}
