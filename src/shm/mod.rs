//! Shared-memory regions and the snapshot files next to them.
//!
//! Every participant maps the same files under [`ShmConfig::dir`]:
//!
//! ```text
//! <prefix>_main.shm                id allocator
//! <prefix>_<kind>.shm / .data      one per datastore kind
//! <prefix>_<module>.sub.shm / .sub one subscription table per module
//! ```

mod data_file;
mod region;
mod store;


pub use data_file::*;
pub(crate) use region::RegionLayout;
pub use region::SharedRegion;
pub use store::*;

use std::fs;
use std::path::PathBuf;

use crate::config::ShmConfig;
use crate::constants::DATA_SUFFIX;
use crate::constants::MAIN_REGION_NAME;
use crate::constants::REGION_SUFFIX;
use crate::constants::SUB_DATA_SUFFIX;
use crate::constants::SUB_REGION_SUFFIX;
use crate::DatastoreKind;
use crate::Error;
use crate::Result;

/// File naming for one store instance.
#[derive(Debug, Clone)]
pub struct ShmPaths {
    dir: PathBuf,
    prefix: String,
}

impl ShmPaths {
    pub fn new(config: &ShmConfig) -> Self {
        Self {
            dir: config.dir.clone(),
            prefix: config.prefix.clone(),
        }
    }

    /// Identifies the store within this process, e.g. for callback lookups.
    pub fn namespace(&self) -> String {
        format!("{}/{}", self.dir.display(), self.prefix)
    }

    pub fn main_region(&self) -> PathBuf {
        self.file(MAIN_REGION_NAME, REGION_SUFFIX)
    }

    pub fn datastore_region(
        &self,
        kind: DatastoreKind,
    ) -> PathBuf {
        self.file(kind.as_str(), REGION_SUFFIX)
    }

    pub fn datastore_data(
        &self,
        kind: DatastoreKind,
    ) -> PathBuf {
        self.file(kind.as_str(), DATA_SUFFIX)
    }

    pub fn subscription_region(
        &self,
        module: &str,
    ) -> Result<PathBuf> {
        validate_module_name(module)?;
        Ok(self.file(module, SUB_REGION_SUFFIX))
    }

    pub fn subscription_data(
        &self,
        module: &str,
    ) -> Result<PathBuf> {
        validate_module_name(module)?;
        Ok(self.file(module, SUB_DATA_SUFFIX))
    }

    /// Modules that have a subscription table on disk.
    pub fn known_modules(&self) -> Result<Vec<String>> {
        let head = format!("{}_", self.prefix);
        let tail = format!(".{SUB_REGION_SUFFIX}");

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(crate::StorageError::IoError(e).into()),
        };

        let mut modules: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter_map(|name| {
                name.strip_prefix(&head)
                    .and_then(|rest| rest.strip_suffix(&tail))
                    .map(str::to_string)
            })
            .collect();
        modules.sort();
        Ok(modules)
    }

    fn file(
        &self,
        name: &str,
        suffix: &str,
    ) -> PathBuf {
        self.dir.join(format!("{}_{}.{}", self.prefix, name, suffix))
    }
}

fn validate_module_name(module: &str) -> Result<()> {
    let valid = !module.is_empty()
        && module
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if valid && module != MAIN_REGION_NAME {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!("invalid module name '{module}'")))
    }
}
