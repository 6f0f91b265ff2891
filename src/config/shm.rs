use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use super::config_error;
use crate::Result;

/// Where shared regions and their snapshot files live
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ShmConfig {
    /// Directory holding every `*.shm` region and data file. All processes
    /// that should share a datastore must point at the same directory.
    #[serde(default = "default_shm_dir")]
    pub dir: PathBuf,

    /// File name prefix, allows several independent stores per directory
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            dir: default_shm_dir(),
            prefix: default_prefix(),
        }
    }
}

impl ShmConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dir.as_os_str().is_empty() {
            return Err(config_error("shm.dir cannot be empty"));
        }

        if self.prefix.is_empty() {
            return Err(config_error("shm.prefix cannot be empty"));
        }

        if !self
            .prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(config_error(format!(
                "shm.prefix '{}' may only contain [A-Za-z0-9_-]",
                self.prefix
            )));
        }

        Ok(())
    }
}

fn default_shm_dir() -> PathBuf {
    // tmpfs on linux, so the regions behave like posix shm objects
    let dev_shm = PathBuf::from("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm.join("dstore")
    } else {
        std::env::temp_dir().join("dstore")
    }
}

fn default_prefix() -> String {
    "dstore".to_string()
}
