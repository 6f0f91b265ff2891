use std::fs;
use std::io::ErrorKind;
use std::io::Write;
use std::marker::PhantomData;
use std::path::Path;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::utils::process::current_pid;
use crate::Result;
use crate::StorageError;

/// Bincode snapshot that lives next to a region file.
///
/// Readers and writers must hold the region lock in the matching mode; the
/// file itself carries no synchronisation.
#[derive(Debug)]
pub struct DataFile<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> DataFile<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Missing file reads as `T::default()`.
    pub fn load(&self) -> Result<T> {
        match fs::read(&self.path) {
            Ok(bytes) => bincode::deserialize(&bytes).map_err(|e| {
                StorageError::DataCorruption {
                    location: format!("{}: {}", self.path.display(), e),
                }
                .into()
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(T::default()),
            Err(source) => Err(StorageError::PathError {
                path: self.path.clone(),
                source,
            }
            .into()),
        }
    }

    /// Replaces the snapshot atomically: a crash leaves either the old or
    /// the new content, never a torn file.
    pub fn publish(
        &self,
        value: &T,
    ) -> Result<()> {
        let bytes = bincode::serialize(value).map_err(StorageError::BincodeError)?;

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(format!(".{}.tmp", current_pid()));
        let tmp_path = PathBuf::from(tmp_name);

        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&tmp_path, &self.path)
        };

        write().map_err(|source| {
            let _ = fs::remove_file(&tmp_path);
            StorageError::PathError {
                path: self.path.clone(),
                source,
            }
            .into()
        })
    }
}
