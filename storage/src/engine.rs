use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs;
use tracing::{debug, info};

use crate::{Result, StorageError};

/// Flat folder of files, one per stored name.
#[derive(Debug)]
pub struct StorageEngine {
    folder: PathBuf,
}

impl StorageEngine {
    pub async fn new(folder: impl AsRef<Path>) -> Result<Self> {
        let folder = folder.as_ref().to_path_buf();

        match fs::metadata(&folder).await {
            Ok(meta) if !meta.is_dir() => {
                return Err(StorageError::InvalidConfig(format!(
                    "{} exists and is not a directory",
                    folder.display()
                )));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fs::create_dir_all(&folder).await?;
                info!("created storage folder {:?}", folder);
            }
            Err(e) => return Err(StorageError::Io(e)),
        }

        Ok(Self { folder })
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub async fn put(&self, name: &str, data: Bytes) -> Result<()> {
        let path = self.path_of(name)?;
        fs::write(&path, &data).await?;
        debug!(file = %name, "stored {} bytes", data.len());
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<Bytes> {
        let path = self.path_of(name)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::FileNotFound(name.to_string()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    pub async fn size(&self, name: &str) -> Result<u64> {
        let path = self.path_of(name)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::FileNotFound(name.to_string()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Returns whether a file was actually removed.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let path = self.path_of(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(file = %name, "deleted");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Names of all regular files in the folder, sorted.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.folder).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn path_of(&self, name: &str) -> Result<PathBuf> {
        let invalid = name.is_empty()
            || name == "."
            || name == ".."
            || name.contains(['/', '\\'])
            || name.chars().any(char::is_whitespace);
        if invalid {
            return Err(StorageError::InvalidName(name.to_string()));
        }
        Ok(self.folder.join(name))
    }
}
