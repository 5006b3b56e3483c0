use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;

use super::{BlobReader, BlobStore, StoreError};

/// Filesystem-backed store. Keys are base58/alphanumeric so they map to
/// filenames directly. Writes go through a temp file and rename so readers
/// never observe a partial blob.
pub struct FsStore {
    dir: PathBuf,
}

impl FsStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

fn io_err(e: std::io::Error) -> StoreError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StoreError::NotFound
    } else {
        StoreError::Transport(e.to_string())
    }
}

#[async_trait]
impl BlobStore for FsStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        match fs::metadata(self.path_for(key)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Transport(e.to_string())),
        }
    }

    async fn read(&self, key: &str) -> Result<Bytes, StoreError> {
        fs::read(self.path_for(key))
            .await
            .map(Bytes::from)
            .map_err(io_err)
    }

    async fn reader(&self, key: &str) -> Result<BlobReader, StoreError> {
        let file = fs::File::open(self.path_for(key)).await.map_err(io_err)?;
        Ok(Box::new(file))
    }

    async fn write(&self, key: &str, bytes: Bytes) -> Result<(), StoreError> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir)
                .await
                .map_err(|e| StoreError::Transport(e.to_string()))?;
        }
        let path = self.path_for(key);
        let tmp = temp_sibling(&path);
        fs::write(&tmp, &bytes)
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Transport(e.to_string())),
        }
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
