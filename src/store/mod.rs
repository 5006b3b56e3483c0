use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::config::{StoreConfig, StoreType};

pub mod fs;
pub mod memory;
pub mod s3;

pub use fs::FsStore;
pub use memory::MemoryStore;
pub use s3::S3Store;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found")]
    NotFound,
    #[error("store transport error: {0}")]
    Transport(String),
}

pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// Contract shared by the `upload` and `proxy` stores. Writes for the same
/// key may race; last writer wins, which is safe because keys are either
/// content-addressed or derived deterministically from the request.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
    async fn read(&self, key: &str) -> Result<Bytes, StoreError>;
    async fn reader(&self, key: &str) -> Result<BlobReader, StoreError>;
    async fn write(&self, key: &str, bytes: Bytes) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Build a store instance from its configuration block.
pub async fn open(config: &StoreConfig) -> Result<Arc<dyn BlobStore>, StoreError> {
    match config.kind {
        StoreType::Fs => Ok(Arc::new(FsStore::new(config.path.clone()))),
        StoreType::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreType::S3 => {
            let bucket = config
                .s3_bucket
                .clone()
                .ok_or_else(|| StoreError::Transport("s3 store requires s3_bucket".into()))?;
            Ok(Arc::new(
                S3Store::from_env(bucket, config.s3_prefix.clone()).await,
            ))
        }
    }
}
