use std::collections::HashMap;
use std::io::Cursor;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use super::{BlobReader, BlobStore, StoreError};

/// In-process store used for tests and single-node development setups.
#[derive(Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<String, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.blobs.read().await.contains_key(key))
    }

    async fn read(&self, key: &str) -> Result<Bytes, StoreError> {
        self.blobs
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn reader(&self, key: &str) -> Result<BlobReader, StoreError> {
        let bytes = self.read(key).await?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    async fn write(&self, key: &str, bytes: Bytes) -> Result<(), StoreError> {
        self.blobs.write().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.blobs.write().await.remove(key);
        Ok(())
    }
}
