//! In-memory attachment store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::AttachmentStore;
use crate::error::StorageError;

/// Keeps blobs in a map. References are `uuid/suggested-name`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }

    pub async fn contains(&self, reference: &str) -> bool {
        self.blobs.read().await.contains_key(reference)
    }
}

#[async_trait]
impl AttachmentStore for MemoryStore {
    async fn save(&self, bytes: &[u8], suggested_name: &str) -> Result<String, StorageError> {
        let reference = format!("{}/{}", Uuid::new_v4().simple(), suggested_name);
        self.blobs.write().await.insert(reference.clone(), bytes.to_vec());
        Ok(reference)
    }

    async fn read(&self, reference: &str) -> Result<Vec<u8>, StorageError> {
        self.blobs
            .read()
            .await
            .get(reference)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(reference.to_string()))
    }

    async fn delete(&self, reference: &str) -> Result<(), StorageError> {
        self.blobs.write().await.remove(reference);
        Ok(())
    }
}
