//! Blob storage for attachments and original messages.

pub mod body;
pub mod file;
pub mod memory;

pub use body::{StoredOriginal, load_original, store_original};
pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::error::StorageError;

/// Byte store addressed by opaque references.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Save `bytes`; `suggested_name` is a hint, the returned reference is authoritative.
    async fn save(&self, bytes: &[u8], suggested_name: &str) -> Result<String, StorageError>;

    async fn read(&self, reference: &str) -> Result<Vec<u8>, StorageError>;

    /// Deleting a reference that no longer exists is not an error.
    async fn delete(&self, reference: &str) -> Result<(), StorageError>;
}
