//! Filesystem attachment store with date-partitioned directories.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use super::AttachmentStore;
use crate::error::StorageError;

/// Stores blobs under `root`, in a subdirectory built from `upload_to`
/// (`strftime` escapes expanded at save time).
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    upload_to: String,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>, upload_to: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            upload_to: upload_to.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn upload_dir(&self) -> String {
        if self.upload_to.contains('%') {
            Utc::now().format(&self.upload_to).to_string()
        } else {
            self.upload_to.clone()
        }
    }

    /// Resolve a reference, refusing anything that escapes the root.
    fn resolve(&self, reference: &str) -> Result<PathBuf, StorageError> {
        let rel = Path::new(reference);
        let safe = !reference.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !safe {
            return Err(StorageError::InvalidRef(reference.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

/// Keep only the final path component of a suggested name.
fn sanitize_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("").trim();
    if base.is_empty() || base == "." || base == ".." {
        format!("{}.bin", Uuid::new_v4().simple())
    } else {
        base.to_string()
    }
}

#[async_trait]
impl AttachmentStore for FileStore {
    async fn save(&self, bytes: &[u8], suggested_name: &str) -> Result<String, StorageError> {
        let dir = self.upload_dir();
        let mut name = sanitize_name(suggested_name);
        let mut reference = Path::new(&dir).join(&name);
        let mut path = self.resolve(&reference.to_string_lossy())?;

        if tokio::fs::try_exists(&path).await? {
            let (stem, ext) = match name.rsplit_once('.') {
                Some((stem, ext)) => (stem.to_string(), format!(".{ext}")),
                None => (name.clone(), String::new()),
            };
            name = format!("{stem}_{}{ext}", &Uuid::new_v4().simple().to_string()[..7]);
            reference = Path::new(&dir).join(&name);
            path = self.resolve(&reference.to_string_lossy())?;
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;

        let reference = reference.to_string_lossy().into_owned();
        debug!(reference = %reference, size = bytes.len(), "Blob saved");
        Ok(reference)
    }

    async fn read(&self, reference: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(reference)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(reference.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, reference: &str) -> Result<(), StorageError> {
        let path = self.resolve(reference)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(reference, "Blob already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path(), "mail_attachments/%Y/%m/%d/");

        let reference = store.save(b"payload", "report.pdf").await.unwrap();
        let today = Utc::now().format("mail_attachments/%Y/%m/%d/").to_string();
        assert!(reference.starts_with(&today), "{reference}");
        assert!(reference.ends_with("report.pdf"));
        assert_eq!(store.read(&reference).await.unwrap(), b"payload");

        store.delete(&reference).await.unwrap();
        assert!(matches!(store.read(&reference).await, Err(StorageError::NotFound(_))));
        store.delete(&reference).await.unwrap();
    }

    #[tokio::test]
    async fn name_collisions_get_a_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path(), "flat");
        let a = store.save(b"a", "same.txt").await.unwrap();
        let b = store.save(b"b", "same.txt").await.unwrap();
        assert_ne!(a, b);
        assert!(b.ends_with(".txt"));
        assert_eq!(store.read(&a).await.unwrap(), b"a");
        assert_eq!(store.read(&b).await.unwrap(), b"b");
    }

    #[tokio::test]
    async fn references_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path(), "");
        assert!(matches!(store.read("../etc/passwd").await, Err(StorageError::InvalidRef(_))));
        assert!(matches!(store.read("/etc/passwd").await, Err(StorageError::InvalidRef(_))));

        let reference = store.save(b"x", "../../evil.txt").await.unwrap();
        assert_eq!(reference, "evil.txt");
    }
}
