//! Object storage for original documents and chunk blobs.
//!
//! Paths are relative keys such as `"<document_id>/original.pdf"` or
//! `"<document_id>/chunks/chunk-0003.pdf"`. [`FsStorage`] maps them below a
//! configured root directory.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn download(&self, path: &str) -> Result<Vec<u8>>;

    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<()>;
}

/// Local filesystem storage rooted at `[storage] root`.
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key below the root, rejecting absolute paths and `..`.
    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        if key.is_empty()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            bail!("invalid storage key: '{}'", key);
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStorage for FsStorage {
    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path)?;
        tokio::fs::read(&full)
            .await
            .with_context(|| format!("Failed to read {}", full.display()))
    }

    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, bytes)
            .await
            .with_context(|| format!("Failed to write {}", full.display()))
    }
}

/// Storage key of a document's original file.
pub fn original_key(document_id: &str) -> String {
    format!("{}/original.pdf", document_id)
}

/// Storage key of one chunk blob.
pub fn chunk_key(document_id: &str, chunk_index: i64) -> String {
    format!("{}/chunks/chunk-{:04}.pdf", document_id, chunk_index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn upload_then_download() {
        let tmp = TempDir::new().unwrap();
        let storage = FsStorage::new(tmp.path());
        storage.upload(&chunk_key("doc-1", 3), b"%PDF-1.4").await.unwrap();

        assert!(tmp.path().join("doc-1/chunks/chunk-0003.pdf").exists());
        let bytes = storage.download("doc-1/chunks/chunk-0003.pdf").await.unwrap();
        assert_eq!(bytes, b"%PDF-1.4");
    }

    #[tokio::test]
    async fn rejects_escaping_keys() {
        let tmp = TempDir::new().unwrap();
        let storage = FsStorage::new(tmp.path());
        assert!(storage.upload("../outside.pdf", b"x").await.is_err());
        assert!(storage.download("/etc/passwd").await.is_err());
    }
}
