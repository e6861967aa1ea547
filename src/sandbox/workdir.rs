//! Ephemeral sandbox working directories.
//!
//! Each run gets a fresh temporary directory populated with symlinks into
//! the content store (zero-copy) or plain copies when a stable source path
//! is not available. The directory and everything in it is removed when the
//! `Workdir` drops; the symlink targets belong to the store and are never
//! written through.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::{IoContext, Result};
use crate::store::Store;
use crate::types::Digest;

/// An owned sandbox working directory, cleaned up on drop.
#[derive(Debug)]
pub struct Workdir {
    dir: tempfile::TempDir,
}

impl Workdir {
    /// Create a fresh, empty workdir.
    pub fn create() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("rbx-box-")
            .tempdir()
            .map_err(|e| crate::Error::io("rbx-box", e))?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Absolute path of a logical name inside the workdir, creating parent
    /// directories as needed.
    async fn prepare(&self, logical: &str) -> Result<PathBuf> {
        let dest = self.dir.path().join(logical);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.path_ctx(parent)?;
        }
        Ok(dest)
    }

    /// Symlink `target` as `logical`.
    pub async fn install_link(&self, logical: &str, target: &Path) -> Result<PathBuf> {
        let dest = self.prepare(logical).await?;
        tokio::fs::symlink(target, &dest).await.path_ctx(&dest)?;
        Ok(dest)
    }

    /// Copy `source` as `logical`.
    pub async fn install_copy(&self, logical: &str, source: &Path) -> Result<PathBuf> {
        let dest = self.prepare(logical).await?;
        tokio::fs::copy(source, &dest).await.path_ctx(source)?;
        Ok(dest)
    }

    /// Write bytes as `logical`.
    pub async fn install_bytes(&self, logical: &str, bytes: &[u8]) -> Result<PathBuf> {
        let dest = self.prepare(logical).await?;
        tokio::fs::write(&dest, bytes).await.path_ctx(&dest)?;
        Ok(dest)
    }

    /// Materialize a store entry as `logical`: a symlink when the entry has
    /// a stable uncompressed path, a decompressed copy otherwise.
    pub async fn install_from_store(
        &self,
        store: &Store,
        digest: &Digest,
        logical: &str,
    ) -> Result<PathBuf> {
        let dest = self.prepare(logical).await?;
        store.get_to_path(digest, &dest).await?;
        Ok(dest)
    }

    /// Materialize a store entry as a private copy of `logical`, never a
    /// symlink. Required before [`Workdir::mark_executable`]: the store
    /// entry is read-only shared state and must not be written through.
    pub async fn install_copy_from_store(
        &self,
        store: &Store,
        digest: &Digest,
        logical: &str,
    ) -> Result<PathBuf> {
        let bytes = store.get(digest).await?;
        self.install_bytes(logical, &bytes).await
    }

    /// Chmod `logical` to 0755. Follows symlinks (there is no lchmod), so
    /// the target must be a file the workdir owns — install executables
    /// with a copy variant, never a link into the store.
    pub async fn mark_executable(&self, logical: &str) -> Result<()> {
        let path = self.dir.path().join(logical);
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .await
            .path_ctx(&path)
    }
}
