//! Content-addressed file store.
//!
//! Files are keyed by the SHA-1 digest of their raw bytes and written under
//! `<root>/<digest>` with a JSON sidecar in `<root>/.metadata/`. Writes go
//! through a temp file and an atomic rename, so a concurrent `put` of the
//! same content is idempotent. Entries stored uncompressed expose a stable
//! path suitable for zero-copy symlinking into sandbox workdirs.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest as _, Sha1};
use tokio::io::AsyncReadExt;
use walkdir::WalkDir;

use crate::error::{Error, IoContext, Result};
use crate::types::Digest;

/// Entries larger than this are LZ4-compressed when compression is on.
/// Anything smaller stays raw so `path_for_symlink` can succeed.
pub const COMPRESSION_THRESHOLD_BYTES: u64 = 32 * 1024;

/// Default LZ4 high-compression level.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 3;

const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Store compression policy, set once on the runtime context.
#[derive(Debug, Clone, Copy)]
pub struct CompressionPolicy {
    pub should_compress: bool,
    pub level: u32,
    pub threshold_bytes: u64,
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self {
            should_compress: true,
            level: DEFAULT_COMPRESSION_LEVEL,
            threshold_bytes: COMPRESSION_THRESHOLD_BYTES,
        }
    }
}

impl CompressionPolicy {
    /// Disable compression entirely (every entry symlinkable).
    pub fn disabled() -> Self {
        Self {
            should_compress: false,
            ..Self::default()
        }
    }

    fn applies_to(&self, size: u64) -> bool {
        self.should_compress && size > self.threshold_bytes
    }
}

/// Sidecar metadata stored next to each entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Uncompressed size in bytes
    pub size: u64,
    pub compressed: bool,
    pub level: u32,
    pub created_at: DateTime<Utc>,
}

/// Aggregate numbers from a store sweep.
#[derive(Debug, Default, Clone, Copy)]
pub struct StoreStats {
    pub entries: u64,
    pub compressed_entries: u64,
    /// Bytes on disk (compressed where applicable)
    pub disk_bytes: u64,
}

/// Content-addressed store rooted at a single directory.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    metadata_dir: PathBuf,
    compression: CompressionPolicy,
    check_integrity: bool,
}

impl Store {
    /// Open (creating if needed) a store at `root`.
    pub fn open(
        root: impl Into<PathBuf>,
        compression: CompressionPolicy,
        check_integrity: bool,
    ) -> Result<Self> {
        let root = root.into();
        let metadata_dir = root.join(".metadata");
        std::fs::create_dir_all(&metadata_dir).path_ctx(&metadata_dir)?;
        Ok(Self {
            root,
            metadata_dir,
            compression,
            check_integrity,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store a byte buffer, returning its digest. Idempotent.
    pub async fn put(&self, bytes: &[u8]) -> Result<Digest> {
        let digest = hash_bytes(bytes);
        if self.exists(&digest) {
            return Ok(digest);
        }

        let compress = self.compression.applies_to(bytes.len() as u64);
        let payload = if compress {
            compress_block(bytes, self.compression.level)?
        } else {
            bytes.to_vec()
        };

        self.write_entry(&digest, &payload, bytes.len() as u64, compress)
            .await?;
        Ok(digest)
    }

    /// Store a file by streaming-hashing it first, then copying or
    /// compressing into the store through a temp file + atomic rename.
    pub async fn put_from_path(&self, path: &Path) -> Result<Digest> {
        let (digest, size) = hash_file(path).await?;
        if self.exists(&digest) {
            return Ok(digest);
        }

        if self.compression.applies_to(size) {
            let bytes = tokio::fs::read(path).await.path_ctx(path)?;
            let payload = compress_block(&bytes, self.compression.level)?;
            self.write_entry(&digest, &payload, size, true).await?;
        } else {
            let tmp = self.temp_path();
            tokio::fs::copy(path, &tmp).await.path_ctx(path)?;
            self.commit_entry(&digest, &tmp, size, false).await?;
        }
        Ok(digest)
    }

    /// Read an entry's raw bytes, decompressing if needed.
    pub async fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let meta = self.read_metadata(digest).await?;
        let path = self.entry_path(digest)?;
        let on_disk = tokio::fs::read(&path).await.path_ctx(&path)?;

        let bytes = if meta.compressed {
            decompress_block(&on_disk)?
        } else {
            on_disk
        };

        if self.check_integrity {
            let actual = hash_bytes(&bytes);
            if actual != *digest {
                return Err(Error::Integrity {
                    digest: digest.clone(),
                    actual,
                });
            }
        }
        Ok(bytes)
    }

    /// Materialize an entry at `dest`. Uncompressed entries are delivered
    /// as a symlink; compressed ones as a decompressed copy.
    pub async fn get_to_path(&self, digest: &Digest, dest: &Path) -> Result<()> {
        if let Some(stable) = self.path_for_symlink(digest).await? {
            if tokio::fs::symlink_metadata(dest).await.is_ok() {
                tokio::fs::remove_file(dest).await.path_ctx(dest)?;
            }
            tokio::fs::symlink(&stable, dest).await.path_ctx(dest)?;
            return Ok(());
        }
        let bytes = self.get(digest).await?;
        tokio::fs::write(dest, bytes).await.path_ctx(dest)
    }

    /// Stable filesystem path holding the raw bytes, available if and only
    /// if the entry is stored uncompressed. Used for zero-copy sandbox
    /// preparation.
    pub async fn path_for_symlink(&self, digest: &Digest) -> Result<Option<PathBuf>> {
        let meta = self.read_metadata(digest).await?;
        if meta.compressed {
            return Ok(None);
        }
        Ok(Some(self.entry_path(digest)?))
    }

    pub fn exists(&self, digest: &Digest) -> bool {
        self.entry_path(digest)
            .map(|p| p.exists())
            .unwrap_or(false)
    }

    /// Remove one entry and its sidecar.
    pub async fn remove(&self, digest: &Digest) -> Result<()> {
        let path = self.entry_path(digest)?;
        if path.exists() {
            tokio::fs::remove_file(&path).await.path_ctx(&path)?;
        }
        let sidecar = self.metadata_path(digest)?;
        if sidecar.exists() {
            tokio::fs::remove_file(&sidecar).await.path_ctx(&sidecar)?;
        }
        Ok(())
    }

    /// Delete the whole store. Must not run while evaluations are in
    /// flight: sandbox workdirs hold symlinks into the store.
    pub async fn clear(&self) -> Result<()> {
        tokio::fs::remove_dir_all(&self.root)
            .await
            .path_ctx(&self.root)?;
        tokio::fs::create_dir_all(&self.metadata_dir)
            .await
            .path_ctx(&self.metadata_dir)?;
        Ok(())
    }

    /// Sweep the store for entry count and on-disk size.
    pub async fn stats(&self) -> Result<StoreStats> {
        let root = self.root.clone();
        let metadata_dir = self.metadata_dir.clone();
        let stats = tokio::task::spawn_blocking(move || {
            let mut stats = StoreStats::default();
            for entry in WalkDir::new(&root).min_depth(1).max_depth(1) {
                let Ok(entry) = entry else { continue };
                if !entry.file_type().is_file() {
                    continue;
                }
                stats.entries += 1;
                if let Ok(meta) = entry.metadata() {
                    stats.disk_bytes += meta.len();
                }
                let sidecar = metadata_dir.join(format!(
                    "{}.json",
                    entry.file_name().to_string_lossy()
                ));
                if let Ok(text) = std::fs::read_to_string(&sidecar) {
                    if let Ok(meta) = serde_json::from_str::<EntryMetadata>(&text) {
                        if meta.compressed {
                            stats.compressed_entries += 1;
                        }
                    }
                }
            }
            stats
        })
        .await
        .map_err(|e| Error::Sandbox(anyhow::anyhow!("store sweep task failed: {e}")))?;
        Ok(stats)
    }

    fn entry_path(&self, digest: &Digest) -> Result<PathBuf> {
        validate_digest(digest)?;
        Ok(self.root.join(digest))
    }

    fn metadata_path(&self, digest: &Digest) -> Result<PathBuf> {
        validate_digest(digest)?;
        Ok(self.metadata_dir.join(format!("{digest}.json")))
    }

    fn temp_path(&self) -> PathBuf {
        self.root
            .join(format!(".tmp-{}", uuid::Uuid::new_v4().simple()))
    }

    async fn read_metadata(&self, digest: &Digest) -> Result<EntryMetadata> {
        let path = self.metadata_path(digest)?;
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|_| Error::MissingDigest(digest.clone()))?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn write_entry(
        &self,
        digest: &Digest,
        payload: &[u8],
        size: u64,
        compressed: bool,
    ) -> Result<()> {
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, payload).await.path_ctx(&tmp)?;
        self.commit_entry(digest, &tmp, size, compressed).await
    }

    /// Rename a fully-written temp file into place and drop the sidecar.
    async fn commit_entry(
        &self,
        digest: &Digest,
        tmp: &Path,
        size: u64,
        compressed: bool,
    ) -> Result<()> {
        let dest = self.entry_path(digest)?;
        tokio::fs::rename(tmp, &dest).await.path_ctx(&dest)?;

        let meta = EntryMetadata {
            size,
            compressed,
            level: if compressed { self.compression.level } else { 0 },
            created_at: Utc::now(),
        };
        let sidecar = self.metadata_path(digest)?;
        tokio::fs::write(&sidecar, serde_json::to_vec(&meta)?)
            .await
            .path_ctx(&sidecar)?;

        tracing::debug!(digest = %digest, size, compressed, "Stored entry");
        Ok(())
    }
}

/// SHA-1 of a byte buffer as lowercase hex.
pub fn hash_bytes(bytes: &[u8]) -> Digest {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Streaming SHA-1 of a file, returning (digest, size).
pub async fn hash_file(path: &Path) -> Result<(Digest, u64)> {
    let mut file = tokio::fs::File::open(path).await.path_ctx(path)?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).await.path_ctx(path)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

fn validate_digest(digest: &str) -> Result<()> {
    if digest.len() == 40 && digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("malformed digest: {digest}")))
    }
}

fn compress_block(bytes: &[u8], level: u32) -> Result<Vec<u8>> {
    let mode = if level > 0 {
        Some(lz4::block::CompressionMode::HIGHCOMPRESSION(level as i32))
    } else {
        None
    };
    lz4::block::compress(bytes, mode, true)
        .map_err(|e| Error::Sandbox(anyhow::anyhow!("lz4 compression failed: {e}")))
}

fn decompress_block(bytes: &[u8]) -> Result<Vec<u8>> {
    lz4::block::decompress(bytes, None)
        .map_err(|e| Error::Sandbox(anyhow::anyhow!("lz4 decompression failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(compression: CompressionPolicy) -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store"), compression, true).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let (_dir, store) = temp_store(CompressionPolicy::default());
        let digest = store.put(b"hello judge").await.unwrap();
        assert_eq!(digest.len(), 40);
        assert!(store.exists(&digest));
        assert_eq!(store.get(&digest).await.unwrap(), b"hello judge");
    }

    #[tokio::test]
    async fn put_is_idempotent() {
        let (_dir, store) = temp_store(CompressionPolicy::default());
        let d1 = store.put(b"same bytes").await.unwrap();
        let d2 = store.put(b"same bytes").await.unwrap();
        assert_eq!(d1, d2);
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn large_entries_compress_and_lose_symlink_path() {
        let (_dir, store) = temp_store(CompressionPolicy::default());
        let big = vec![b'x'; 256 * 1024];
        let digest = store.put(&big).await.unwrap();
        assert!(store.path_for_symlink(&digest).await.unwrap().is_none());
        assert_eq!(store.get(&digest).await.unwrap(), big);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.compressed_entries, 1);
        // 256 KiB of a single repeated byte compresses well
        assert!(stats.disk_bytes < big.len() as u64);
    }

    #[tokio::test]
    async fn small_entries_stay_symlinkable() {
        let (_dir, store) = temp_store(CompressionPolicy::default());
        let digest = store.put(b"tiny").await.unwrap();
        let path = store.path_for_symlink(&digest).await.unwrap().unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"tiny");
    }

    #[tokio::test]
    async fn get_to_path_materializes_compressed_copy() {
        let (dir, store) = temp_store(CompressionPolicy::default());
        let big = vec![b'y'; 128 * 1024];
        let digest = store.put(&big).await.unwrap();

        let dest = dir.path().join("materialized");
        store.get_to_path(&digest, &dest).await.unwrap();
        assert!(!std::fs::symlink_metadata(&dest).unwrap().is_symlink());
        assert_eq!(std::fs::read(&dest).unwrap(), big);
    }

    #[tokio::test]
    async fn get_to_path_symlinks_uncompressed() {
        let (dir, store) = temp_store(CompressionPolicy::default());
        let digest = store.put(b"linked").await.unwrap();

        let dest = dir.path().join("link");
        store.get_to_path(&digest, &dest).await.unwrap();
        assert!(std::fs::symlink_metadata(&dest).unwrap().is_symlink());
        assert_eq!(std::fs::read(&dest).unwrap(), b"linked");
    }

    #[tokio::test]
    async fn put_from_path_matches_put() {
        let (dir, store) = temp_store(CompressionPolicy::disabled());
        let src = dir.path().join("source.txt");
        std::fs::write(&src, b"file contents").unwrap();

        let from_path = store.put_from_path(&src).await.unwrap();
        let from_bytes = store.put(b"file contents").await.unwrap();
        assert_eq!(from_path, from_bytes);
    }

    #[tokio::test]
    async fn integrity_mismatch_is_detected() {
        let (_dir, store) = temp_store(CompressionPolicy::disabled());
        let digest = store.put(b"trust me").await.unwrap();

        // Corrupt the stored bytes behind the store's back
        std::fs::write(store.root().join(&digest), b"tampered").unwrap();

        match store.get(&digest).await {
            Err(Error::Integrity { .. }) => {}
            other => panic!("expected integrity error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_digest_is_a_hard_error() {
        let (_dir, store) = temp_store(CompressionPolicy::default());
        let absent = "0".repeat(40);
        assert!(matches!(
            store.get(&absent).await,
            Err(Error::MissingDigest(_))
        ));
    }

    #[tokio::test]
    async fn remove_and_clear() {
        let (_dir, store) = temp_store(CompressionPolicy::default());
        let d1 = store.put(b"one").await.unwrap();
        let _d2 = store.put(b"two").await.unwrap();

        store.remove(&d1).await.unwrap();
        assert!(!store.exists(&d1));

        store.clear().await.unwrap();
        assert_eq!(store.stats().await.unwrap().entries, 0);
    }

    #[test]
    fn malformed_digest_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Store::open(dir.path(), CompressionPolicy::default(), false).unwrap();
        assert!(!store.exists(&"../../etc/passwd".to_string()));
    }
}
