//! Persistent dependency-tracked compilation cache.
//!
//! A single-file SQLite database maps a composite hash of (source digest,
//! ordered dependency digests, compile command template, extra flags, cache
//! version) to the produced artifact digest and its compile log. Any change
//! to any input produces a different key, which is the whole invalidation
//! story; there is no TTL.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// The key-lock table: shared with every outstanding [`KeyLock`] so the
/// guard can reclaim its slot on drop.
type KeyLockMap = Arc<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>>;

use crate::error::Result;
use crate::store::{Store, hash_bytes};
use crate::types::Digest;

/// Bumped whenever key semantics or the record schema change.
pub const CACHE_VERSION: i64 = 3;

/// Canonical composite key for one compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub source_digest: Digest,
    /// Dependency digests, sorted for a stable representation
    pub dep_digests: Vec<Digest>,
    /// The fully-resolved compile command sequence
    pub compile_commands: Vec<Vec<String>>,
    pub extra_flags: Vec<String>,
}

impl CacheKey {
    pub fn new(
        source_digest: Digest,
        mut dep_digests: Vec<Digest>,
        compile_commands: Vec<Vec<String>>,
        extra_flags: Vec<String>,
    ) -> Self {
        dep_digests.sort();
        Self {
            source_digest,
            dep_digests,
            compile_commands,
            extra_flags,
        }
    }

    /// Hash of the canonical representation, including the cache version.
    pub fn id(&self) -> String {
        let mut canonical = String::new();
        canonical.push_str(&self.source_digest);
        canonical.push('\n');
        for dep in &self.dep_digests {
            canonical.push_str(dep);
            canonical.push('\x1f');
        }
        canonical.push('\n');
        for command in &self.compile_commands {
            for token in command {
                canonical.push_str(token);
                canonical.push('\x1f');
            }
            canonical.push('\x1e');
        }
        canonical.push('\n');
        for flag in &self.extra_flags {
            canonical.push_str(flag);
            canonical.push('\x1f');
        }
        canonical.push('\n');
        canonical.push_str(&CACHE_VERSION.to_string());
        hash_bytes(canonical.as_bytes())
    }
}

/// What a cache hit hands back: the artifact plus the original compile log,
/// reused verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRecord {
    pub artifact_digest: Digest,
    pub compile_log: String,
    /// Serialized RunLog of the compiling sandbox invocation
    pub sandbox_meta: String,
    pub stored_at: DateTime<Utc>,
}

/// The dependency cache database.
pub struct DepCache {
    pool: SqlitePool,
    locks: KeyLockMap,
    /// Keeps the scratch directory alive for transient caches
    _scratch: Option<tempfile::TempDir>,
}

/// Held for the duration of one compilation of one cache key. Dropping it
/// releases the key and removes the slot from the table when nobody else
/// holds or awaits it, so the table stays bounded by in-flight
/// compilations rather than growing with every key ever seen.
pub struct KeyLock {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: KeyLockMap,
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        // Release the key mutex first so a queued waiter keeps the slot's
        // refcount above one and survives the cleanup below.
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = locks.get(&self.key) {
            // Only the table itself still references the mutex: no
            // holder, no waiter
            if Arc::strong_count(slot) == 1 {
                locks.remove(&self.key);
            }
        }
    }
}

impl DepCache {
    /// Open (creating if needed) the cache database at `path`, purging any
    /// records written under a different cache version.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let cache = Self {
            pool,
            locks: Arc::new(std::sync::Mutex::new(HashMap::new())),
            _scratch: None,
        };
        cache.migrate().await?;
        cache.purge_stale_versions().await?;
        Ok(cache)
    }

    /// Open a throwaway cache in a scratch directory, discarded on drop.
    /// Used for sanitized builds and other contexts that must not populate
    /// the persistent cache.
    pub async fn open_transient() -> Result<Self> {
        let scratch = tempfile::Builder::new()
            .prefix("rbx-depcache-")
            .tempdir()
            .map_err(|e| crate::Error::io("rbx-depcache", e))?;
        let mut cache = Self::open(&scratch.path().join("deps.db")).await?;
        cache._scratch = Some(scratch);
        Ok(cache)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                cache_key       TEXT PRIMARY KEY,
                artifact_digest TEXT NOT NULL,
                compile_log     TEXT NOT NULL,
                sandbox_meta    TEXT NOT NULL,
                cache_version   INTEGER NOT NULL,
                stored_at       TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drop records from other cache versions. Key hashing already keeps
    /// them unreachable; this reclaims the rows.
    async fn purge_stale_versions(&self) -> Result<()> {
        let purged = sqlx::query("DELETE FROM records WHERE cache_version != ?")
            .bind(CACHE_VERSION)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if purged > 0 {
            tracing::info!(purged, "Purged dependency-cache records from older versions");
        }
        Ok(())
    }

    /// Look up a record, lazily deleting it when its artifact has vanished
    /// from the store.
    pub async fn lookup(&self, key_id: &str, store: &Store) -> Result<Option<CacheRecord>> {
        let row = sqlx::query(
            "SELECT artifact_digest, compile_log, sandbox_meta, stored_at \
             FROM records WHERE cache_key = ?",
        )
        .bind(key_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let record = CacheRecord {
            artifact_digest: row.get::<String, _>("artifact_digest"),
            compile_log: row.get::<String, _>("compile_log"),
            sandbox_meta: row.get::<String, _>("sandbox_meta"),
            stored_at: row
                .get::<String, _>("stored_at")
                .parse()
                .unwrap_or_else(|_| Utc::now()),
        };

        if !store.exists(&record.artifact_digest) {
            tracing::warn!(
                key = %key_id,
                artifact = %record.artifact_digest,
                "Cached artifact missing from store, invalidating record"
            );
            self.remove(key_id).await?;
            return Ok(None);
        }

        Ok(Some(record))
    }

    /// Atomic insert-or-replace of a record under the current version.
    pub async fn put(&self, key_id: &str, record: &CacheRecord) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO records \
             (cache_key, artifact_digest, compile_log, sandbox_meta, cache_version, stored_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(key_id)
        .bind(&record.artifact_digest)
        .bind(&record.compile_log)
        .bind(&record.sandbox_meta)
        .bind(CACHE_VERSION)
        .bind(record.stored_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove(&self, key_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM records WHERE cache_key = ?")
            .bind(key_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove every record.
    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM records")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Acquire the per-key lock serializing concurrent compilations of the
    /// same key. The loser of the race re-checks the cache and finds the
    /// winner's record. The returned guard reclaims the key's slot on drop
    /// once no other task holds or awaits it.
    pub async fn lock_key(&self, key_id: &str) -> KeyLock {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(
                locks
                    .entry(key_id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let guard = lock.lock_owned().await;
        KeyLock {
            key: key_id.to_string(),
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Number of key slots currently in the lock table.
    #[cfg(test)]
    fn live_key_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CompressionPolicy;

    async fn temp_cache() -> (tempfile::TempDir, DepCache, Store) {
        let dir = tempfile::tempdir().unwrap();
        let cache = DepCache::open(&dir.path().join("deps.db")).await.unwrap();
        let store = Store::open(
            dir.path().join("store"),
            CompressionPolicy::default(),
            false,
        )
        .unwrap();
        (dir, cache, store)
    }

    fn sample_key(flags: &[&str]) -> CacheKey {
        CacheKey::new(
            "a".repeat(40),
            vec!["b".repeat(40), "c".repeat(40)],
            vec![vec!["g++".into(), "-O2".into()]],
            flags.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn key_id_is_stable_under_dep_reordering() {
        let k1 = CacheKey::new(
            "a".repeat(40),
            vec!["b".repeat(40), "c".repeat(40)],
            vec![],
            vec![],
        );
        let k2 = CacheKey::new(
            "a".repeat(40),
            vec!["c".repeat(40), "b".repeat(40)],
            vec![],
            vec![],
        );
        assert_eq!(k1.id(), k2.id());
    }

    #[test]
    fn key_id_changes_with_flags() {
        assert_ne!(sample_key(&[]).id(), sample_key(&["-DDEBUG"]).id());
    }

    #[tokio::test]
    async fn put_lookup_roundtrip() {
        let (_dir, cache, store) = temp_cache().await;
        let artifact = store.put(b"binary bits").await.unwrap();

        let record = CacheRecord {
            artifact_digest: artifact,
            compile_log: "warnings: none".into(),
            sandbox_meta: "{}".into(),
            stored_at: Utc::now(),
        };
        let key = sample_key(&[]).id();
        cache.put(&key, &record).await.unwrap();

        let hit = cache.lookup(&key, &store).await.unwrap().unwrap();
        assert_eq!(hit.artifact_digest, record.artifact_digest);
        assert_eq!(hit.compile_log, "warnings: none");
    }

    #[tokio::test]
    async fn lookup_invalidates_when_artifact_missing() {
        let (_dir, cache, store) = temp_cache().await;
        let record = CacheRecord {
            artifact_digest: "f".repeat(40),
            compile_log: String::new(),
            sandbox_meta: "{}".into(),
            stored_at: Utc::now(),
        };
        let key = sample_key(&[]).id();
        cache.put(&key, &record).await.unwrap();

        assert!(cache.lookup(&key, &store).await.unwrap().is_none());
        // The stale row is gone for good
        assert!(cache.lookup(&key, &store).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn replace_is_atomic() {
        let (_dir, cache, store) = temp_cache().await;
        let a1 = store.put(b"v1").await.unwrap();
        let a2 = store.put(b"v2").await.unwrap();
        let key = sample_key(&[]).id();

        for artifact in [&a1, &a2] {
            cache
                .put(
                    &key,
                    &CacheRecord {
                        artifact_digest: artifact.clone(),
                        compile_log: String::new(),
                        sandbox_meta: "{}".into(),
                        stored_at: Utc::now(),
                    },
                )
                .await
                .unwrap();
        }

        let hit = cache.lookup(&key, &store).await.unwrap().unwrap();
        assert_eq!(hit.artifact_digest, a2);
    }

    #[tokio::test]
    async fn transient_cache_works_in_isolation() {
        let cache = DepCache::open_transient().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(
            dir.path().join("store"),
            CompressionPolicy::default(),
            false,
        )
        .unwrap();
        let key = sample_key(&["-fsanitize=address"]).id();
        assert!(cache.lookup(&key, &store).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn key_lock_serializes() {
        let (_dir, cache, _store) = temp_cache().await;
        let key = sample_key(&[]).id();
        let guard = cache.lock_key(&key).await;
        // A second acquisition must wait until the first guard drops
        let pending = {
            let key = key.clone();
            let fut = cache.lock_key(&key);
            tokio::pin!(fut);
            futures_poll_once(&mut fut).await
        };
        assert!(pending.is_none());
        drop(guard);
        let _second = cache.lock_key(&key).await;
    }

    #[tokio::test]
    async fn key_lock_slots_are_reclaimed() {
        let (_dir, cache, _store) = temp_cache().await;
        let key = sample_key(&[]).id();

        let guard = cache.lock_key(&key).await;
        assert_eq!(cache.live_key_locks(), 1);
        drop(guard);
        assert_eq!(cache.live_key_locks(), 0);

        // A queued waiter keeps the slot alive across the holder's drop
        let guard = cache.lock_key(&key).await;
        let waiter = cache.lock_key(&key);
        tokio::pin!(waiter);
        assert!(futures_poll_once(&mut waiter).await.is_none());
        drop(guard);
        assert_eq!(cache.live_key_locks(), 1);

        let handed_over = futures_poll_once(&mut waiter)
            .await
            .expect("lock should hand over to the waiter");
        drop(handed_over);
        assert_eq!(cache.live_key_locks(), 0);

        // Distinct keys never pile up after their compilations finish
        for flags in [&["-O2"][..], &["-O3"][..], &["-DX"][..]] {
            let id = sample_key(flags).id();
            drop(cache.lock_key(&id).await);
        }
        assert_eq!(cache.live_key_locks(), 0);
    }

    /// Poll a future exactly once, returning its output if ready.
    async fn futures_poll_once<F: std::future::Future + Unpin>(fut: &mut F) -> Option<F::Output> {
        use std::task::Poll;
        std::future::poll_fn(|cx| {
            match std::pin::Pin::new(&mut *fut).poll(cx) {
                Poll::Ready(v) => Poll::Ready(Some(v)),
                Poll::Pending => Poll::Ready(None),
            }
        })
        .await
    }
}
