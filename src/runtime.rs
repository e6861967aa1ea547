//! Explicit runtime context threaded through every core call.
//!
//! Owns the content store, the dependency cache, the language registry and
//! the top-level cancellation source. There are no process-wide mutables;
//! collaborators construct one `Runtime` and pass it down.

use std::env;
use std::path::{Path, PathBuf};

use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::checker::PreparedChecker;
use crate::depcache::DepCache;
use crate::error::{Error, IoContext, Result};
use crate::languages::{Language, Registry};
use crate::store::{CompressionPolicy, Store};
use crate::types::{CodeItem, extension_of};

/// Construction options for a [`Runtime`].
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Cache root holding `store/`, `deps.db` and `runs/`
    pub cache_root: PathBuf,
    pub compression: CompressionPolicy,
    pub check_integrity: bool,
    /// Applied to every effective time limit
    pub time_multiplier: f64,
    /// Use a throwaway dependency cache (sanitized and one-off builds)
    pub transient_cache: bool,
    pub languages: Registry,
}

impl RuntimeOptions {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            compression: CompressionPolicy::default(),
            check_integrity: false,
            time_multiplier: 1.0,
            transient_cache: false,
            languages: Registry::builtin(),
        }
    }

    /// Read the environment overrides: `RBX_CACHE_DIR` for the cache
    /// location, `RBX_TIME_MULTIPLIER` for a global time-limit factor.
    pub fn from_env() -> Self {
        let cache_root = env::var("RBX_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".rbx/cache"));
        let time_multiplier = env::var("RBX_TIME_MULTIPLIER")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|m| *m > 0.0)
            .unwrap_or(1.0);
        Self {
            time_multiplier,
            ..Self::new(cache_root)
        }
    }

    pub fn with_languages(mut self, languages: Registry) -> Self {
        self.languages = languages;
        self
    }

    pub fn with_transient_cache(mut self) -> Self {
        self.transient_cache = true;
        self
    }
}

/// The grading core's context object.
pub struct Runtime {
    store: Store,
    cache: DepCache,
    languages: Registry,
    time_multiplier: f64,
    cancel: CancellationToken,
    runs_root: PathBuf,
    /// Built-in word-compare checker, compiled once per process
    pub(crate) builtin_checker: OnceCell<PreparedChecker>,
}

impl Runtime {
    /// Open the store and dependency cache under the configured root.
    pub async fn open(options: RuntimeOptions) -> Result<Self> {
        let cache_root = &options.cache_root;
        tokio::fs::create_dir_all(cache_root)
            .await
            .path_ctx(cache_root)?;

        let store = Store::open(
            cache_root.join("store"),
            options.compression,
            options.check_integrity,
        )?;
        let cache = if options.transient_cache {
            DepCache::open_transient().await?
        } else {
            DepCache::open(&cache_root.join("deps.db")).await?
        };

        let runs_root = cache_root.join("runs");
        tokio::fs::create_dir_all(&runs_root)
            .await
            .path_ctx(&runs_root)?;

        tracing::debug!(cache_root = %cache_root.display(), "Runtime opened");

        Ok(Self {
            store,
            cache,
            languages: options.languages,
            time_multiplier: options.time_multiplier,
            cancel: CancellationToken::new(),
            runs_root,
            builtin_checker: OnceCell::new(),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn dep_cache(&self) -> &DepCache {
        &self.cache
    }

    pub fn languages(&self) -> &Registry {
        &self.languages
    }

    pub fn time_multiplier(&self) -> f64 {
        self.time_multiplier
    }

    /// Token observed by every sandbox and coordinator spawned from this
    /// runtime.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Propagate cancellation to everything in flight.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolve the language of a code item: explicit tag first, then the
    /// first extension match in registry order.
    pub fn resolve_language(&self, item: &CodeItem) -> Result<&Language> {
        if let Some(tag) = &item.language {
            return self
                .languages
                .by_name(tag)
                .ok_or_else(|| Error::UnknownLanguage(tag.clone()));
        }
        let ext = extension_of(&item.path)
            .ok_or_else(|| Error::UnknownLanguage(item.path.display().to_string()))?;
        self.languages
            .by_extension(&ext)
            .ok_or_else(|| Error::UnknownLanguage(item.path.display().to_string()))
    }

    /// Fresh per-evaluation artifact directory under `runs/`.
    pub async fn new_run_dir(&self) -> Result<PathBuf> {
        let dir = self.runs_root.join(uuid::Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&dir).await.path_ctx(&dir)?;
        Ok(dir)
    }

    pub fn runs_root(&self) -> &Path {
        &self.runs_root
    }
}
