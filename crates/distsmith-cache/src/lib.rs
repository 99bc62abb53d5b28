//! Shared content-addressed artifact cache.
//!
//! The cache maps `(source_id, version)` to an object under
//! `cache/artifacts/{source_id}/{version}/{filename}` on the same storage
//! backend the distributions use, with the index kept in the state store.
//! A cache hit for a new build is one server-side copy (a hard link on
//! local filesystems) instead of a download; eviction is LRU under a size
//! cap.
//!
//! Lookup failures never fail a build: callers degrade to a fresh download.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use distsmith_db::Store;
use distsmith_storage::ObjectStorage;
use distsmith_types::ArtifactCacheEntry;

const GIB: u64 = 1024 * 1024 * 1024;

/// Entries removed per eviction round before the size is rechecked.
const EVICTION_BATCH: u32 = 5;

/// Cache behavior knobs.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// A disabled cache is a pass-through: lookups miss, stores are no-ops.
    pub enabled: bool,
    /// Size cap in GiB; 0 means unbounded.
    pub max_size_gb: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_gb: 0,
        }
    }
}

/// The storage key an artifact is cached under.
pub fn cache_key(source_id: &str, version: &str, filename: &str) -> String {
    format!("cache/artifacts/{}/{}/{}", source_id, version, filename)
}

/// The shared artifact cache.
pub struct ArtifactCache {
    store: Arc<Store>,
    storage: Arc<dyn ObjectStorage>,
    settings: CacheSettings,
}

impl ArtifactCache {
    pub fn new(
        store: Arc<Store>,
        storage: Arc<dyn ObjectStorage>,
        settings: CacheSettings,
    ) -> Self {
        Self {
            store,
            storage,
            settings,
        }
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Find a usable entry. The index row must exist *and* the object must
    /// still be in storage; a stale row (object gone) is repaired by
    /// deletion and reported as a miss. Hits touch the LRU clock.
    pub fn lookup(&self, source_id: &str, version: &str) -> Result<Option<ArtifactCacheEntry>> {
        if !self.settings.enabled {
            return Ok(None);
        }
        let Some(entry) = self.store.cache_entries().get(source_id, version)? else {
            return Ok(None);
        };

        let object_exists = self
            .storage
            .exists(&entry.cache_path)
            .unwrap_or(false);
        if !object_exists {
            warn!(
                source_id,
                version,
                cache_path = %entry.cache_path,
                "stale cache row, object missing; repairing"
            );
            self.store.cache_entries().delete(&entry.id)?;
            return Ok(None);
        }

        self.store.cache_entries().touch(&entry.id)?;
        debug!(source_id, version, "artifact cache hit");
        self.store.cache_entries().get(source_id, version)
    }

    /// Cache a freshly downloaded artifact by server-side copy from its
    /// distribution path. An existing entry with the same checksum is only
    /// touched; a different checksum overwrites the object and row, since
    /// the cache must serve exactly what the index promises.
    #[allow(clippy::too_many_arguments)]
    pub fn store(
        &self,
        source_id: &str,
        version: &str,
        artifact_path: &str,
        checksum: &str,
        size_bytes: u64,
        content_type: &str,
        resolved_url: &str,
    ) -> Result<Option<ArtifactCacheEntry>> {
        if !self.settings.enabled {
            return Ok(None);
        }

        if let Some(existing) = self.store.cache_entries().get(source_id, version)? {
            if existing.checksum == checksum && self.storage.exists(&existing.cache_path)? {
                self.store.cache_entries().touch(&existing.id)?;
                return self.store.cache_entries().get(source_id, version);
            }
            warn!(
                source_id,
                version,
                old_checksum = %existing.checksum,
                new_checksum = %checksum,
                "cache entry conflicts with stored artifact; overwriting"
            );
            self.storage.delete(&existing.cache_path).ok();
            self.store.cache_entries().delete(&existing.id)?;
        }

        let filename = artifact_path
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or("artifact.tar.gz");
        let key = cache_key(source_id, version, filename);

        self.storage
            .copy(artifact_path, &key)
            .with_context(|| format!("failed to copy artifact into cache: {}", key))?;
        let entry = self.store.cache_entries().upsert(
            source_id,
            version,
            checksum,
            &key,
            size_bytes,
            content_type,
            resolved_url,
        )?;
        debug!(source_id, version, cache_path = %key, "artifact cached");

        self.evict()?;
        Ok(Some(entry))
    }

    /// Server-side copy of a cached artifact into a build's namespace. On a
    /// local filesystem backend this is a hard link with byte-copy fallback.
    pub fn copy_to_distribution(&self, entry: &ArtifactCacheEntry, dst_key: &str) -> Result<()> {
        self.storage
            .copy(&entry.cache_path, dst_key)
            .with_context(|| format!("failed to copy cached artifact to {}", dst_key))
    }

    /// Drop least-recently-used entries (and their objects) until the total
    /// fits the cap. A cap of 0 never evicts.
    pub fn evict(&self) -> Result<()> {
        if !self.settings.enabled || self.settings.max_size_gb == 0 {
            return Ok(());
        }
        let cap = self.settings.max_size_gb * GIB;

        while self.store.cache_entries().total_size()? > cap {
            let victims = self.store.cache_entries().least_recently_used(EVICTION_BATCH)?;
            if victims.is_empty() {
                break;
            }
            for victim in victims {
                if self.store.cache_entries().total_size()? <= cap {
                    break;
                }
                debug!(
                    source_id = %victim.source_id,
                    version = %victim.version,
                    size = victim.size_bytes,
                    "evicting cache entry"
                );
                if let Err(e) = self.storage.delete(&victim.cache_path) {
                    warn!(cache_path = %victim.cache_path, error = %format!("{:#}", e), "failed to delete evicted object");
                }
                self.store.cache_entries().delete(&victim.id)?;
            }
        }
        Ok(())
    }

    /// Current total size of the index, in bytes.
    pub fn total_size(&self) -> Result<u64> {
        self.store.cache_entries().total_size()
    }
}
