//! Artifact-cache index repository. The cache service in `distsmith-cache`
//! owns the policy (stale repair, eviction); this layer owns the rows.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params};

use distsmith_types::{ArtifactCacheEntry, new_id};

use crate::store::Store;
use crate::util;

const ENTRY_COLS: &str = "id, source_id, version, checksum, cache_path, size_bytes, \
     content_type, resolved_url, created_at, last_used_at, use_count";

pub struct CacheEntryRepo<'a> {
    store: &'a Store,
}

impl<'a> CacheEntryRepo<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Insert or replace the entry for `(source_id, version)`.
    pub fn upsert(
        &self,
        source_id: &str,
        version: &str,
        checksum: &str,
        cache_path: &str,
        size_bytes: u64,
        content_type: &str,
        resolved_url: &str,
    ) -> Result<ArtifactCacheEntry> {
        self.store.with_tx(|tx| {
            let now = util::ts(Utc::now());
            tx.execute(
                "INSERT INTO artifact_cache
                    (id, source_id, version, checksum, cache_path, size_bytes,
                     content_type, resolved_url, created_at, last_used_at, use_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9, 0)
                 ON CONFLICT (source_id, version) DO UPDATE SET
                    checksum     = excluded.checksum,
                    cache_path   = excluded.cache_path,
                    size_bytes   = excluded.size_bytes,
                    content_type = excluded.content_type,
                    resolved_url = excluded.resolved_url,
                    last_used_at = excluded.last_used_at",
                params![
                    new_id(),
                    source_id,
                    version,
                    checksum,
                    cache_path,
                    size_bytes as i64,
                    content_type,
                    resolved_url,
                    now,
                ],
            )
            .with_context(|| format!("failed to upsert cache entry {}/{}", source_id, version))?;

            let raw = tx
                .query_row(
                    &format!(
                        "SELECT {} FROM artifact_cache WHERE source_id = ?1 AND version = ?2",
                        ENTRY_COLS
                    ),
                    params![source_id, version],
                    read_row,
                )
                .context("failed to re-read cache entry")?;
            raw.into_entry()
        })
    }

    pub fn get(&self, source_id: &str, version: &str) -> Result<Option<ArtifactCacheEntry>> {
        self.store.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM artifact_cache WHERE source_id = ?1 AND version = ?2",
                        ENTRY_COLS
                    ),
                    params![source_id, version],
                    read_row,
                )
                .optional()
                .context("failed to read cache entry")?;
            raw.map(RawEntry::into_entry).transpose()
        })
    }

    /// Refresh LRU position and bump the hit counter.
    pub fn touch(&self, id: &str) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE artifact_cache SET last_used_at = ?2, use_count = use_count + 1
                 WHERE id = ?1",
                params![id, util::ts(Utc::now())],
            )
            .with_context(|| format!("failed to touch cache entry {}", id))?;
            Ok(())
        })
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute("DELETE FROM artifact_cache WHERE id = ?1", params![id])
                .with_context(|| format!("failed to delete cache entry {}", id))?;
            Ok(())
        })
    }

    pub fn total_size(&self) -> Result<u64> {
        self.store.with_conn(|conn| {
            let total: i64 = conn
                .query_row(
                    "SELECT COALESCE(SUM(size_bytes), 0) FROM artifact_cache",
                    [],
                    |row| row.get(0),
                )
                .context("failed to sum cache size")?;
            Ok(util::u64_col(total))
        })
    }

    /// The `limit` least-recently-used entries, eviction candidates first.
    pub fn least_recently_used(&self, limit: u32) -> Result<Vec<ArtifactCacheEntry>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM artifact_cache ORDER BY last_used_at ASC LIMIT ?1",
                    ENTRY_COLS
                ))
                .context("failed to prepare LRU query")?;
            let rows = stmt
                .query_map(params![limit], read_row)
                .context("failed to list LRU entries")?;
            let mut entries = Vec::new();
            for raw in rows {
                entries.push(raw.context("failed to read cache row")?.into_entry()?);
            }
            Ok(entries)
        })
    }

    pub fn list_all(&self) -> Result<Vec<ArtifactCacheEntry>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM artifact_cache ORDER BY last_used_at DESC",
                    ENTRY_COLS
                ))
                .context("failed to prepare cache list")?;
            let rows = stmt.query_map([], read_row).context("failed to list cache")?;
            let mut entries = Vec::new();
            for raw in rows {
                entries.push(raw.context("failed to read cache row")?.into_entry()?);
            }
            Ok(entries)
        })
    }
}

struct RawEntry {
    id: String,
    source_id: String,
    version: String,
    checksum: String,
    cache_path: String,
    size_bytes: i64,
    content_type: String,
    resolved_url: String,
    created_at: String,
    last_used_at: String,
    use_count: i64,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok(RawEntry {
        id: row.get(0)?,
        source_id: row.get(1)?,
        version: row.get(2)?,
        checksum: row.get(3)?,
        cache_path: row.get(4)?,
        size_bytes: row.get(5)?,
        content_type: row.get(6)?,
        resolved_url: row.get(7)?,
        created_at: row.get(8)?,
        last_used_at: row.get(9)?,
        use_count: row.get(10)?,
    })
}

impl RawEntry {
    fn into_entry(self) -> Result<ArtifactCacheEntry> {
        Ok(ArtifactCacheEntry {
            size_bytes: util::u64_col(self.size_bytes),
            use_count: util::u64_col(self.use_count),
            created_at: util::parse_ts(&self.created_at)?,
            last_used_at: util::parse_ts(&self.last_used_at)?,
            id: self.id,
            source_id: self.source_id,
            version: self.version,
            checksum: self.checksum,
            cache_path: self.cache_path,
            content_type: self.content_type,
            resolved_url: self.resolved_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upsert(store: &Store, source: &str, version: &str, size: u64) -> ArtifactCacheEntry {
        store
            .cache_entries()
            .upsert(
                source,
                version,
                "checksum",
                &format!("cache/artifacts/{}/{}/a.tar.gz", source, version),
                size,
                "application/gzip",
                "https://upstream.example/a.tar.gz",
            )
            .expect("upsert")
    }

    #[test]
    fn upsert_and_get_round_trip() {
        let store = Store::open_in_memory().expect("open");
        let entry = upsert(&store, "s1", "1.0", 100);
        assert_eq!(entry.use_count, 0);

        let fetched = store
            .cache_entries()
            .get("s1", "1.0")
            .expect("get")
            .expect("present");
        assert_eq!(fetched.id, entry.id);
        assert_eq!(fetched.size_bytes, 100);
    }

    #[test]
    fn upsert_same_key_does_not_duplicate() {
        let store = Store::open_in_memory().expect("open");
        upsert(&store, "s1", "1.0", 100);
        upsert(&store, "s1", "1.0", 250);

        let entries = store.cache_entries().list_all().expect("list");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].size_bytes, 250);
        assert_eq!(store.cache_entries().total_size().expect("total"), 250);
    }

    #[test]
    fn touch_moves_entry_to_back_of_lru() {
        let store = Store::open_in_memory().expect("open");
        let a = upsert(&store, "s1", "1.0", 100);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let _b = upsert(&store, "s1", "2.0", 100);
        std::thread::sleep(std::time::Duration::from_millis(5));

        store.cache_entries().touch(&a.id).expect("touch");

        let lru = store.cache_entries().least_recently_used(1).expect("lru");
        assert_eq!(lru[0].version, "2.0");

        let touched = store
            .cache_entries()
            .get("s1", "1.0")
            .expect("get")
            .expect("present");
        assert_eq!(touched.use_count, 1);
    }

    #[test]
    fn delete_and_total_size() {
        let store = Store::open_in_memory().expect("open");
        let a = upsert(&store, "s1", "1.0", 700);
        upsert(&store, "s1", "2.0", 600);
        assert_eq!(store.cache_entries().total_size().expect("total"), 1300);

        store.cache_entries().delete(&a.id).expect("delete");
        assert_eq!(store.cache_entries().total_size().expect("total"), 600);
        assert!(store.cache_entries().get("s1", "1.0").expect("get").is_none());
    }
}
