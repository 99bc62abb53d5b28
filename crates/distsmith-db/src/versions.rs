//! Discovered-version repository. Discovery writes, everything else reads.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};

use distsmith_types::{SourceType, SourceVersion, VersionRule, VersionType, new_id};
use distsmith_version::{compare_versions, is_prerelease};

use crate::store::Store;
use crate::util;

const VERSION_COLS: &str = "id, source_id, source_type, version, version_type, release_date, \
     download_url, checksum, checksum_type, file_size, discovered_at";

/// One version as reported by a discovery strategy, before it is stored.
#[derive(Debug, Clone, Default)]
pub struct DiscoveredVersion {
    pub version: String,
    pub version_type: VersionType,
    pub release_date: Option<DateTime<Utc>>,
    pub download_url: Option<String>,
    pub checksum: Option<String>,
    pub checksum_type: Option<String>,
    pub file_size: Option<u64>,
}

pub struct VersionRepo<'a> {
    store: &'a Store,
}

impl<'a> VersionRepo<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Upsert a discovery batch under `(source_id, version)`. Returns
    /// `(found, new)`: how many rows the batch touched and how many were not
    /// previously known.
    pub fn upsert_bulk(
        &self,
        source_id: &str,
        source_type: SourceType,
        versions: &[DiscoveredVersion],
    ) -> Result<(u64, u64)> {
        self.store.with_tx(|tx| {
            let mut new_count = 0u64;
            for v in versions {
                if v.version.trim().is_empty() {
                    continue;
                }
                let exists: Option<i64> = tx
                    .query_row(
                        "SELECT 1 FROM source_versions WHERE source_id = ?1 AND version = ?2",
                        params![source_id, v.version],
                        |row| row.get(0),
                    )
                    .optional()
                    .context("failed to probe version row")?;
                if exists.is_none() {
                    new_count += 1;
                }

                tx.execute(
                    "INSERT INTO source_versions
                        (id, source_id, source_type, version, version_type, release_date,
                         download_url, checksum, checksum_type, file_size, discovered_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                     ON CONFLICT (source_id, version) DO UPDATE SET
                        version_type  = excluded.version_type,
                        release_date  = COALESCE(excluded.release_date, release_date),
                        download_url  = COALESCE(excluded.download_url, download_url),
                        checksum      = COALESCE(excluded.checksum, checksum),
                        checksum_type = COALESCE(excluded.checksum_type, checksum_type),
                        file_size     = COALESCE(excluded.file_size, file_size),
                        discovered_at = excluded.discovered_at",
                    params![
                        new_id(),
                        source_id,
                        source_type.to_string(),
                        v.version,
                        v.version_type.to_string(),
                        util::ts_opt(v.release_date),
                        v.download_url,
                        v.checksum,
                        v.checksum_type,
                        v.file_size.map(|s| s as i64),
                        util::ts(Utc::now()),
                    ],
                )
                .with_context(|| format!("failed to upsert version {}", v.version))?;
            }
            Ok((versions.len() as u64, new_count))
        })
    }

    pub fn get(&self, source_id: &str, version: &str) -> Result<Option<SourceVersion>> {
        self.store.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM source_versions WHERE source_id = ?1 AND version = ?2",
                        VERSION_COLS
                    ),
                    params![source_id, version],
                    read_row,
                )
                .optional()
                .with_context(|| format!("failed to read version {}", version))?;
            raw.map(RawVersion::into_version).transpose()
        })
    }

    /// All versions of a source, newest first by the discovery comparator.
    pub fn list_for_source(&self, source_id: &str) -> Result<Vec<SourceVersion>> {
        let mut versions = self.store.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM source_versions WHERE source_id = ?1",
                    VERSION_COLS
                ))
                .context("failed to prepare version list")?;
            let rows = stmt
                .query_map(params![source_id], read_row)
                .context("failed to list versions")?;
            let mut versions = Vec::new();
            for raw in rows {
                versions.push(raw.context("failed to read version row")?.into_version()?);
            }
            Ok(versions)
        })?;
        versions.sort_by(|a, b| compare_versions(&b.version, &a.version));
        Ok(versions)
    }

    /// Newest version satisfying a default-version rule. `Pinned` never
    /// resolves here (the pin lives on the component).
    pub fn newest_matching(
        &self,
        source_id: &str,
        rule: VersionRule,
    ) -> Result<Option<SourceVersion>> {
        let versions = self.list_for_source(source_id)?;
        let found = match rule {
            VersionRule::Pinned => None,
            VersionRule::LatestStable => versions.into_iter().find(|v| {
                matches!(v.version_type, VersionType::Stable | VersionType::Longterm)
                    && !is_prerelease(&v.version)
            }),
            VersionRule::LatestLts => versions
                .into_iter()
                .find(|v| v.version_type == VersionType::Longterm && !is_prerelease(&v.version)),
        };
        Ok(found)
    }

    pub fn count_for_source(&self, source_id: &str) -> Result<u64> {
        self.store.with_conn(|conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM source_versions WHERE source_id = ?1",
                    params![source_id],
                    |row| row.get(0),
                )
                .context("failed to count versions")?;
            Ok(util::u64_col(count))
        })
    }
}

struct RawVersion {
    id: String,
    source_id: String,
    source_type: String,
    version: String,
    version_type: String,
    release_date: Option<String>,
    download_url: Option<String>,
    checksum: Option<String>,
    checksum_type: Option<String>,
    file_size: Option<i64>,
    discovered_at: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawVersion> {
    Ok(RawVersion {
        id: row.get(0)?,
        source_id: row.get(1)?,
        source_type: row.get(2)?,
        version: row.get(3)?,
        version_type: row.get(4)?,
        release_date: row.get(5)?,
        download_url: row.get(6)?,
        checksum: row.get(7)?,
        checksum_type: row.get(8)?,
        file_size: row.get(9)?,
        discovered_at: row.get(10)?,
    })
}

impl RawVersion {
    fn into_version(self) -> Result<SourceVersion> {
        Ok(SourceVersion {
            source_type: self.source_type.parse()?,
            version_type: self.version_type.parse()?,
            release_date: util::parse_ts_opt(self.release_date)?,
            file_size: self.file_size.map(util::u64_col),
            discovered_at: util::parse_ts(&self.discovered_at)?,
            id: self.id,
            source_id: self.source_id,
            version: self.version,
            download_url: self.download_url,
            checksum: self.checksum,
            checksum_type: self.checksum_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::NewUpstreamSource;

    fn seeded_source(store: &Store) -> String {
        store
            .sources()
            .create(NewUpstreamSource {
                name: "test-source".to_string(),
                url: "https://upstream.example".to_string(),
                owner_id: Some("u1".to_string()),
                ..Default::default()
            })
            .expect("create source")
            .id
    }

    fn v(version: &str, version_type: VersionType) -> DiscoveredVersion {
        DiscoveredVersion {
            version: version.to_string(),
            version_type,
            ..Default::default()
        }
    }

    #[test]
    fn upsert_counts_new_rows_once() {
        let store = Store::open_in_memory().expect("open");
        let source_id = seeded_source(&store);

        let batch = vec![
            v("6.12.4", VersionType::Longterm),
            v("6.12.3", VersionType::Longterm),
        ];
        let (found, new) = store
            .versions()
            .upsert_bulk(&source_id, SourceType::Default, &batch)
            .expect("upsert");
        assert_eq!((found, new), (2, 2));

        // Re-running the same batch touches the rows but adds nothing.
        let (found, new) = store
            .versions()
            .upsert_bulk(&source_id, SourceType::Default, &batch)
            .expect("upsert");
        assert_eq!((found, new), (2, 0));
        assert_eq!(store.versions().count_for_source(&source_id).expect("count"), 2);
    }

    #[test]
    fn upsert_keeps_existing_metadata_when_update_is_sparse() {
        let store = Store::open_in_memory().expect("open");
        let source_id = seeded_source(&store);

        let mut first = v("1.0.0", VersionType::Stable);
        first.download_url = Some("https://upstream.example/1.0.0.tar.gz".to_string());
        first.file_size = Some(1024);
        store
            .versions()
            .upsert_bulk(&source_id, SourceType::Default, &[first])
            .expect("upsert");

        // A later sparse sighting (tags API, no metadata) must not erase it.
        store
            .versions()
            .upsert_bulk(&source_id, SourceType::Default, &[v("1.0.0", VersionType::Stable)])
            .expect("upsert");

        let row = store
            .versions()
            .get(&source_id, "1.0.0")
            .expect("get")
            .expect("present");
        assert_eq!(
            row.download_url.as_deref(),
            Some("https://upstream.example/1.0.0.tar.gz")
        );
        assert_eq!(row.file_size, Some(1024));
    }

    #[test]
    fn list_is_descending_by_comparator() {
        let store = Store::open_in_memory().expect("open");
        let source_id = seeded_source(&store);
        store
            .versions()
            .upsert_bulk(
                &source_id,
                SourceType::Default,
                &[
                    v("6.6.63", VersionType::Longterm),
                    v("6.13-rc1", VersionType::Mainline),
                    v("6.12.4", VersionType::Longterm),
                    v("6.13", VersionType::Stable),
                ],
            )
            .expect("upsert");

        let versions: Vec<String> = store
            .versions()
            .list_for_source(&source_id)
            .expect("list")
            .into_iter()
            .map(|v| v.version)
            .collect();
        assert_eq!(versions, vec!["6.13", "6.13-rc1", "6.12.4", "6.6.63"]);
    }

    #[test]
    fn newest_matching_respects_rules() {
        let store = Store::open_in_memory().expect("open");
        let source_id = seeded_source(&store);
        store
            .versions()
            .upsert_bulk(
                &source_id,
                SourceType::Default,
                &[
                    v("6.13-rc1", VersionType::Mainline),
                    v("6.13", VersionType::Stable),
                    v("6.12.4", VersionType::Longterm),
                ],
            )
            .expect("upsert");

        let stable = store
            .versions()
            .newest_matching(&source_id, VersionRule::LatestStable)
            .expect("resolve")
            .expect("found");
        assert_eq!(stable.version, "6.13");

        let lts = store
            .versions()
            .newest_matching(&source_id, VersionRule::LatestLts)
            .expect("resolve")
            .expect("found");
        assert_eq!(lts.version, "6.12.4");

        assert!(store
            .versions()
            .newest_matching(&source_id, VersionRule::Pinned)
            .expect("resolve")
            .is_none());
    }

    #[test]
    fn empty_versions_are_skipped() {
        let store = Store::open_in_memory().expect("open");
        let source_id = seeded_source(&store);
        let (_, new) = store
            .versions()
            .upsert_bulk(
                &source_id,
                SourceType::Default,
                &[v("", VersionType::Stable), v("1.0", VersionType::Stable)],
            )
            .expect("upsert");
        assert_eq!(new, 1);
    }
}
