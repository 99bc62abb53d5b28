//! Version-sync job repository: one row per discovery run.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};

use distsmith_types::{SyncJob, SyncJobStatus, new_id};

use crate::store::Store;
use crate::util;

const SYNC_COLS: &str = "id, source_id, status, versions_found, versions_new, error_message, \
     created_at, started_at, completed_at";

pub struct SyncJobRepo<'a> {
    store: &'a Store,
}

impl<'a> SyncJobRepo<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn create(&self, source_id: &str) -> Result<SyncJob> {
        self.store.with_tx(|tx| {
            let id = new_id();
            tx.execute(
                "INSERT INTO sync_jobs (id, source_id, status, versions_found, versions_new,
                                        error_message, created_at, started_at, completed_at)
                 VALUES (?1, ?2, 'pending', 0, 0, NULL, ?3, NULL, NULL)",
                params![id, source_id, util::ts(Utc::now())],
            )
            .with_context(|| format!("failed to insert sync job for {}", source_id))?;
            fetch_by_id(tx, &id)?.context("sync job vanished after insert")
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<SyncJob>> {
        self.store.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {} FROM sync_jobs WHERE id = ?1", SYNC_COLS),
                    params![id],
                    read_row,
                )
                .optional()
                .with_context(|| format!("failed to read sync job {}", id))?;
            raw.map(RawSyncJob::into_job).transpose()
        })
    }

    pub fn mark_running(&self, id: &str) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE sync_jobs SET status = 'running', started_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id, util::ts(Utc::now())],
            )
            .with_context(|| format!("failed to start sync job {}", id))?;
            Ok(())
        })
    }

    pub fn mark_completed(&self, id: &str, versions_found: u64, versions_new: u64) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE sync_jobs SET status = 'completed', versions_found = ?2,
                                      versions_new = ?3, completed_at = ?4
                 WHERE id = ?1",
                params![
                    id,
                    versions_found as i64,
                    versions_new as i64,
                    util::ts(Utc::now())
                ],
            )
            .with_context(|| format!("failed to complete sync job {}", id))?;
            Ok(())
        })
    }

    pub fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE sync_jobs SET status = 'failed', error_message = ?2, completed_at = ?3
                 WHERE id = ?1",
                params![id, error, util::ts(Utc::now())],
            )
            .with_context(|| format!("failed to fail sync job {}", id))?;
            Ok(())
        })
    }

    /// Whether a sync for this source is pending or running right now.
    pub fn has_active(&self, source_id: &str) -> Result<bool> {
        self.store.with_conn(|conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sync_jobs
                     WHERE source_id = ?1 AND status IN ('pending', 'running')",
                    params![source_id],
                    |row| row.get(0),
                )
                .context("failed to probe active syncs")?;
            Ok(count > 0)
        })
    }

    /// When the source last synced successfully; drives the TTL check.
    pub fn last_success(&self, source_id: &str) -> Result<Option<DateTime<Utc>>> {
        self.store.with_conn(|conn| {
            let completed_at: Option<String> = conn
                .query_row(
                    "SELECT completed_at FROM sync_jobs
                     WHERE source_id = ?1 AND status = 'completed'
                     ORDER BY completed_at DESC LIMIT 1",
                    params![source_id],
                    |row| row.get(0),
                )
                .optional()
                .context("failed to read last sync success")?
                .flatten();
            util::parse_ts_opt(completed_at)
        })
    }

    /// Drop all but the newest `keep` runs per source.
    pub fn prune(&self, source_id: &str, keep: u32) -> Result<u64> {
        self.store.with_conn(|conn| {
            let deleted = conn
                .execute(
                    "DELETE FROM sync_jobs WHERE source_id = ?1 AND id NOT IN (
                         SELECT id FROM sync_jobs WHERE source_id = ?1
                         ORDER BY created_at DESC LIMIT ?2
                     )",
                    params![source_id, keep],
                )
                .with_context(|| format!("failed to prune sync jobs for {}", source_id))?;
            Ok(deleted as u64)
        })
    }
}

struct RawSyncJob {
    id: String,
    source_id: String,
    status: String,
    versions_found: i64,
    versions_new: i64,
    error_message: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawSyncJob> {
    Ok(RawSyncJob {
        id: row.get(0)?,
        source_id: row.get(1)?,
        status: row.get(2)?,
        versions_found: row.get(3)?,
        versions_new: row.get(4)?,
        error_message: row.get(5)?,
        created_at: row.get(6)?,
        started_at: row.get(7)?,
        completed_at: row.get(8)?,
    })
}

impl RawSyncJob {
    fn into_job(self) -> Result<SyncJob> {
        Ok(SyncJob {
            status: self.status.parse()?,
            versions_found: util::u64_col(self.versions_found),
            versions_new: util::u64_col(self.versions_new),
            created_at: util::parse_ts(&self.created_at)?,
            started_at: util::parse_ts_opt(self.started_at)?,
            completed_at: util::parse_ts_opt(self.completed_at)?,
            id: self.id,
            source_id: self.source_id,
            error_message: self.error_message,
        })
    }
}

fn fetch_by_id(tx: &rusqlite::Transaction<'_>, id: &str) -> Result<Option<SyncJob>> {
    let raw = tx
        .query_row(
            &format!("SELECT {} FROM sync_jobs WHERE id = ?1", SYNC_COLS),
            params![id],
            read_row,
        )
        .optional()
        .with_context(|| format!("failed to re-read sync job {}", id))?;
    raw.map(RawSyncJob::into_job).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::NewUpstreamSource;

    fn source_id(store: &Store) -> String {
        store
            .sources()
            .create(NewUpstreamSource {
                name: "sync-target".to_string(),
                url: "https://upstream.example".to_string(),
                owner_id: Some("u1".to_string()),
                ..Default::default()
            })
            .expect("create")
            .id
    }

    #[test]
    fn lifecycle_pending_running_completed() {
        let store = Store::open_in_memory().expect("open");
        let source_id = source_id(&store);

        let job = store.sync_jobs().create(&source_id).expect("create");
        assert_eq!(job.status, SyncJobStatus::Pending);
        assert!(store.sync_jobs().has_active(&source_id).expect("active"));

        store.sync_jobs().mark_running(&job.id).expect("run");
        store.sync_jobs().mark_completed(&job.id, 42, 7).expect("complete");

        let job = store.sync_jobs().get(&job.id).expect("get").expect("present");
        assert_eq!(job.status, SyncJobStatus::Completed);
        assert_eq!(job.versions_found, 42);
        assert_eq!(job.versions_new, 7);
        assert!(job.completed_at.is_some());
        assert!(!store.sync_jobs().has_active(&source_id).expect("active"));
    }

    #[test]
    fn failure_records_message() {
        let store = Store::open_in_memory().expect("open");
        let source_id = source_id(&store);
        let job = store.sync_jobs().create(&source_id).expect("create");
        store.sync_jobs().mark_running(&job.id).expect("run");
        store
            .sync_jobs()
            .mark_failed(&job.id, "rate limited with no results")
            .expect("fail");

        let job = store.sync_jobs().get(&job.id).expect("get").expect("present");
        assert_eq!(job.status, SyncJobStatus::Failed);
        assert_eq!(
            job.error_message.as_deref(),
            Some("rate limited with no results")
        );
        assert!(store.sync_jobs().last_success(&source_id).expect("last").is_none());
    }

    #[test]
    fn last_success_reflects_newest_completed_run() {
        let store = Store::open_in_memory().expect("open");
        let source_id = source_id(&store);

        let first = store.sync_jobs().create(&source_id).expect("create");
        store.sync_jobs().mark_running(&first.id).expect("run");
        store.sync_jobs().mark_completed(&first.id, 1, 1).expect("complete");

        let last = store
            .sync_jobs()
            .last_success(&source_id)
            .expect("query")
            .expect("present");
        assert!(last <= Utc::now());
    }

    #[test]
    fn prune_keeps_newest_runs() {
        let store = Store::open_in_memory().expect("open");
        let source_id = source_id(&store);
        for _ in 0..5 {
            let job = store.sync_jobs().create(&source_id).expect("create");
            store.sync_jobs().mark_running(&job.id).expect("run");
            store.sync_jobs().mark_completed(&job.id, 0, 0).expect("complete");
        }

        let deleted = store.sync_jobs().prune(&source_id, 2).expect("prune");
        assert_eq!(deleted, 3);
    }
}
