//! Download-job repository: queue state, progress, and dedup lookups.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params};
use serde::Serialize;
use tracing::debug;

use distsmith_types::{
    CoreError, DownloadJob, DownloadJobStatus, RetrievalMethod, SourceType, new_id,
};

use crate::store::Store;
use crate::util;

const JOB_COLS: &str = "id, distribution_id, owner_id, component_id, component_ids, source_id, \
     source_name, source_type, retrieval_method, resolved_url, version, status, progress_bytes, \
     total_bytes, artifact_path, checksum, error_message, retry_count, max_retries, priority, \
     cache_hit, created_at, started_at, completed_at";

/// Fields for a freshly planned job.
#[derive(Debug, Clone)]
pub struct NewDownloadJob {
    pub distribution_id: String,
    pub owner_id: String,
    pub component_id: String,
    pub source_id: String,
    pub source_name: String,
    pub source_type: SourceType,
    pub retrieval_method: RetrievalMethod,
    pub resolved_url: String,
    pub version: String,
    pub max_retries: u32,
    pub priority: i64,
}

/// Aggregate progress for a distribution (or the whole store).
#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadStats {
    pub total: u64,
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub cache_hits: u64,
    pub bytes_downloaded: u64,
}

pub struct JobRepo<'a> {
    store: &'a Store,
}

impl<'a> JobRepo<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Insert a pending job. The partial unique index on
    /// `(distribution_id, source_id, version)` rejects a second live job for
    /// the same artifact.
    pub fn create(&self, new: NewDownloadJob) -> Result<DownloadJob> {
        self.insert(new, DownloadJobStatus::Pending, None, None, 0, false)
    }

    /// Insert an already-completed job: the artifact came from the shared
    /// cache or another build, no network traffic happened.
    pub fn create_cache_hit(
        &self,
        new: NewDownloadJob,
        artifact_path: &str,
        checksum: &str,
        size_bytes: u64,
    ) -> Result<DownloadJob> {
        self.insert(
            new,
            DownloadJobStatus::Completed,
            Some(artifact_path.to_string()),
            Some(checksum.to_string()),
            size_bytes,
            true,
        )
    }

    fn insert(
        &self,
        new: NewDownloadJob,
        status: DownloadJobStatus,
        artifact_path: Option<String>,
        checksum: Option<String>,
        size_bytes: u64,
        cache_hit: bool,
    ) -> Result<DownloadJob> {
        let id = new_id();
        let now = Utc::now();
        let terminal = status.is_terminal();
        let component_ids = util::join_ids(&[new.component_id.clone()])?;

        let result = self.store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO download_jobs
                    (id, distribution_id, owner_id, component_id, component_ids, source_id,
                     source_name, source_type, retrieval_method, resolved_url, version, status,
                     progress_bytes, total_bytes, artifact_path, checksum, error_message,
                     retry_count, max_retries, priority, cache_hit, created_at, started_at,
                     completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                         NULL, 0, ?17, ?18, ?19, ?20, ?21, ?22)",
                params![
                    id,
                    new.distribution_id,
                    new.owner_id,
                    new.component_id,
                    component_ids,
                    new.source_id,
                    new.source_name,
                    new.source_type.to_string(),
                    new.retrieval_method.to_string(),
                    new.resolved_url,
                    new.version,
                    status.to_string(),
                    size_bytes as i64,
                    size_bytes as i64,
                    artifact_path,
                    checksum,
                    new.max_retries as i64,
                    new.priority,
                    cache_hit as i64,
                    util::ts(now),
                    if terminal { Some(util::ts(now)) } else { None },
                    if terminal { Some(util::ts(now)) } else { None },
                ],
            )
            .map_err(map_dedup_violation)?;
            fetch_by_id(tx, &id)?.context("job vanished after insert")
        })?;

        debug!(
            job_id = %result.id,
            source = %result.source_name,
            version = %result.version,
            status = %result.status,
            "download job created"
        );
        Ok(result)
    }

    pub fn get(&self, id: &str) -> Result<Option<DownloadJob>> {
        self.store.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {} FROM download_jobs WHERE id = ?1", JOB_COLS),
                    params![id],
                    read_row,
                )
                .optional()
                .with_context(|| format!("failed to read job {}", id))?;
            raw.map(RawJob::into_job).transpose()
        })
    }

    pub fn list_for_distribution(&self, distribution_id: &str) -> Result<Vec<DownloadJob>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM download_jobs WHERE distribution_id = ?1
                     ORDER BY priority DESC, created_at ASC",
                    JOB_COLS
                ))
                .context("failed to prepare job list")?;
            let rows = stmt
                .query_map(params![distribution_id], read_row)
                .context("failed to list jobs")?;
            let mut jobs = Vec::new();
            for raw in rows {
                jobs.push(raw.context("failed to read job row")?.into_job()?);
            }
            Ok(jobs)
        })
    }

    /// Queue drain order: priority first, oldest first within a priority.
    pub fn pending_ids_by_priority(&self) -> Result<Vec<String>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id FROM download_jobs WHERE status = 'pending'
                     ORDER BY priority DESC, created_at ASC",
                )
                .context("failed to prepare pending query")?;
            let ids = stmt
                .query_map([], |row| row.get(0))
                .context("failed to list pending jobs")?
                .collect::<rusqlite::Result<Vec<String>>>()
                .context("failed to read pending ids")?;
            Ok(ids)
        })
    }

    /// Compare-and-set claim: `pending -> verifying`. `false` means another
    /// worker (or a cancel) got there first and the caller must drop the job.
    pub fn claim(&self, id: &str) -> Result<bool> {
        self.store.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE download_jobs
                     SET status = 'verifying', started_at = COALESCE(started_at, ?2)
                     WHERE id = ?1 AND status = 'pending'",
                    params![id, util::ts(Utc::now())],
                )
                .with_context(|| format!("failed to claim job {}", id))?;
            Ok(changed > 0)
        })
    }

    /// Back to `verifying` at the top of a retry attempt.
    pub fn mark_verifying(&self, id: &str) -> Result<()> {
        self.set_nonterminal_status(id, DownloadJobStatus::Verifying)
    }

    pub fn mark_downloading(&self, id: &str, total_bytes: u64) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE download_jobs SET status = 'downloading', total_bytes = ?2
                 WHERE id = ?1 AND status IN ('pending', 'verifying', 'downloading')",
                params![id, total_bytes as i64],
            )
            .with_context(|| format!("failed to mark job downloading {}", id))?;
            Ok(())
        })
    }

    /// Progress is monotonic while the job is live; late or duplicate writes
    /// can never move it backwards.
    pub fn update_progress(&self, id: &str, progress_bytes: u64) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE download_jobs
                 SET progress_bytes = MAX(progress_bytes, ?2)
                 WHERE id = ?1 AND status IN ('verifying', 'downloading')",
                params![id, progress_bytes as i64],
            )
            .with_context(|| format!("failed to update progress for {}", id))?;
            Ok(())
        })
    }

    pub fn mark_completed(
        &self,
        id: &str,
        artifact_path: &str,
        checksum: &str,
        size_bytes: u64,
    ) -> Result<()> {
        self.store.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE download_jobs
                     SET status = 'completed', artifact_path = ?2, checksum = ?3,
                         progress_bytes = ?4, total_bytes = ?4, error_message = NULL,
                         completed_at = ?5
                     WHERE id = ?1 AND status NOT IN ('completed', 'failed', 'cancelled')",
                    params![id, artifact_path, checksum, size_bytes as i64, util::ts(Utc::now())],
                )
                .with_context(|| format!("failed to complete job {}", id))?;
            if changed == 0 {
                return Err(CoreError::Conflict(format!("job {} already terminal", id)).into());
            }
            Ok(())
        })
    }

    pub fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE download_jobs
                 SET status = 'failed', error_message = ?2, completed_at = ?3
                 WHERE id = ?1 AND status NOT IN ('completed', 'cancelled')",
                params![id, error, util::ts(Utc::now())],
            )
            .with_context(|| format!("failed to mark job failed {}", id))?;
            Ok(())
        })
    }

    /// Record `cancelled` regardless of whether a worker holds the job; a
    /// job still sitting in the queue transitions without one. Jobs that
    /// already finished stay finished.
    pub fn mark_cancelled(&self, id: &str) -> Result<bool> {
        self.store.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE download_jobs
                     SET status = 'cancelled', completed_at = ?2
                     WHERE id = ?1 AND status NOT IN ('completed', 'failed', 'cancelled')",
                    params![id, util::ts(Utc::now())],
                )
                .with_context(|| format!("failed to cancel job {}", id))?;
            Ok(changed > 0)
        })
    }

    /// Per-attempt bookkeeping: bump the counter, keep the message.
    pub fn record_attempt_failure(&self, id: &str, error: &str) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE download_jobs SET retry_count = retry_count + 1, error_message = ?2
                 WHERE id = ?1",
                params![id, error],
            )
            .with_context(|| format!("failed to record attempt failure for {}", id))?;
            Ok(())
        })
    }

    /// The live job for `(distribution, source, version)`, if any. Cancelled
    /// jobs do not count.
    pub fn find_active(
        &self,
        distribution_id: &str,
        source_id: &str,
        version: &str,
    ) -> Result<Option<DownloadJob>> {
        self.store.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM download_jobs
                         WHERE distribution_id = ?1 AND source_id = ?2 AND version = ?3
                           AND status != 'cancelled'",
                        JOB_COLS
                    ),
                    params![distribution_id, source_id, version],
                    read_row,
                )
                .optional()
                .context("failed to probe for duplicate job")?;
            raw.map(RawJob::into_job).transpose()
        })
    }

    /// A completed job for the same artifact in any other distribution;
    /// source of cross-build dedup.
    pub fn find_completed_elsewhere(
        &self,
        source_id: &str,
        version: &str,
        exclude_distribution: &str,
    ) -> Result<Option<DownloadJob>> {
        self.store.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM download_jobs
                         WHERE source_id = ?1 AND version = ?2 AND status = 'completed'
                           AND distribution_id != ?3
                         ORDER BY completed_at DESC LIMIT 1",
                        JOB_COLS
                    ),
                    params![source_id, version, exclude_distribution],
                    read_row,
                )
                .optional()
                .context("failed to probe for completed job")?;
            raw.map(RawJob::into_job).transpose()
        })
    }

    /// Add a component to an existing job's set; a no-op when already there.
    pub fn append_component(&self, job_id: &str, component_id: &str) -> Result<DownloadJob> {
        self.store.with_tx(|tx| {
            let job = fetch_by_id(tx, job_id)?
                .ok_or_else(|| CoreError::NotFound(format!("job {}", job_id)))?;
            let mut component_ids = job.component_ids.clone();
            if !component_ids.iter().any(|id| id == component_id) {
                component_ids.push(component_id.to_string());
                tx.execute(
                    "UPDATE download_jobs SET component_ids = ?2 WHERE id = ?1",
                    params![job_id, util::join_ids(&component_ids)?],
                )
                .with_context(|| format!("failed to append component to {}", job_id))?;
            }
            fetch_by_id(tx, job_id)?.context("job vanished after append")
        })
    }

    pub fn stats(&self, distribution_id: Option<&str>) -> Result<DownloadStats> {
        let jobs = match distribution_id {
            Some(distribution_id) => self.list_for_distribution(distribution_id)?,
            None => self.store.with_conn(|conn| {
                let mut stmt = conn
                    .prepare(&format!("SELECT {} FROM download_jobs", JOB_COLS))
                    .context("failed to prepare stats query")?;
                let rows = stmt.query_map([], read_row).context("failed to scan jobs")?;
                let mut jobs = Vec::new();
                for raw in rows {
                    jobs.push(raw.context("failed to read job row")?.into_job()?);
                }
                Ok(jobs)
            })?,
        };

        let mut stats = DownloadStats {
            total: jobs.len() as u64,
            ..Default::default()
        };
        for job in jobs {
            match job.status {
                DownloadJobStatus::Pending => stats.pending += 1,
                DownloadJobStatus::Verifying | DownloadJobStatus::Downloading => stats.running += 1,
                DownloadJobStatus::Completed => {
                    stats.completed += 1;
                    stats.bytes_downloaded += job.total_bytes;
                }
                DownloadJobStatus::Failed => stats.failed += 1,
                DownloadJobStatus::Cancelled => stats.cancelled += 1,
            }
            if job.cache_hit {
                stats.cache_hits += 1;
            }
        }
        Ok(stats)
    }

    fn set_nonterminal_status(&self, id: &str, status: DownloadJobStatus) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE download_jobs SET status = ?2
                 WHERE id = ?1 AND status NOT IN ('completed', 'failed', 'cancelled')",
                params![id, status.to_string()],
            )
            .with_context(|| format!("failed to set job {} to {}", id, status))?;
            Ok(())
        })
    }
}

fn map_dedup_violation(err: rusqlite::Error) -> anyhow::Error {
    if let rusqlite::Error::SqliteFailure(failure, _) = &err
        && failure.code == rusqlite::ErrorCode::ConstraintViolation
    {
        return CoreError::Conflict("a live job for this artifact already exists".into()).into();
    }
    anyhow::Error::from(err).context("failed to insert download job")
}

struct RawJob {
    id: String,
    distribution_id: String,
    owner_id: String,
    component_id: String,
    component_ids: String,
    source_id: String,
    source_name: String,
    source_type: String,
    retrieval_method: String,
    resolved_url: String,
    version: String,
    status: String,
    progress_bytes: i64,
    total_bytes: i64,
    artifact_path: Option<String>,
    checksum: Option<String>,
    error_message: Option<String>,
    retry_count: i64,
    max_retries: i64,
    priority: i64,
    cache_hit: i64,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawJob> {
    Ok(RawJob {
        id: row.get(0)?,
        distribution_id: row.get(1)?,
        owner_id: row.get(2)?,
        component_id: row.get(3)?,
        component_ids: row.get(4)?,
        source_id: row.get(5)?,
        source_name: row.get(6)?,
        source_type: row.get(7)?,
        retrieval_method: row.get(8)?,
        resolved_url: row.get(9)?,
        version: row.get(10)?,
        status: row.get(11)?,
        progress_bytes: row.get(12)?,
        total_bytes: row.get(13)?,
        artifact_path: row.get(14)?,
        checksum: row.get(15)?,
        error_message: row.get(16)?,
        retry_count: row.get(17)?,
        max_retries: row.get(18)?,
        priority: row.get(19)?,
        cache_hit: row.get(20)?,
        created_at: row.get(21)?,
        started_at: row.get(22)?,
        completed_at: row.get(23)?,
    })
}

impl RawJob {
    fn into_job(self) -> Result<DownloadJob> {
        Ok(DownloadJob {
            source_type: self.source_type.parse()?,
            retrieval_method: self.retrieval_method.parse()?,
            status: self.status.parse()?,
            progress_bytes: util::u64_col(self.progress_bytes),
            total_bytes: util::u64_col(self.total_bytes),
            retry_count: util::u64_col(self.retry_count) as u32,
            max_retries: util::u64_col(self.max_retries) as u32,
            cache_hit: util::bool_col(self.cache_hit),
            component_ids: util::parse_ids(&self.component_ids)?,
            created_at: util::parse_ts(&self.created_at)?,
            started_at: util::parse_ts_opt(self.started_at)?,
            completed_at: util::parse_ts_opt(self.completed_at)?,
            id: self.id,
            distribution_id: self.distribution_id,
            owner_id: self.owner_id,
            component_id: self.component_id,
            source_id: self.source_id,
            source_name: self.source_name,
            resolved_url: self.resolved_url,
            version: self.version,
            artifact_path: self.artifact_path,
            checksum: self.checksum,
            error_message: self.error_message,
            priority: self.priority,
        })
    }
}

fn fetch_by_id(tx: &rusqlite::Transaction<'_>, id: &str) -> Result<Option<DownloadJob>> {
    let raw = tx
        .query_row(
            &format!("SELECT {} FROM download_jobs WHERE id = ?1", JOB_COLS),
            params![id],
            read_row,
        )
        .optional()
        .with_context(|| format!("failed to re-read job {}", id))?;
    raw.map(RawJob::into_job).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_component(store: &Store) -> String {
        store
            .components()
            .get_by_name("kernel-source")
            .expect("get")
            .expect("seeded")
            .id
    }

    fn new_job(store: &Store, distribution: &str, version: &str, priority: i64) -> NewDownloadJob {
        NewDownloadJob {
            distribution_id: distribution.to_string(),
            owner_id: "u1".to_string(),
            component_id: seeded_component(store),
            source_id: "s1".to_string(),
            source_name: "kernel.org".to_string(),
            source_type: SourceType::Default,
            retrieval_method: RetrievalMethod::Release,
            resolved_url: "https://cdn.kernel.org/linux.tar.xz".to_string(),
            version: version.to_string(),
            max_retries: 3,
            priority,
        }
    }

    #[test]
    fn create_and_get_round_trip() {
        let store = Store::open_in_memory().expect("open");
        let job = store
            .jobs()
            .create(new_job(&store, "d1", "6.12.4", 10))
            .expect("create");

        let fetched = store.jobs().get(&job.id).expect("get").expect("present");
        assert_eq!(fetched.status, DownloadJobStatus::Pending);
        assert_eq!(fetched.component_ids, vec![fetched.component_id.clone()]);
        assert_eq!(fetched.retry_count, 0);
        assert!(fetched.started_at.is_none());
    }

    #[test]
    fn duplicate_live_job_is_a_conflict() {
        let store = Store::open_in_memory().expect("open");
        store
            .jobs()
            .create(new_job(&store, "d1", "6.12.4", 10))
            .expect("create");
        let err = store
            .jobs()
            .create(new_job(&store, "d1", "6.12.4", 10))
            .expect_err("duplicate");
        assert_eq!(
            err.downcast_ref::<CoreError>().expect("core").http_status(),
            409
        );
    }

    #[test]
    fn cancelled_job_does_not_block_resubmission() {
        let store = Store::open_in_memory().expect("open");
        let job = store
            .jobs()
            .create(new_job(&store, "d1", "6.12.4", 10))
            .expect("create");
        assert!(store.jobs().mark_cancelled(&job.id).expect("cancel"));

        store
            .jobs()
            .create(new_job(&store, "d1", "6.12.4", 10))
            .expect("resubmit after cancel");
    }

    #[test]
    fn pending_drain_order_is_priority_then_age() {
        let store = Store::open_in_memory().expect("open");
        let low = store
            .jobs()
            .create(new_job(&store, "d1", "1.0", 0))
            .expect("create");
        let high = store
            .jobs()
            .create(new_job(&store, "d1", "2.0", 10))
            .expect("create");
        let mid = store
            .jobs()
            .create(new_job(&store, "d1", "3.0", 5))
            .expect("create");

        let ids = store.jobs().pending_ids_by_priority().expect("pending");
        assert_eq!(ids, vec![high.id, mid.id, low.id]);
    }

    #[test]
    fn claim_is_compare_and_set() {
        let store = Store::open_in_memory().expect("open");
        let job = store
            .jobs()
            .create(new_job(&store, "d1", "6.12.4", 10))
            .expect("create");

        assert!(store.jobs().claim(&job.id).expect("claim"));
        // Second claim loses.
        assert!(!store.jobs().claim(&job.id).expect("reclaim"));

        let job = store.jobs().get(&job.id).expect("get").expect("present");
        assert_eq!(job.status, DownloadJobStatus::Verifying);
        assert!(job.started_at.is_some());
    }

    #[test]
    fn progress_is_monotonic() {
        let store = Store::open_in_memory().expect("open");
        let job = store
            .jobs()
            .create(new_job(&store, "d1", "6.12.4", 10))
            .expect("create");
        store.jobs().claim(&job.id).expect("claim");
        store.jobs().mark_downloading(&job.id, 1000).expect("downloading");

        store.jobs().update_progress(&job.id, 300).expect("progress");
        store.jobs().update_progress(&job.id, 200).expect("late write");

        let job = store.jobs().get(&job.id).expect("get").expect("present");
        assert_eq!(job.progress_bytes, 300);
        assert_eq!(job.total_bytes, 1000);
    }

    #[test]
    fn complete_sets_path_checksum_and_timestamps() {
        let store = Store::open_in_memory().expect("open");
        let job = store
            .jobs()
            .create(new_job(&store, "d1", "6.12.4", 10))
            .expect("create");
        store.jobs().claim(&job.id).expect("claim");
        store
            .jobs()
            .mark_completed(&job.id, "distribution/u1/d1/x.tar.xz", "abc123", 4096)
            .expect("complete");

        let job = store.jobs().get(&job.id).expect("get").expect("present");
        assert_eq!(job.status, DownloadJobStatus::Completed);
        assert_eq!(job.artifact_path.as_deref(), Some("distribution/u1/d1/x.tar.xz"));
        assert_eq!(job.checksum.as_deref(), Some("abc123"));
        assert_eq!(job.progress_bytes, 4096);
        let completed_at = job.completed_at.expect("completed_at");
        assert!(completed_at >= job.started_at.expect("started_at"));
    }

    #[test]
    fn cancel_does_not_overwrite_completion() {
        let store = Store::open_in_memory().expect("open");
        let job = store
            .jobs()
            .create(new_job(&store, "d1", "6.12.4", 10))
            .expect("create");
        store.jobs().claim(&job.id).expect("claim");
        store
            .jobs()
            .mark_completed(&job.id, "p", "c", 1)
            .expect("complete");

        assert!(!store.jobs().mark_cancelled(&job.id).expect("cancel"));
        let job = store.jobs().get(&job.id).expect("get").expect("present");
        assert_eq!(job.status, DownloadJobStatus::Completed);
    }

    #[test]
    fn append_component_deduplicates() {
        let store = Store::open_in_memory().expect("open");
        let job = store
            .jobs()
            .create(new_job(&store, "d1", "6.12", 0))
            .expect("create");

        let job = store
            .jobs()
            .append_component(&job.id, "second-component")
            .expect("append");
        assert_eq!(job.component_ids.len(), 2);

        let job = store
            .jobs()
            .append_component(&job.id, "second-component")
            .expect("append again");
        assert_eq!(job.component_ids.len(), 2);
        assert!(job.component_ids.contains(&job.component_id));
    }

    #[test]
    fn find_completed_elsewhere_skips_own_distribution() {
        let store = Store::open_in_memory().expect("open");
        let job = store
            .jobs()
            .create(new_job(&store, "d1", "6.12.4", 10))
            .expect("create");
        store.jobs().claim(&job.id).expect("claim");
        store
            .jobs()
            .mark_completed(&job.id, "distribution/u1/d1/x.tar.xz", "abc", 10)
            .expect("complete");

        assert!(store
            .jobs()
            .find_completed_elsewhere("s1", "6.12.4", "d1")
            .expect("probe")
            .is_none());

        let hit = store
            .jobs()
            .find_completed_elsewhere("s1", "6.12.4", "d2")
            .expect("probe")
            .expect("found");
        assert_eq!(hit.id, job.id);
    }

    #[test]
    fn attempt_failure_increments_retry_count() {
        let store = Store::open_in_memory().expect("open");
        let job = store
            .jobs()
            .create(new_job(&store, "d1", "6.12.4", 10))
            .expect("create");
        store
            .jobs()
            .record_attempt_failure(&job.id, "503 from upstream")
            .expect("record");
        store
            .jobs()
            .record_attempt_failure(&job.id, "503 from upstream")
            .expect("record");

        let job = store.jobs().get(&job.id).expect("get").expect("present");
        assert_eq!(job.retry_count, 2);
        assert_eq!(job.error_message.as_deref(), Some("503 from upstream"));
    }

    #[test]
    fn stats_aggregate_by_status() {
        let store = Store::open_in_memory().expect("open");
        let a = store
            .jobs()
            .create(new_job(&store, "d1", "1.0", 0))
            .expect("create");
        store.jobs().claim(&a.id).expect("claim");
        store.jobs().mark_completed(&a.id, "p", "c", 100).expect("complete");

        let b = store
            .jobs()
            .create(new_job(&store, "d1", "2.0", 0))
            .expect("create");
        store.jobs().mark_cancelled(&b.id).expect("cancel");

        store
            .jobs()
            .create(new_job(&store, "d2", "1.0", 0))
            .expect("create");

        let d1 = store.jobs().stats(Some("d1")).expect("stats");
        assert_eq!(d1.total, 2);
        assert_eq!(d1.completed, 1);
        assert_eq!(d1.cancelled, 1);
        assert_eq!(d1.bytes_downloaded, 100);

        let all = store.jobs().stats(None).expect("stats");
        assert_eq!(all.total, 3);
        assert_eq!(all.pending, 1);
    }

    #[test]
    fn cache_hit_job_is_born_completed() {
        let store = Store::open_in_memory().expect("open");
        let job = store
            .jobs()
            .create_cache_hit(
                new_job(&store, "d2", "6.12.4", 10),
                "distribution/u1/d2/x.tar.xz",
                "abc",
                4096,
            )
            .expect("create");
        assert_eq!(job.status, DownloadJobStatus::Completed);
        assert!(job.cache_hit);
        assert!(job.completed_at.is_some());
        assert_eq!(job.total_bytes, 4096);
    }
}
