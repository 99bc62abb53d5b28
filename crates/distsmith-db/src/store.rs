//! The single-writer store and its snapshot persistence.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::backup::Backup;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Transaction, params};
use tracing::{debug, info, warn};

use crate::cache_entries::CacheEntryRepo;
use crate::components::ComponentRepo;
use crate::jobs::JobRepo;
use crate::migrations;
use crate::mirrors::MirrorRepo;
use crate::overrides::OverrideRepo;
use crate::sources::SourceRepo;
use crate::sync_jobs::SyncJobRepo;
use crate::versions::VersionRepo;

/// How long a statement waits on a locked database before erroring.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Pages copied per backup step when snapshotting.
const BACKUP_BATCH_PAGES: std::ffi::c_int = 128;

/// Persistence settings for [`Store::open`].
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Snapshot target on disk; `None` keeps the store memory-only.
    pub persist_path: Option<PathBuf>,
    /// Restore the snapshot at startup when it exists.
    pub load_on_start: bool,
}

/// The embedded state store.
///
/// All tables live in one in-memory SQLite database reached through a single
/// connection behind a mutex: exactly one writer, serialized access, no
/// table-level lock contention. Durability comes from [`Store::snapshot`],
/// an atomic write of the whole database to one file.
pub struct Store {
    conn: Mutex<Connection>,
    persist_path: Option<PathBuf>,
}

impl Store {
    /// Open a memory-only store with the schema applied and system rows
    /// seeded.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(StoreOptions::default())
    }

    /// Open the store; when `options.load_on_start` is set and the snapshot
    /// file exists, its contents replace the seeded state.
    pub fn open(options: StoreOptions) -> Result<Self> {
        let mut conn =
            Connection::open_in_memory().context("failed to open in-memory database")?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("failed to set busy timeout")?;
        conn.pragma_update(None, "foreign_keys", true)
            .context("failed to enable foreign keys")?;

        migrations::apply_all(&mut conn)?;

        if options.load_on_start
            && let Some(path) = &options.persist_path
            && path.exists()
        {
            restore_snapshot(&mut conn, path)?;
            // A snapshot taken by an older binary may predate newer
            // migrations; the sequence is idempotent, so re-running it
            // upgrades in place.
            migrations::apply_all(&mut conn)?;
            info!(path = %path.display(), "restored state snapshot");
        }

        Ok(Self {
            conn: Mutex::new(conn),
            persist_path: options.persist_path,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store mutex poisoned")
    }

    /// Run a read/write closure on the connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock();
        f(&conn)
    }

    /// Run a closure inside a transaction: commit on `Ok`, roll back on `Err`.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.lock();
        let tx = conn.transaction().context("failed to begin transaction")?;
        match f(&tx) {
            Ok(value) => {
                tx.commit().context("failed to commit transaction")?;
                Ok(value)
            }
            Err(e) => Err(e),
        }
    }

    // Entity repositories.

    pub fn components(&self) -> ComponentRepo<'_> {
        ComponentRepo::new(self)
    }

    pub fn sources(&self) -> SourceRepo<'_> {
        SourceRepo::new(self)
    }

    pub fn versions(&self) -> VersionRepo<'_> {
        VersionRepo::new(self)
    }

    pub fn jobs(&self) -> JobRepo<'_> {
        JobRepo::new(self)
    }

    pub fn cache_entries(&self) -> CacheEntryRepo<'_> {
        CacheEntryRepo::new(self)
    }

    pub fn mirrors(&self) -> MirrorRepo<'_> {
        MirrorRepo::new(self)
    }

    pub fn sync_jobs(&self) -> SyncJobRepo<'_> {
        SyncJobRepo::new(self)
    }

    pub fn overrides(&self) -> OverrideRepo<'_> {
        OverrideRepo::new(self)
    }

    // Key/value settings.

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read setting {}", key))
        })
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value,
                                                updated_at = excluded.updated_at",
                params![key, value, Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("failed to write setting {}", key))?;
            Ok(())
        })
    }

    pub fn delete_setting(&self, key: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM settings WHERE key = ?1", params![key])
                .with_context(|| format!("failed to delete setting {}", key))?;
            Ok(())
        })
    }

    /// Snapshot to the configured persist path. A no-op without one.
    pub fn snapshot(&self) -> Result<()> {
        match &self.persist_path {
            Some(path) => self.snapshot_to(path),
            None => Ok(()),
        }
    }

    /// Write the whole database to `path` atomically: backup into a `*.tmp`
    /// sibling, fsync, rename over the target.
    pub fn snapshot_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create snapshot dir: {}", parent.display()))?;
        }

        let tmp_path = PathBuf::from(format!("{}.tmp", path.display()));
        if tmp_path.exists() {
            fs::remove_file(&tmp_path)
                .with_context(|| format!("failed to clear stale snapshot: {}", tmp_path.display()))?;
        }

        let result = (|| -> Result<()> {
            let conn = self.lock();
            let mut dst = Connection::open(&tmp_path)
                .with_context(|| format!("failed to open snapshot file: {}", tmp_path.display()))?;
            {
                let backup =
                    Backup::new(&conn, &mut dst).context("failed to start snapshot backup")?;
                backup
                    .run_to_completion(BACKUP_BATCH_PAGES, Duration::ZERO, None)
                    .context("failed to run snapshot backup")?;
            }
            dst.close()
                .map_err(|(_, e)| e)
                .context("failed to close snapshot file")?;

            let file = File::open(&tmp_path).context("failed to reopen snapshot for fsync")?;
            file.sync_all().context("failed to fsync snapshot")?;
            Ok(())
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }

        fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to move snapshot into place: {}", path.display()))?;
        debug!(path = %path.display(), "state snapshot written");
        Ok(())
    }

    /// Snapshot, logging instead of failing; used by the periodic persister
    /// where a transient disk error must not take the server down.
    pub fn snapshot_best_effort(&self) {
        if let Err(e) = self.snapshot() {
            warn!(error = %format!("{:#}", e), "state snapshot failed");
        }
    }

    /// Drop every entity table (the migration ledger survives) and re-run
    /// the migration sequence, restoring seeded defaults.
    pub fn reset_to_defaults(&self) -> Result<()> {
        let mut conn = self.lock();
        conn.execute_batch(
            "DROP TABLE IF EXISTS dist_source_overrides;
             DROP TABLE IF EXISTS sync_jobs;
             DROP TABLE IF EXISTS download_jobs;
             DROP TABLE IF EXISTS source_versions;
             DROP TABLE IF EXISTS artifact_cache;
             DROP TABLE IF EXISTS mirrors;
             DROP TABLE IF EXISTS upstream_sources;
             DROP TABLE IF EXISTS components;
             DROP TABLE IF EXISTS settings;",
        )
        .context("failed to drop tables for reset")?;
        migrations::apply_all(&mut conn)?;
        info!("store reset to defaults");
        Ok(())
    }
}

fn restore_snapshot(conn: &mut Connection, path: &Path) -> Result<()> {
    let src = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("failed to open snapshot: {}", path.display()))?;
    let backup = Backup::new(&src, conn).context("failed to start snapshot restore")?;
    backup
        .run_to_completion(BACKUP_BATCH_PAGES, Duration::ZERO, None)
        .with_context(|| format!("failed to restore snapshot: {}", path.display()))?;
    Ok(())
}
