//! Mirror configuration repository.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params};

use distsmith_types::{CoreError, MirrorConfigEntry, new_id};

use crate::store::Store;
use crate::util;

const MIRROR_COLS: &str = "id, name, url_prefix, mirror_url, priority, enabled, created_at, updated_at";

/// Fields accepted when creating a mirror rule.
#[derive(Debug, Clone)]
pub struct NewMirror {
    pub name: String,
    pub url_prefix: String,
    pub mirror_url: String,
    pub priority: i64,
    pub enabled: bool,
}

impl Default for NewMirror {
    fn default() -> Self {
        Self {
            name: String::new(),
            url_prefix: String::new(),
            mirror_url: String::new(),
            priority: 100,
            enabled: true,
        }
    }
}

pub struct MirrorRepo<'a> {
    store: &'a Store,
}

impl<'a> MirrorRepo<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn create(&self, new: NewMirror) -> Result<MirrorConfigEntry> {
        if new.url_prefix.trim().is_empty() || new.mirror_url.trim().is_empty() {
            return Err(
                CoreError::InvalidInput("mirror url_prefix and mirror_url are required".into())
                    .into(),
            );
        }
        self.store.with_tx(|tx| {
            let id = new_id();
            tx.execute(
                "INSERT INTO mirrors (id, name, url_prefix, mirror_url, priority, enabled,
                                      created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    id,
                    new.name,
                    new.url_prefix,
                    new.mirror_url,
                    new.priority,
                    new.enabled as i64,
                    util::ts(Utc::now()),
                ],
            )
            .with_context(|| format!("failed to insert mirror {}", new.name))?;

            let raw = tx
                .query_row(
                    &format!("SELECT {} FROM mirrors WHERE id = ?1", MIRROR_COLS),
                    params![id],
                    read_row,
                )
                .context("failed to re-read mirror")?;
            raw.into_entry()
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<MirrorConfigEntry>> {
        self.store.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {} FROM mirrors WHERE id = ?1", MIRROR_COLS),
                    params![id],
                    read_row,
                )
                .optional()
                .with_context(|| format!("failed to read mirror {}", id))?;
            raw.map(RawMirror::into_entry).transpose()
        })
    }

    pub fn list_all(&self) -> Result<Vec<MirrorConfigEntry>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM mirrors ORDER BY priority, name",
                    MIRROR_COLS
                ))
                .context("failed to prepare mirror list")?;
            let rows = stmt.query_map([], read_row).context("failed to list mirrors")?;
            let mut mirrors = Vec::new();
            for raw in rows {
                mirrors.push(raw.context("failed to read mirror row")?.into_entry()?);
            }
            Ok(mirrors)
        })
    }

    /// Enabled rules in priority order, the shape the resolver consumes.
    pub fn list_enabled(&self) -> Result<Vec<MirrorConfigEntry>> {
        let mut mirrors = self.list_all()?;
        mirrors.retain(|m| m.enabled);
        Ok(mirrors)
    }

    pub fn update(&self, mirror: &MirrorConfigEntry) -> Result<MirrorConfigEntry> {
        self.store.with_tx(|tx| {
            let updated = tx
                .execute(
                    "UPDATE mirrors SET name = ?2, url_prefix = ?3, mirror_url = ?4,
                                        priority = ?5, enabled = ?6, updated_at = ?7
                     WHERE id = ?1",
                    params![
                        mirror.id,
                        mirror.name,
                        mirror.url_prefix,
                        mirror.mirror_url,
                        mirror.priority,
                        mirror.enabled as i64,
                        util::ts(Utc::now()),
                    ],
                )
                .with_context(|| format!("failed to update mirror {}", mirror.id))?;
            if updated == 0 {
                return Err(CoreError::NotFound(format!("mirror {}", mirror.id)).into());
            }
            let raw = tx
                .query_row(
                    &format!("SELECT {} FROM mirrors WHERE id = ?1", MIRROR_COLS),
                    params![mirror.id],
                    read_row,
                )
                .context("failed to re-read mirror")?;
            raw.into_entry()
        })
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.store.with_conn(|conn| {
            let deleted = conn
                .execute("DELETE FROM mirrors WHERE id = ?1", params![id])
                .with_context(|| format!("failed to delete mirror {}", id))?;
            if deleted == 0 {
                return Err(CoreError::NotFound(format!("mirror {}", id)).into());
            }
            Ok(())
        })
    }
}

struct RawMirror {
    id: String,
    name: String,
    url_prefix: String,
    mirror_url: String,
    priority: i64,
    enabled: i64,
    created_at: String,
    updated_at: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawMirror> {
    Ok(RawMirror {
        id: row.get(0)?,
        name: row.get(1)?,
        url_prefix: row.get(2)?,
        mirror_url: row.get(3)?,
        priority: row.get(4)?,
        enabled: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

impl RawMirror {
    fn into_entry(self) -> Result<MirrorConfigEntry> {
        Ok(MirrorConfigEntry {
            enabled: util::bool_col(self.enabled),
            created_at: util::parse_ts(&self.created_at)?,
            updated_at: util::parse_ts(&self.updated_at)?,
            id: self.id,
            name: self.name,
            url_prefix: self.url_prefix,
            mirror_url: self.mirror_url,
            priority: self.priority,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mirror(name: &str, prefix: &str, priority: i64) -> NewMirror {
        NewMirror {
            name: name.to_string(),
            url_prefix: prefix.to_string(),
            mirror_url: format!("https://mirror.example/{}", name),
            priority,
            enabled: true,
        }
    }

    #[test]
    fn create_list_round_trip() {
        let store = Store::open_in_memory().expect("open");
        store
            .mirrors()
            .create(mirror("eu", "https://cdn.kernel.org", 10))
            .expect("create");
        store
            .mirrors()
            .create(mirror("us", "https://github.com", 20))
            .expect("create");

        let mirrors = store.mirrors().list_enabled().expect("list");
        assert_eq!(mirrors.len(), 2);
        assert_eq!(mirrors[0].name, "eu");
    }

    #[test]
    fn create_requires_prefix_and_target() {
        let store = Store::open_in_memory().expect("open");
        let err = store.mirrors().create(NewMirror::default()).expect_err("invalid");
        assert_eq!(
            err.downcast_ref::<CoreError>().expect("core").http_status(),
            400
        );
    }

    #[test]
    fn disabled_mirrors_are_filtered() {
        let store = Store::open_in_memory().expect("open");
        let mut created = store
            .mirrors()
            .create(mirror("eu", "https://cdn.kernel.org", 10))
            .expect("create");
        created.enabled = false;
        store.mirrors().update(&created).expect("disable");

        assert!(store.mirrors().list_enabled().expect("list").is_empty());
        assert_eq!(store.mirrors().list_all().expect("list").len(), 1);
    }

    #[test]
    fn delete_missing_is_not_found() {
        let store = Store::open_in_memory().expect("open");
        let err = store.mirrors().delete("nope").expect_err("missing");
        assert_eq!(
            err.downcast_ref::<CoreError>().expect("core").http_status(),
            404
        );
    }
}
