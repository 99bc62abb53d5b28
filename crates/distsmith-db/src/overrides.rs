//! Per-distribution source override repository.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params};

use distsmith_types::{DistSourceOverride, new_id};

use crate::store::Store;
use crate::util;

const OVERRIDE_COLS: &str = "id, distribution_id, component_id, source_id, created_at";

pub struct OverrideRepo<'a> {
    store: &'a Store,
}

impl<'a> OverrideRepo<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Pin a component to a source for one distribution, replacing any
    /// previous pin.
    pub fn set(
        &self,
        distribution_id: &str,
        component_id: &str,
        source_id: &str,
    ) -> Result<DistSourceOverride> {
        self.store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO dist_source_overrides
                    (id, distribution_id, component_id, source_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (distribution_id, component_id) DO UPDATE SET
                    source_id = excluded.source_id,
                    created_at = excluded.created_at",
                params![
                    new_id(),
                    distribution_id,
                    component_id,
                    source_id,
                    util::ts(Utc::now()),
                ],
            )
            .context("failed to set source override")?;

            let raw = tx
                .query_row(
                    &format!(
                        "SELECT {} FROM dist_source_overrides
                         WHERE distribution_id = ?1 AND component_id = ?2",
                        OVERRIDE_COLS
                    ),
                    params![distribution_id, component_id],
                    read_row,
                )
                .context("failed to re-read override")?;
            raw.into_override()
        })
    }

    pub fn get(
        &self,
        distribution_id: &str,
        component_id: &str,
    ) -> Result<Option<DistSourceOverride>> {
        self.store.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM dist_source_overrides
                         WHERE distribution_id = ?1 AND component_id = ?2",
                        OVERRIDE_COLS
                    ),
                    params![distribution_id, component_id],
                    read_row,
                )
                .optional()
                .context("failed to read override")?;
            raw.map(RawOverride::into_override).transpose()
        })
    }

    pub fn list_for_distribution(&self, distribution_id: &str) -> Result<Vec<DistSourceOverride>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM dist_source_overrides WHERE distribution_id = ?1",
                    OVERRIDE_COLS
                ))
                .context("failed to prepare override list")?;
            let rows = stmt
                .query_map(params![distribution_id], read_row)
                .context("failed to list overrides")?;
            let mut overrides = Vec::new();
            for raw in rows {
                overrides.push(raw.context("failed to read override row")?.into_override()?);
            }
            Ok(overrides)
        })
    }

    pub fn delete(&self, distribution_id: &str, component_id: &str) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "DELETE FROM dist_source_overrides
                 WHERE distribution_id = ?1 AND component_id = ?2",
                params![distribution_id, component_id],
            )
            .context("failed to delete override")?;
            Ok(())
        })
    }
}

struct RawOverride {
    id: String,
    distribution_id: String,
    component_id: String,
    source_id: String,
    created_at: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawOverride> {
    Ok(RawOverride {
        id: row.get(0)?,
        distribution_id: row.get(1)?,
        component_id: row.get(2)?,
        source_id: row.get(3)?,
        created_at: row.get(4)?,
    })
}

impl RawOverride {
    fn into_override(self) -> Result<DistSourceOverride> {
        Ok(DistSourceOverride {
            created_at: util::parse_ts(&self.created_at)?,
            id: self.id,
            distribution_id: self.distribution_id,
            component_id: self.component_id,
            source_id: self.source_id,
        })
    }
}
