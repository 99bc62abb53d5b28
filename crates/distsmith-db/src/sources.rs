//! Upstream source repository.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params};
use tracing::debug;

use distsmith_types::{CoreError, RetrievalMethod, UpstreamSource, new_id};

use crate::store::Store;
use crate::util;

const SOURCE_COLS: &str = "id, name, url, component_ids, retrieval_method, url_template, \
     forge_type, version_filter, default_version, priority, enabled, is_system, owner_id, \
     created_at, updated_at";

/// Fields accepted when creating an upstream source.
#[derive(Debug, Clone)]
pub struct NewUpstreamSource {
    pub name: String,
    pub url: String,
    pub component_ids: Vec<String>,
    pub retrieval_method: RetrievalMethod,
    pub url_template: Option<String>,
    pub forge_type: Option<String>,
    pub version_filter: Option<String>,
    pub default_version: Option<String>,
    pub priority: i64,
    pub enabled: bool,
    pub is_system: bool,
    pub owner_id: Option<String>,
}

impl Default for NewUpstreamSource {
    fn default() -> Self {
        Self {
            name: String::new(),
            url: String::new(),
            component_ids: Vec::new(),
            retrieval_method: RetrievalMethod::Release,
            url_template: None,
            forge_type: None,
            version_filter: None,
            default_version: None,
            priority: 100,
            enabled: true,
            is_system: false,
            owner_id: None,
        }
    }
}

pub struct SourceRepo<'a> {
    store: &'a Store,
}

impl<'a> SourceRepo<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn create(&self, new: NewUpstreamSource) -> Result<UpstreamSource> {
        if new.name.trim().is_empty() || new.url.trim().is_empty() {
            return Err(CoreError::InvalidInput("source name and url are required".into()).into());
        }
        // System sources are exactly the unowned ones.
        if !new.is_system && new.owner_id.is_none() {
            return Err(CoreError::InvalidInput("user source needs an owner".into()).into());
        }
        let owner_id = if new.is_system { None } else { new.owner_id.clone() };

        self.store.with_tx(|tx| {
            let id = new_id();
            let now = util::ts(Utc::now());
            tx.execute(
                "INSERT INTO upstream_sources
                    (id, name, url, component_ids, retrieval_method, url_template,
                     forge_type, version_filter, default_version, priority, enabled,
                     is_system, owner_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
                params![
                    id,
                    new.name,
                    new.url,
                    util::join_ids(&new.component_ids)?,
                    new.retrieval_method.to_string(),
                    new.url_template,
                    new.forge_type,
                    new.version_filter,
                    new.default_version,
                    new.priority,
                    new.enabled as i64,
                    new.is_system as i64,
                    owner_id,
                    now,
                ],
            )
            .with_context(|| format!("failed to insert source {}", new.name))?;

            debug!(source = %new.name, "upstream source created");
            fetch_by_id(tx, &id)?.context("source vanished after insert")
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<UpstreamSource>> {
        self.store.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {} FROM upstream_sources WHERE id = ?1", SOURCE_COLS),
                    params![id],
                    read_row,
                )
                .optional()
                .with_context(|| format!("failed to read source {}", id))?;
            raw.map(RawSource::into_source).transpose()
        })
    }

    pub fn list_all(&self) -> Result<Vec<UpstreamSource>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM upstream_sources ORDER BY priority, name",
                    SOURCE_COLS
                ))
                .context("failed to prepare source list")?;
            let rows = stmt.query_map([], read_row).context("failed to list sources")?;
            let mut sources = Vec::new();
            for raw in rows {
                sources.push(raw.context("failed to read source row")?.into_source()?);
            }
            Ok(sources)
        })
    }

    pub fn list_system(&self) -> Result<Vec<UpstreamSource>> {
        let mut sources = self.list_all()?;
        sources.retain(|s| s.is_system);
        Ok(sources)
    }

    /// System sources plus, when given, one user's sources.
    pub fn list_visible(&self, owner_id: Option<&str>) -> Result<Vec<UpstreamSource>> {
        let mut sources = self.list_all()?;
        sources.retain(|s| s.is_system || s.owner_id.as_deref() == owner_id);
        Ok(sources)
    }

    pub fn list_enabled(&self) -> Result<Vec<UpstreamSource>> {
        let mut sources = self.list_all()?;
        sources.retain(|s| s.enabled);
        Ok(sources)
    }

    /// Enabled sources able to serve a component for a user: the merged
    /// system + own-user list, ordered by `(priority asc, name asc)`.
    pub fn list_for_component(
        &self,
        component_id: &str,
        owner_id: Option<&str>,
    ) -> Result<Vec<UpstreamSource>> {
        let mut sources = self.list_visible(owner_id)?;
        sources.retain(|s| s.enabled && s.serves(component_id));
        sources.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        Ok(sources)
    }

    pub fn update(&self, source: &UpstreamSource) -> Result<UpstreamSource> {
        if source.name.trim().is_empty() || source.url.trim().is_empty() {
            return Err(CoreError::InvalidInput("source name and url are required".into()).into());
        }
        if !source.is_system && source.owner_id.is_none() {
            return Err(CoreError::InvalidInput("user source needs an owner".into()).into());
        }
        let owner_id = if source.is_system {
            None
        } else {
            source.owner_id.clone()
        };

        self.store.with_tx(|tx| {
            let updated = tx
                .execute(
                    "UPDATE upstream_sources SET
                        name = ?2, url = ?3, component_ids = ?4, retrieval_method = ?5,
                        url_template = ?6, forge_type = ?7, version_filter = ?8,
                        default_version = ?9, priority = ?10, enabled = ?11,
                        owner_id = ?12, updated_at = ?13
                     WHERE id = ?1",
                    params![
                        source.id,
                        source.name,
                        source.url,
                        util::join_ids(&source.component_ids)?,
                        source.retrieval_method.to_string(),
                        source.url_template,
                        source.forge_type,
                        source.version_filter,
                        source.default_version,
                        source.priority,
                        source.enabled as i64,
                        owner_id,
                        util::ts(Utc::now()),
                    ],
                )
                .with_context(|| format!("failed to update source {}", source.id))?;
            if updated == 0 {
                return Err(CoreError::NotFound(format!("source {}", source.id)).into());
            }
            fetch_by_id(tx, &source.id)?.context("source vanished after update")
        })
    }

    /// Persist the auto-resolved default version.
    pub fn set_default_version(&self, id: &str, version: &str) -> Result<()> {
        self.store.with_conn(|conn| {
            let updated = conn
                .execute(
                    "UPDATE upstream_sources SET default_version = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, version, util::ts(Utc::now())],
                )
                .with_context(|| format!("failed to set default version for source {}", id))?;
            if updated == 0 {
                return Err(CoreError::NotFound(format!("source {}", id)).into());
            }
            Ok(())
        })
    }

    /// Delete a user source. System sources are never deletable; version
    /// rows and sync jobs cascade away.
    pub fn delete(&self, id: &str) -> Result<()> {
        self.store.with_tx(|tx| {
            let raw = tx
                .query_row(
                    &format!("SELECT {} FROM upstream_sources WHERE id = ?1", SOURCE_COLS),
                    params![id],
                    read_row,
                )
                .optional()
                .with_context(|| format!("failed to read source {}", id))?;
            let source = match raw {
                Some(raw) => raw.into_source()?,
                None => return Err(CoreError::NotFound(format!("source {}", id)).into()),
            };
            if source.is_system {
                return Err(CoreError::Forbidden(format!(
                    "system source {} cannot be deleted",
                    source.name
                ))
                .into());
            }

            tx.execute("DELETE FROM upstream_sources WHERE id = ?1", params![id])
                .with_context(|| format!("failed to delete source {}", id))?;
            debug!(source = %source.name, "upstream source deleted");
            Ok(())
        })
    }
}

struct RawSource {
    id: String,
    name: String,
    url: String,
    component_ids: String,
    retrieval_method: String,
    url_template: Option<String>,
    forge_type: Option<String>,
    version_filter: Option<String>,
    default_version: Option<String>,
    priority: i64,
    enabled: i64,
    is_system: i64,
    owner_id: Option<String>,
    created_at: String,
    updated_at: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawSource> {
    Ok(RawSource {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        component_ids: row.get(3)?,
        retrieval_method: row.get(4)?,
        url_template: row.get(5)?,
        forge_type: row.get(6)?,
        version_filter: row.get(7)?,
        default_version: row.get(8)?,
        priority: row.get(9)?,
        enabled: row.get(10)?,
        is_system: row.get(11)?,
        owner_id: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

impl RawSource {
    fn into_source(self) -> Result<UpstreamSource> {
        Ok(UpstreamSource {
            component_ids: util::parse_ids(&self.component_ids)?,
            retrieval_method: self.retrieval_method.parse()?,
            enabled: util::bool_col(self.enabled),
            is_system: util::bool_col(self.is_system),
            created_at: util::parse_ts(&self.created_at)?,
            updated_at: util::parse_ts(&self.updated_at)?,
            id: self.id,
            name: self.name,
            url: self.url,
            url_template: self.url_template,
            forge_type: self.forge_type,
            version_filter: self.version_filter,
            default_version: self.default_version,
            priority: self.priority,
            owner_id: self.owner_id,
        })
    }
}

fn fetch_by_id(tx: &rusqlite::Transaction<'_>, id: &str) -> Result<Option<UpstreamSource>> {
    let raw = tx
        .query_row(
            &format!("SELECT {} FROM upstream_sources WHERE id = ?1", SOURCE_COLS),
            params![id],
            read_row,
        )
        .optional()
        .with_context(|| format!("failed to re-read source {}", id))?;
    raw.map(RawSource::into_source).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_source(name: &str, component_ids: Vec<String>, priority: i64) -> NewUpstreamSource {
        NewUpstreamSource {
            name: name.to_string(),
            url: format!("https://mirror.example/{}", name),
            component_ids,
            priority,
            owner_id: Some("u1".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn create_and_get_round_trip() {
        let store = Store::open_in_memory().expect("open");
        let created = store
            .sources()
            .create(user_source("my-mirror", vec!["c1".to_string()], 50))
            .expect("create");

        let fetched = store.sources().get(&created.id).expect("get").expect("present");
        assert_eq!(fetched.name, "my-mirror");
        assert_eq!(fetched.component_ids, vec!["c1"]);
        assert_eq!(fetched.priority, 50);
        assert!(!fetched.is_system);
    }

    #[test]
    fn create_requires_name_and_url() {
        let store = Store::open_in_memory().expect("open");
        let err = store
            .sources()
            .create(NewUpstreamSource::default())
            .expect_err("invalid");
        assert_eq!(
            err.downcast_ref::<CoreError>().expect("core").http_status(),
            400
        );
    }

    #[test]
    fn user_source_requires_owner() {
        let store = Store::open_in_memory().expect("open");
        let err = store
            .sources()
            .create(NewUpstreamSource {
                name: "ownerless".to_string(),
                url: "https://upstream.example".to_string(),
                ..Default::default()
            })
            .expect_err("ownerless user source");
        assert_eq!(
            err.downcast_ref::<CoreError>().expect("core").http_status(),
            400
        );
    }

    #[test]
    fn list_for_component_orders_by_priority_then_name() {
        let store = Store::open_in_memory().expect("open");
        let component_id = "shared-component".to_string();
        store
            .sources()
            .create(user_source("b-mirror", vec![component_id.clone()], 20))
            .expect("create");
        store
            .sources()
            .create(user_source("a-mirror", vec![component_id.clone()], 20))
            .expect("create");
        store
            .sources()
            .create(user_source("primary", vec![component_id.clone()], 5))
            .expect("create");

        let sources = store
            .sources()
            .list_for_component(&component_id, Some("u1"))
            .expect("list");
        let names: Vec<&str> = sources.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["primary", "a-mirror", "b-mirror"]);
    }

    #[test]
    fn list_for_component_skips_disabled_and_foreign_sources() {
        let store = Store::open_in_memory().expect("open");
        let component_id = "c-shared".to_string();

        let mut disabled = user_source("disabled", vec![component_id.clone()], 1);
        disabled.enabled = false;
        store.sources().create(disabled).expect("create");

        let mut foreign = user_source("foreign", vec![component_id.clone()], 1);
        foreign.owner_id = Some("someone-else".to_string());
        store.sources().create(foreign).expect("create");

        let sources = store
            .sources()
            .list_for_component(&component_id, Some("u1"))
            .expect("list");
        assert!(sources.is_empty());
    }

    #[test]
    fn system_source_delete_is_forbidden() {
        let store = Store::open_in_memory().expect("open");
        let source = store
            .sources()
            .list_system()
            .expect("list")
            .into_iter()
            .next()
            .expect("seeded");
        let err = store.sources().delete(&source.id).expect_err("forbidden");
        assert_eq!(
            err.downcast_ref::<CoreError>().expect("core").http_status(),
            403
        );
    }

    #[test]
    fn delete_user_source_cascades_versions() {
        let store = Store::open_in_memory().expect("open");
        let source = store
            .sources()
            .create(user_source("mine", vec![], 10))
            .expect("create");
        store
            .versions()
            .upsert_bulk(
                &source.id,
                distsmith_types::SourceType::User,
                &[crate::versions::DiscoveredVersion {
                    version: "1.0".to_string(),
                    ..Default::default()
                }],
            )
            .expect("upsert");

        store.sources().delete(&source.id).expect("delete");
        let versions = store.versions().list_for_source(&source.id).expect("list");
        assert!(versions.is_empty());
    }

    #[test]
    fn set_default_version_persists() {
        let store = Store::open_in_memory().expect("open");
        let source = store
            .sources()
            .create(user_source("mine", vec![], 10))
            .expect("create");
        store
            .sources()
            .set_default_version(&source.id, "2.0.1")
            .expect("set");
        let source = store.sources().get(&source.id).expect("get").expect("present");
        assert_eq!(source.default_version.as_deref(), Some("2.0.1"));
    }

    #[test]
    fn seeded_sources_are_bound_to_seeded_components() {
        let store = Store::open_in_memory().expect("open");
        let kernel = store
            .components()
            .get_by_name("kernel-source")
            .expect("get")
            .expect("seeded");
        let sources = store
            .sources()
            .list_for_component(&kernel.id, None)
            .expect("list");
        assert!(sources.iter().any(|s| s.name == "kernel.org"));
    }
}
