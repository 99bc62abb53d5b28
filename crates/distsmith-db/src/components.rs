//! Component catalog repository.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params};
use tracing::debug;

use distsmith_types::{Component, CoreError, TargetArch, VersionRule, new_id};

use crate::store::Store;
use crate::util;

const COMPONENT_COLS: &str = "id, name, categories, display_name, description, artifact_pattern, \
     default_url_template, forge_url_template, is_optional, is_system, owner_id, \
     is_kernel_module, is_userspace, default_version, default_version_rule, \
     supported_architectures, created_at, updated_at";

/// Fields accepted when creating a component.
#[derive(Debug, Clone, Default)]
pub struct NewComponent {
    pub name: String,
    pub categories: Vec<String>,
    pub display_name: String,
    pub description: String,
    pub artifact_pattern: Option<String>,
    pub default_url_template: Option<String>,
    pub forge_url_template: Option<String>,
    pub is_optional: bool,
    pub is_system: bool,
    pub owner_id: Option<String>,
    pub is_kernel_module: bool,
    pub is_userspace: bool,
    pub default_version: Option<String>,
    pub default_version_rule: VersionRule,
    pub supported_architectures: Vec<TargetArch>,
}

pub struct ComponentRepo<'a> {
    store: &'a Store,
}

impl<'a> ComponentRepo<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn create(&self, new: NewComponent) -> Result<Component> {
        if new.categories.is_empty() {
            return Err(CoreError::InvalidInput("component needs at least one category".into()).into());
        }
        if new.name.trim().is_empty() {
            return Err(CoreError::InvalidInput("component name is required".into()).into());
        }
        // System components are unowned by definition.
        let owner_id = if new.is_system { None } else { new.owner_id.clone() };

        self.store.with_tx(|tx| {
            let exists: Option<String> = tx
                .query_row(
                    "SELECT id FROM components WHERE name = ?1",
                    params![new.name],
                    |row| row.get(0),
                )
                .optional()
                .context("failed to check component name")?;
            if exists.is_some() {
                return Err(CoreError::Conflict(format!(
                    "component name already taken: {}",
                    new.name
                ))
                .into());
            }

            let id = new_id();
            let now = Utc::now();
            tx.execute(
                "INSERT INTO components
                    (id, name, categories, display_name, description, artifact_pattern,
                     default_url_template, forge_url_template, is_optional, is_system,
                     owner_id, is_kernel_module, is_userspace, default_version,
                     default_version_rule, supported_architectures, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?17)",
                params![
                    id,
                    new.name,
                    util::join_csv(&new.categories),
                    new.display_name,
                    new.description,
                    new.artifact_pattern,
                    new.default_url_template,
                    new.forge_url_template,
                    new.is_optional as i64,
                    new.is_system as i64,
                    owner_id,
                    new.is_kernel_module as i64,
                    new.is_userspace as i64,
                    new.default_version,
                    new.default_version_rule.to_string(),
                    util::join_arches(&new.supported_architectures),
                    util::ts(now),
                ],
            )
            .with_context(|| format!("failed to insert component {}", new.name))?;

            debug!(component = %new.name, system = new.is_system, "component created");
            fetch_by_id(tx, &id)?.context("component vanished after insert")
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<Component>> {
        self.store.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {} FROM components WHERE id = ?1", COMPONENT_COLS),
                    params![id],
                    read_row,
                )
                .optional()
                .with_context(|| format!("failed to read component {}", id))?;
            raw.map(RawComponent::into_component).transpose()
        })
    }

    pub fn get_by_name(&self, name: &str) -> Result<Option<Component>> {
        self.store.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {} FROM components WHERE name = ?1", COMPONENT_COLS),
                    params![name],
                    read_row,
                )
                .optional()
                .with_context(|| format!("failed to read component {}", name))?;
            raw.map(RawComponent::into_component).transpose()
        })
    }

    /// System components plus, when given, one user's components.
    pub fn list_visible(&self, owner_id: Option<&str>) -> Result<Vec<Component>> {
        let mut components = self.list_all()?;
        components.retain(|c| c.is_system || c.owner_id.as_deref() == owner_id);
        Ok(components)
    }

    pub fn list_system(&self) -> Result<Vec<Component>> {
        let mut components = self.list_all()?;
        components.retain(|c| c.is_system);
        Ok(components)
    }

    pub fn list_all(&self) -> Result<Vec<Component>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM components ORDER BY name",
                    COMPONENT_COLS
                ))
                .context("failed to prepare component list")?;
            let rows = stmt
                .query_map([], read_row)
                .context("failed to list components")?;
            let mut components = Vec::new();
            for raw in rows {
                components.push(raw.context("failed to read component row")?.into_component()?);
            }
            Ok(components)
        })
    }

    /// Components whose category list contains `category` (any member).
    pub fn list_by_category(&self, category: &str) -> Result<Vec<Component>> {
        let mut components = self.list_all()?;
        components.retain(|c| c.categories.iter().any(|cat| cat == category));
        Ok(components)
    }

    /// The dynamic resolver used at build time: within a category, find the
    /// component whose name contains `needle` (case-insensitive), preferring
    /// system components, then alphabetical order. `None` when nothing
    /// matches; callers log and skip.
    pub fn find_by_category_and_name(
        &self,
        category: &str,
        needle: &str,
    ) -> Result<Option<Component>> {
        let needle_lower = needle.to_lowercase();
        let mut candidates = self.list_by_category(category)?;
        candidates.retain(|c| c.name.to_lowercase().contains(&needle_lower));
        candidates.sort_by(|a, b| {
            b.is_system
                .cmp(&a.is_system)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(candidates.into_iter().next())
    }

    /// Full-row update. The id, system flag and timestamps are controlled
    /// here, not by the caller.
    pub fn update(&self, component: &Component) -> Result<Component> {
        if component.categories.is_empty() {
            return Err(CoreError::InvalidInput("component needs at least one category".into()).into());
        }
        let owner_id = if component.is_system {
            None
        } else {
            component.owner_id.clone()
        };

        self.store.with_tx(|tx| {
            let updated = tx
                .execute(
                    "UPDATE components SET
                        name = ?2, categories = ?3, display_name = ?4, description = ?5,
                        artifact_pattern = ?6, default_url_template = ?7, forge_url_template = ?8,
                        is_optional = ?9, owner_id = ?10, is_kernel_module = ?11,
                        is_userspace = ?12, default_version = ?13, default_version_rule = ?14,
                        supported_architectures = ?15, updated_at = ?16
                     WHERE id = ?1",
                    params![
                        component.id,
                        component.name,
                        util::join_csv(&component.categories),
                        component.display_name,
                        component.description,
                        component.artifact_pattern,
                        component.default_url_template,
                        component.forge_url_template,
                        component.is_optional as i64,
                        owner_id,
                        component.is_kernel_module as i64,
                        component.is_userspace as i64,
                        component.default_version,
                        component.default_version_rule.to_string(),
                        util::join_arches(&component.supported_architectures),
                        util::ts(Utc::now()),
                    ],
                )
                .with_context(|| format!("failed to update component {}", component.id))?;
            if updated == 0 {
                return Err(CoreError::NotFound(format!("component {}", component.id)).into());
            }
            fetch_by_id(tx, &component.id)?.context("component vanished after update")
        })
    }

    /// Persist a re-resolved default version.
    pub fn set_default_version(&self, id: &str, version: &str) -> Result<()> {
        self.store.with_conn(|conn| {
            let updated = conn
                .execute(
                    "UPDATE components SET default_version = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, version, util::ts(Utc::now())],
                )
                .with_context(|| format!("failed to set default version for {}", id))?;
            if updated == 0 {
                return Err(CoreError::NotFound(format!("component {}", id)).into());
            }
            Ok(())
        })
    }

    /// Delete a user component. System components are never deletable;
    /// bound upstreams lose the binding, the component's jobs cascade away.
    pub fn delete(&self, id: &str) -> Result<()> {
        self.store.with_tx(|tx| {
            let raw = tx
                .query_row(
                    &format!("SELECT {} FROM components WHERE id = ?1", COMPONENT_COLS),
                    params![id],
                    read_row,
                )
                .optional()
                .with_context(|| format!("failed to read component {}", id))?;
            let component = match raw {
                Some(raw) => raw.into_component()?,
                None => return Err(CoreError::NotFound(format!("component {}", id)).into()),
            };
            if component.is_system {
                return Err(CoreError::Forbidden(format!(
                    "system component {} cannot be deleted",
                    component.name
                ))
                .into());
            }

            // Unbind from every source that served it (SET NULL semantics on
            // the id-set column).
            let mut stmt = tx
                .prepare("SELECT id, component_ids FROM upstream_sources")
                .context("failed to prepare source scan")?;
            let bindings: Vec<(String, String)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .context("failed to scan sources")?
                .collect::<rusqlite::Result<_>>()
                .context("failed to read source bindings")?;
            for (source_id, encoded) in bindings {
                let mut ids = util::parse_ids(&encoded)?;
                let before = ids.len();
                ids.retain(|bound| bound != id);
                if ids.len() != before {
                    tx.execute(
                        "UPDATE upstream_sources SET component_ids = ?2, updated_at = ?3 WHERE id = ?1",
                        params![source_id, util::join_ids(&ids)?, util::ts(Utc::now())],
                    )
                    .context("failed to unbind component from source")?;
                }
            }

            tx.execute("DELETE FROM components WHERE id = ?1", params![id])
                .with_context(|| format!("failed to delete component {}", id))?;
            debug!(component = %component.name, "component deleted");
            Ok(())
        })
    }
}

struct RawComponent {
    id: String,
    name: String,
    categories: String,
    display_name: String,
    description: String,
    artifact_pattern: Option<String>,
    default_url_template: Option<String>,
    forge_url_template: Option<String>,
    is_optional: i64,
    is_system: i64,
    owner_id: Option<String>,
    is_kernel_module: i64,
    is_userspace: i64,
    default_version: Option<String>,
    default_version_rule: String,
    supported_architectures: String,
    created_at: String,
    updated_at: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawComponent> {
    Ok(RawComponent {
        id: row.get(0)?,
        name: row.get(1)?,
        categories: row.get(2)?,
        display_name: row.get(3)?,
        description: row.get(4)?,
        artifact_pattern: row.get(5)?,
        default_url_template: row.get(6)?,
        forge_url_template: row.get(7)?,
        is_optional: row.get(8)?,
        is_system: row.get(9)?,
        owner_id: row.get(10)?,
        is_kernel_module: row.get(11)?,
        is_userspace: row.get(12)?,
        default_version: row.get(13)?,
        default_version_rule: row.get(14)?,
        supported_architectures: row.get(15)?,
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}

impl RawComponent {
    fn into_component(self) -> Result<Component> {
        Ok(Component {
            categories: util::split_csv(&self.categories),
            default_version_rule: self.default_version_rule.parse()?,
            supported_architectures: util::parse_arches(&self.supported_architectures)?,
            is_optional: util::bool_col(self.is_optional),
            is_system: util::bool_col(self.is_system),
            is_kernel_module: util::bool_col(self.is_kernel_module),
            is_userspace: util::bool_col(self.is_userspace),
            created_at: util::parse_ts(&self.created_at)?,
            updated_at: util::parse_ts(&self.updated_at)?,
            id: self.id,
            name: self.name,
            display_name: self.display_name,
            description: self.description,
            artifact_pattern: self.artifact_pattern,
            default_url_template: self.default_url_template,
            forge_url_template: self.forge_url_template,
            owner_id: self.owner_id,
            default_version: self.default_version,
        })
    }
}

fn fetch_by_id(tx: &rusqlite::Transaction<'_>, id: &str) -> Result<Option<Component>> {
    let raw = tx
        .query_row(
            &format!("SELECT {} FROM components WHERE id = ?1", COMPONENT_COLS),
            params![id],
            read_row,
        )
        .optional()
        .with_context(|| format!("failed to re-read component {}", id))?;
    raw.map(RawComponent::into_component).transpose()
}
