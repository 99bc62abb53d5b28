//! Catalog services over the component and upstream-source tables.
//!
//! This crate layers three things on top of the raw repositories in
//! `distsmith-db`:
//!
//! - the permission contract exported to the HTTP layer (system resources
//!   are world-readable and admin-mutable, user resources belong to their
//!   owner, system resources are never deletable),
//! - the dynamic component resolver used at build time (category +
//!   name-fragment lookup),
//! - effective-source selection: per-distribution override first, then the
//!   first enabled source from the merged system + own-user list ordered by
//!   `(priority, name)`, and version resolution against the component's
//!   default-version rule.

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use distsmith_db::{NewComponent, NewUpstreamSource, Store};
use distsmith_types::{
    Actor, Component, CoreError, DistSourceOverride, UpstreamSource, VersionRule,
};

mod permissions;

pub use permissions::{ensure_can_delete, ensure_can_modify};

/// A component with the source and version a build will use for it.
#[derive(Debug, Clone)]
pub struct ResolvedComponent {
    pub component: Component,
    pub source: UpstreamSource,
    pub version: String,
}

/// Catalog facade held by the server core.
#[derive(Clone)]
pub struct Catalog {
    store: Arc<Store>,
}

impl Catalog {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    // Component CRUD under the permission contract.

    pub fn create_component(&self, actor: &Actor, mut new: NewComponent) -> Result<Component> {
        if new.is_system && !actor.is_admin {
            return Err(
                CoreError::Forbidden("only admins may create system components".into()).into(),
            );
        }
        if !new.is_system && new.owner_id.is_none() {
            new.owner_id = actor.user_id.clone();
        }
        self.store.components().create(new)
    }

    pub fn update_component(&self, actor: &Actor, component: &Component) -> Result<Component> {
        let current = self
            .store
            .components()
            .get(&component.id)?
            .ok_or_else(|| CoreError::NotFound(format!("component {}", component.id)))?;
        ensure_can_modify(actor, current.is_system, current.owner_id.as_deref())?;
        self.store.components().update(component)
    }

    pub fn delete_component(&self, actor: &Actor, id: &str) -> Result<()> {
        let current = self
            .store
            .components()
            .get(id)?
            .ok_or_else(|| CoreError::NotFound(format!("component {}", id)))?;
        ensure_can_delete(actor, current.is_system, current.owner_id.as_deref())?;
        self.store.components().delete(id)
    }

    pub fn list_components(&self, actor: &Actor) -> Result<Vec<Component>> {
        self.store
            .components()
            .list_visible(actor.user_id.as_deref())
    }

    // Upstream-source CRUD under the permission contract.

    pub fn create_source(&self, actor: &Actor, mut new: NewUpstreamSource) -> Result<UpstreamSource> {
        if new.is_system && !actor.is_admin {
            return Err(CoreError::Forbidden("only admins may create system sources".into()).into());
        }
        if !new.is_system && new.owner_id.is_none() {
            new.owner_id = actor.user_id.clone();
        }
        self.store.sources().create(new)
    }

    pub fn update_source(&self, actor: &Actor, source: &UpstreamSource) -> Result<UpstreamSource> {
        let current = self
            .store
            .sources()
            .get(&source.id)?
            .ok_or_else(|| CoreError::NotFound(format!("source {}", source.id)))?;
        ensure_can_modify(actor, current.is_system, current.owner_id.as_deref())?;
        self.store.sources().update(source)
    }

    pub fn delete_source(&self, actor: &Actor, id: &str) -> Result<()> {
        let current = self
            .store
            .sources()
            .get(id)?
            .ok_or_else(|| CoreError::NotFound(format!("source {}", id)))?;
        ensure_can_delete(actor, current.is_system, current.owner_id.as_deref())?;
        self.store.sources().delete(id)
    }

    pub fn list_sources(&self, actor: &Actor) -> Result<Vec<UpstreamSource>> {
        self.store.sources().list_visible(actor.user_id.as_deref())
    }

    // Per-distribution source pinning.

    pub fn set_source_override(
        &self,
        actor: &Actor,
        distribution_id: &str,
        component_id: &str,
        source_id: &str,
    ) -> Result<DistSourceOverride> {
        // The pinned source must exist and be usable by this user.
        let source = self
            .store
            .sources()
            .get(source_id)?
            .ok_or_else(|| CoreError::NotFound(format!("source {}", source_id)))?;
        if !source.is_system && source.owner_id != actor.user_id && !actor.is_admin {
            return Err(
                CoreError::Forbidden("cannot pin another user's source".into()).into(),
            );
        }
        self.store
            .overrides()
            .set(distribution_id, component_id, source_id)
    }

    pub fn clear_source_override(&self, distribution_id: &str, component_id: &str) -> Result<()> {
        self.store.overrides().delete(distribution_id, component_id)
    }

    // Build-time resolution.

    /// Category + name-fragment lookup (`config.Runtime.Container = "cri-o"`
    /// finds `container-runtime-cri-o`). `None` when nothing matches;
    /// callers log and skip the component.
    pub fn resolve_component(&self, category: &str, needle: &str) -> Result<Option<Component>> {
        self.store
            .components()
            .find_by_category_and_name(category, needle)
    }

    /// The source a build of `component` will fetch from, honoring the
    /// distribution's pin when present, otherwise the first enabled source
    /// from the merged system + own-user list.
    pub fn effective_source(
        &self,
        component_id: &str,
        user_id: Option<&str>,
        distribution_id: Option<&str>,
    ) -> Result<Option<UpstreamSource>> {
        if let Some(distribution_id) = distribution_id
            && let Some(pin) = self.store.overrides().get(distribution_id, component_id)?
        {
            if let Some(source) = self.store.sources().get(&pin.source_id)? {
                if source.enabled {
                    return Ok(Some(source));
                }
                debug!(
                    component_id,
                    source = %source.name,
                    "pinned source is disabled, falling back to ranked list"
                );
            }
        }

        let sources = self.store.sources().list_for_component(component_id, user_id)?;
        Ok(sources.into_iter().next())
    }

    /// The version a build will fetch: an explicit override wins, otherwise
    /// the component's default-version rule against the source's discovered
    /// versions, then stored defaults.
    pub fn resolve_version(
        &self,
        component: &Component,
        source: &UpstreamSource,
        explicit: Option<&str>,
    ) -> Result<Option<String>> {
        if let Some(version) = explicit {
            return Ok(Some(version.to_string()));
        }

        if component.default_version_rule == VersionRule::Pinned {
            return Ok(component
                .default_version
                .clone()
                .or_else(|| source.default_version.clone()));
        }

        if let Some(found) = self
            .store
            .versions()
            .newest_matching(&source.id, component.default_version_rule)?
        {
            return Ok(Some(found.version));
        }

        Ok(component
            .default_version
            .clone()
            .or_else(|| source.default_version.clone()))
    }

    /// Full resolution for one build request leg. `None` when the catalog
    /// has no matching component, no usable source, or no version.
    pub fn resolve_request(
        &self,
        category: &str,
        needle: &str,
        explicit_version: Option<&str>,
        user_id: Option<&str>,
        distribution_id: Option<&str>,
    ) -> Result<Option<ResolvedComponent>> {
        let Some(component) = self.resolve_component(category, needle)? else {
            debug!(category, needle, "no component matches request");
            return Ok(None);
        };
        let Some(source) =
            self.effective_source(&component.id, user_id, distribution_id)?
        else {
            debug!(component = %component.name, "no enabled source serves component");
            return Ok(None);
        };
        let Some(version) = self.resolve_version(&component, &source, explicit_version)? else {
            debug!(component = %component.name, source = %source.name, "no version resolvable");
            return Ok(None);
        };
        Ok(Some(ResolvedComponent {
            component,
            source,
            version,
        }))
    }
}
