//! The mutation rules exported to the HTTP layer.
//!
//! System resources: readable by anyone, mutable only by admins, never
//! deletable. User resources: mutable and deletable by their owner or an
//! admin. Anonymous actors can read but never mutate.

use anyhow::Result;
use distsmith_types::{Actor, CoreError};

/// Check whether `actor` may mutate a resource.
pub fn ensure_can_modify(actor: &Actor, is_system: bool, owner_id: Option<&str>) -> Result<()> {
    if actor.is_admin {
        return Ok(());
    }
    if is_system {
        return Err(
            CoreError::Forbidden("system resources are mutable only by admins".into()).into(),
        );
    }
    match (&actor.user_id, owner_id) {
        (Some(user), Some(owner)) if user == owner => Ok(()),
        (None, _) => Err(CoreError::Unauthorized.into()),
        _ => Err(CoreError::Forbidden("resource belongs to another user".into()).into()),
    }
}

/// Check whether `actor` may delete a resource. System resources are never
/// deletable, by anyone.
pub fn ensure_can_delete(actor: &Actor, is_system: bool, owner_id: Option<&str>) -> Result<()> {
    if is_system {
        return Err(CoreError::Forbidden("system resources cannot be deleted".into()).into());
    }
    ensure_can_modify(actor, false, owner_id)
}
