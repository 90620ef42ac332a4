// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Validated single-field edits.
//!
//! [`edit_entity_field`] binds the new value through the column setter,
//! compares it with the current value, and merges the edit into the
//! engine's sharded map keyed by (schema index, entity id). Repeated edits
//! to the same field collapse; a later flush materialises the final state,
//! so the dirty bind carries the last value against the original row.

use crate::engine::Engine;
use crate::entity::EntityRef;
use crate::error::{BindError, OrmError};
use crate::value::FieldValue;

pub fn edit_entity_field(
    engine: &Engine,
    entity: &EntityRef,
    field: &str,
    value: impl Into<FieldValue>,
) -> Result<(), OrmError> {
    let value = value.into();
    let (schema, id, marked) = {
        let guard = entity.read();
        (guard.schema().clone(), guard.id(), guard.is_marked_to_delete())
    };
    if marked {
        return Err(BindError::new(field, "setting field in entity marked to delete not allowed").into());
    }
    let column = schema
        .column(field)
        .ok_or_else(|| BindError::new(field, "unknown field"))?;

    let new_bound = column.bind(&value)?;
    {
        let guard = entity.read();
        let current = guard.get(field)?;
        if let Ok(old_bound) = column.bind(&current) {
            if old_bound == new_bound {
                return Ok(());
            }
        }
    }
    // Store the canonical form so repeated edits compare stably.
    let canonical = column.field_from_db(&new_bound)?;
    entity.write().set_raw(field, canonical.clone());

    // Unsaved entities are not addressable by id yet; the edit lives only
    // in the handle the caller holds.
    if id == 0 {
        return Ok(());
    }
    match engine.edited.entry((schema.index, id)) {
        dashmap::mapref::entry::Entry::Occupied(existing) => {
            if !std::sync::Arc::ptr_eq(existing.get(), entity) {
                existing.get().write().set_raw(field, canonical);
            }
        }
        dashmap::mapref::entry::Entry::Vacant(slot) => {
            slot.insert(entity.clone());
        }
    }
    Ok(())
}
