// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tracked entity records.
//!
//! An [`Entity`] is a dynamic record bound to one [`EntitySchema`]: it owns
//! its application-side field values and, once loaded or inserted, the
//! `db_data` row vector representing the last DB-known state. Dirty binds
//! are computed by re-binding every field and comparing against `db_data`.
//!
//! Entities are shared as [`EntityRef`] handles so the flush engine can
//! stamp ids and merge binds after batch execution, matching the source's
//! pointer semantics.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{BindError, OrmError};
use crate::schema::{EntitySchema, FAKE_DELETE_COLUMN};
use crate::value::{Bind, DbValue, FieldValue, RefValue};

pub type EntityRef = Arc<RwLock<Entity>>;

/// The two bind maps computed for a dirty entity. For every key in
/// `new_bind` either the key is absent from `old_bind` (insert-only) or the
/// values differ.
#[derive(Debug, Default)]
pub struct DirtyBind {
    pub new_bind: Bind,
    pub old_bind: Bind,
}

#[derive(Debug)]
pub struct Entity {
    schema: Arc<EntitySchema>,
    id: u64,
    fields: HashMap<String, FieldValue>,
    db_data: Option<Vec<DbValue>>,
    loaded: bool,
    in_db: bool,
    delete: bool,
    fake_delete: bool,
    log_meta: serde_json::Map<String, serde_json::Value>,
    on_duplicate_key_update: Option<Bind>,
}

impl Entity {
    #[must_use]
    pub fn new(schema: Arc<EntitySchema>) -> EntityRef {
        Arc::new(RwLock::new(Self {
            schema,
            id: 0,
            fields: HashMap::new(),
            db_data: None,
            loaded: false,
            in_db: false,
            delete: false,
            fake_delete: false,
            log_meta: serde_json::Map::new(),
            on_duplicate_key_update: None,
        }))
    }

    #[must_use]
    pub fn schema(&self) -> &Arc<EntitySchema> {
        &self.schema
    }

    /// 0 means not yet persisted.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_id(&mut self, id: u64) {
        self.id = id;
        if let Some(data) = &mut self.db_data {
            data[0] = DbValue::U64(id);
        }
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    #[must_use]
    pub fn is_in_db(&self) -> bool {
        self.in_db
    }

    #[must_use]
    pub fn is_marked_to_delete(&self) -> bool {
        self.delete || self.fake_delete
    }

    #[must_use]
    pub fn is_force_delete(&self) -> bool {
        self.delete
    }

    #[must_use]
    pub fn is_fake_delete(&self) -> bool {
        self.fake_delete
    }

    /// Soft delete when the schema supports it, hard delete otherwise.
    pub fn mark_to_delete(&mut self) {
        self.fake_delete = true;
    }

    /// Hard delete even on schemas with a soft-delete column.
    pub fn force_mark_to_delete(&mut self) {
        self.delete = true;
    }

    /// Promote a soft delete to a hard one (schema without the column).
    pub(crate) fn promote_fake_delete(&mut self) {
        if self.fake_delete && !self.schema.has_fake_delete {
            self.delete = true;
        }
    }

    #[must_use]
    pub fn db_data(&self) -> Option<&[DbValue]> {
        self.db_data.as_deref()
    }

    pub fn log_meta(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.log_meta
    }

    pub fn set_log_meta(&mut self, key: &str, value: serde_json::Value) {
        self.log_meta.insert(key.to_string(), value);
    }

    pub fn set_on_duplicate_key_update(&mut self, bind: Bind) {
        self.on_duplicate_key_update = Some(bind);
    }

    #[must_use]
    pub fn on_duplicate_key_update(&self) -> Option<&Bind> {
        self.on_duplicate_key_update.as_ref()
    }

    /// Current application value of a column, falling back to the DB-known
    /// value, then to the column's zero value.
    pub fn get(&self, field: &str) -> Result<FieldValue, OrmError> {
        let column = self
            .schema
            .column(field)
            .ok_or_else(|| BindError::new(field, "unknown field"))?;
        if let Some(value) = self.fields.get(field) {
            return Ok(value.clone());
        }
        if let (Some(data), Some(idx)) = (&self.db_data, self.schema.column_mapping.get(field)) {
            return Ok(column.field_from_db(&data[*idx])?);
        }
        Ok(column.default_value())
    }

    /// Set a field without validation; the bind runs at flush time.
    pub fn set(&mut self, field: &str, value: impl Into<FieldValue>) -> Result<(), OrmError> {
        if self.schema.column(field).is_none() {
            return Err(BindError::new(field, "unknown field").into());
        }
        self.fields.insert(field.to_string(), value.into());
        Ok(())
    }

    pub(crate) fn set_raw(&mut self, field: &str, value: FieldValue) {
        self.fields.insert(field.to_string(), value);
    }

    /// Compute the dirty bind. `None` means nothing changed.
    pub fn dirty_bind(&self) -> Result<Option<DirtyBind>, OrmError> {
        if !self.in_db {
            let mut bind = DirtyBind::default();
            for column in self.schema.columns.iter().skip(1) {
                let value = self
                    .fields
                    .get(&column.name)
                    .cloned()
                    .unwrap_or_else(|| column.default_value());
                bind.new_bind.insert(column.name.clone(), column.bind(&value)?);
            }
            return Ok(Some(bind));
        }

        let data = self
            .db_data
            .as_ref()
            .ok_or_else(|| OrmError::NotLoaded { entity: self.schema.entity_name.clone(), id: self.id })?;
        let mut bind = DirtyBind::default();
        for column in self.schema.columns.iter().skip(1) {
            let idx = self.schema.column_mapping[&column.name];
            let old = &data[idx];
            if self.fake_delete && column.name == FAKE_DELETE_COLUMN {
                let new = DbValue::U64(self.id);
                if *old != new {
                    bind.new_bind.insert(column.name.clone(), new);
                    bind.old_bind.insert(column.name.clone(), old.clone());
                }
                continue;
            }
            let Some(value) = self.fields.get(&column.name) else {
                continue;
            };
            let new = column.bind(value)?;
            if new != *old {
                bind.new_bind.insert(column.name.clone(), new);
                bind.old_bind.insert(column.name.clone(), old.clone());
            }
        }
        if bind.new_bind.is_empty() {
            return Ok(None);
        }
        Ok(Some(bind))
    }

    /// Hydrate from a full DB row: id, fields and `db_data`.
    pub fn apply_row(&mut self, row: Vec<DbValue>) -> Result<(), OrmError> {
        if row.len() != self.schema.columns.len() {
            return Err(OrmError::Db(format!(
                "row length {} does not match schema {} ({} columns)",
                row.len(),
                self.schema.entity_name,
                self.schema.columns.len()
            )));
        }
        self.id = match &row[0] {
            DbValue::U64(id) => *id,
            DbValue::I64(id) => *id as u64,
            DbValue::Str(s) => s.parse().unwrap_or(0),
            _ => 0,
        };
        for column in self.schema.columns.iter().skip(1) {
            let idx = self.schema.column_mapping[&column.name];
            let value = column.field_from_db(&row[idx])?;
            self.fields.insert(column.name.clone(), value);
        }
        self.db_data = Some(row);
        self.loaded = true;
        self.in_db = true;
        Ok(())
    }

    /// Merge a bind into `db_data` by column mapping and mark the entity
    /// loaded and persisted.
    pub fn inject_bind(&mut self, bind: &Bind) {
        let len = self.schema.columns.len();
        let data = self.db_data.get_or_insert_with(|| vec![DbValue::Null; len]);
        for (key, value) in bind {
            if let Some(idx) = self.schema.column_mapping.get(key) {
                data[*idx] = value.clone();
            }
        }
        data[0] = DbValue::U64(self.id);
        self.loaded = true;
        self.in_db = true;
    }

    /// Referenced entities that are not yet persisted; the flush engine
    /// saves these first.
    #[must_use]
    pub(crate) fn unsaved_references(&self) -> Vec<EntityRef> {
        let mut out = Vec::new();
        for column in &self.schema.columns {
            match self.fields.get(&column.name) {
                Some(FieldValue::Ref(RefValue::Entity(entity))) => {
                    if entity.read().id() == 0 {
                        out.push(entity.clone());
                    }
                }
                Some(FieldValue::RefList(refs)) => {
                    for r in refs {
                        if let RefValue::Entity(entity) = r {
                            if entity.read().id() == 0 {
                                out.push(entity.clone());
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        out
    }

    /// Drop delete markers (used when a flush is cleared).
    pub(crate) fn reset_delete_marks(&mut self) {
        self.delete = false;
        self.fake_delete = false;
    }
}
