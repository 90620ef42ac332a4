// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy.
//!
//! Three kinds are recoverable at call sites: [`BindError`] (reported by
//! `edit_entity_field` and during bind), [`OrmError::DuplicatedKey`] and
//! [`OrmError::ForeignKey`] (detected by the checked flushers from the DB
//! driver message). Everything else is a fault that propagates up to the
//! outermost flush call.

use thiserror::Error;

/// Validation failure for a single column bind.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{field}: {message}")]
pub struct BindError {
    pub field: String,
    pub message: String,
}

impl BindError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self { field: field.into(), message: message.into() }
    }
}

#[derive(Error, Debug)]
pub enum OrmError {
    #[error(transparent)]
    Bind(#[from] BindError),

    /// Unique-index violation, with the index name parsed from the driver
    /// message.
    #[error("{message}")]
    DuplicatedKey { message: String, index: String },

    /// Foreign-key violation, with the constraint name parsed from the
    /// driver message.
    #[error("{message}")]
    ForeignKey { message: String, constraint: String },

    #[error("track limit {0} exceeded")]
    TrackLimitExceeded(usize),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("db error: {0}")]
    Db(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("stream error: {0}")]
    Stream(String),

    /// Lazy flush combined with a feature that cannot be deferred
    /// (ON DUPLICATE KEY UPDATE, unsaved references).
    #[error("lazy flush not supported: {0}")]
    LazyNotSupported(String),

    #[error("entity is not loaded and can't be updated: {entity} [{id}]")]
    NotLoaded { entity: String, id: u64 },

    #[error("entity '{0}' is not registered")]
    UnknownEntity(String),

    #[error("loop detected in indexer for index {index} in pool {pool}")]
    IndexerLoop { index: String, pool: String },
}

impl OrmError {
    /// True for the two error kinds `flush_with_check` reports instead of
    /// propagating as faults.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, OrmError::DuplicatedKey { .. } | OrmError::ForeignKey { .. })
    }

    /// Classify a MySQL driver error message. `Duplicate entry` and foreign
    /// key failures become their typed variants so checked flushers can
    /// return them; anything else stays a plain DB fault.
    pub fn from_driver(message: String) -> Self {
        if message.contains("Duplicate entry") {
            let index = parse_between(&message, "for key '", "'")
                .map(|k| k.rsplit('.').next().unwrap_or(k).to_string())
                .unwrap_or_default();
            return OrmError::DuplicatedKey { message, index };
        }
        if message.contains("foreign key constraint fails") {
            let constraint = parse_between(&message, "CONSTRAINT `", "`")
                .map(str::to_string)
                .unwrap_or_default();
            return OrmError::ForeignKey { message, constraint };
        }
        OrmError::Db(message)
    }
}

fn parse_between<'a>(haystack: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = haystack.find(start)? + start.len();
    let len = haystack[from..].find(end)?;
    Some(&haystack[from..from + len])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_entry_parses_index() {
        let err = OrmError::from_driver(
            "Error 1062: Duplicate entry 'john@example.com' for key 'users.Email'".to_string(),
        );
        match err {
            OrmError::DuplicatedKey { index, .. } => assert_eq!(index, "Email"),
            other => panic!("expected DuplicatedKey, got {other:?}"),
        }
    }

    #[test]
    fn test_foreign_key_parses_constraint() {
        let err = OrmError::from_driver(
            "Error 1452: Cannot add or update a child row: a foreign key constraint fails \
             (`db`.`orders`, CONSTRAINT `orders_user_fk` FOREIGN KEY (`UserID`) REFERENCES `users` (`ID`))"
                .to_string(),
        );
        match err {
            OrmError::ForeignKey { constraint, .. } => assert_eq!(constraint, "orders_user_fk"),
            other => panic!("expected ForeignKey, got {other:?}"),
        }
    }

    #[test]
    fn test_other_errors_stay_db() {
        let err = OrmError::from_driver("Error 1146: Table 'db.missing' doesn't exist".to_string());
        assert!(matches!(err, OrmError::Db(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(OrmError::DuplicatedKey { message: String::new(), index: String::new() }
            .is_recoverable());
        assert!(OrmError::ForeignKey { message: String::new(), constraint: String::new() }
            .is_recoverable());
        assert!(!OrmError::TrackLimitExceeded(10_000).is_recoverable());
    }

    #[test]
    fn test_bind_error_display() {
        let err = BindError::new("Name", "empty string not allowed");
        assert_eq!(err.to_string(), "Name: empty string not allowed");
    }
}
