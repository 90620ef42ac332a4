//! Field setters: canonical DB scalar → application value.
//!
//! The symmetric half of the bind pipeline, used when hydrating entities
//! from rows or cached row vectors. Driven by column metadata: nullable
//! columns keep `Null`, non-nullable ones take their zero value.

use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::error::BindError;
use crate::schema::{Column, ColumnKind, DATETIME_LAYOUT, DATE_LAYOUT};
use crate::value::{DbValue, FieldValue, RefValue};

pub fn field_from_db(column: &Column, v: &DbValue) -> Result<FieldValue, BindError> {
    let invalid = || BindError::new(&column.name, "invalid value");
    Ok(match &column.kind {
        ColumnKind::Id | ColumnKind::Uint { .. } => match v {
            DbValue::Null => {
                if column.nullable {
                    FieldValue::Null
                } else {
                    FieldValue::U64(0)
                }
            }
            DbValue::U64(n) => FieldValue::U64(*n),
            DbValue::I64(n) => FieldValue::U64(*n as u64),
            DbValue::Str(s) => FieldValue::U64(s.parse().map_err(|_| invalid())?),
            _ => return Err(invalid()),
        },
        ColumnKind::Int { .. } => match v {
            DbValue::Null => {
                if column.nullable {
                    FieldValue::Null
                } else {
                    FieldValue::I64(0)
                }
            }
            DbValue::I64(n) => FieldValue::I64(*n),
            DbValue::U64(n) => FieldValue::I64(*n as i64),
            DbValue::Str(s) => FieldValue::I64(s.parse().map_err(|_| invalid())?),
            _ => return Err(invalid()),
        },
        ColumnKind::Float { .. } => match v {
            DbValue::Null => {
                if column.nullable {
                    FieldValue::Null
                } else {
                    FieldValue::F64(0.0)
                }
            }
            DbValue::Str(s) => FieldValue::F64(s.parse().map_err(|_| invalid())?),
            DbValue::F64(f) => FieldValue::F64(*f),
            DbValue::U64(n) => FieldValue::F64(*n as f64),
            DbValue::I64(n) => FieldValue::F64(*n as f64),
            _ => return Err(invalid()),
        },
        ColumnKind::String { .. } => match v {
            DbValue::Null => FieldValue::Str(String::new()),
            DbValue::Str(s) => FieldValue::Str(s.clone()),
            _ => return Err(invalid()),
        },
        ColumnKind::Bytes => match v {
            DbValue::Null => FieldValue::Null,
            DbValue::Str(s) => FieldValue::Bytes(s.as_bytes().to_vec()),
            DbValue::Bytes(b) => FieldValue::Bytes(b.clone()),
            _ => return Err(invalid()),
        },
        ColumnKind::Bool => match v {
            DbValue::Null => {
                if column.nullable {
                    FieldValue::Null
                } else {
                    FieldValue::Bool(false)
                }
            }
            DbValue::Bool(b) => FieldValue::Bool(*b),
            DbValue::U64(n) => FieldValue::Bool(*n == 1),
            DbValue::I64(n) => FieldValue::Bool(*n == 1),
            _ => return Err(invalid()),
        },
        ColumnKind::Enum { .. } => match v {
            DbValue::Null => FieldValue::Null,
            DbValue::Str(s) => FieldValue::Str(s.clone()),
            _ => return Err(invalid()),
        },
        ColumnKind::Set { .. } => match v {
            DbValue::Null => FieldValue::Null,
            DbValue::Str(s) => {
                FieldValue::List(s.split(',').map(str::to_string).collect())
            }
            _ => return Err(invalid()),
        },
        ColumnKind::Date => match v {
            DbValue::Null => FieldValue::Null,
            DbValue::Str(s) => {
                let date = NaiveDate::parse_from_str(s, DATE_LAYOUT).map_err(|_| invalid())?;
                let naive = date.and_hms_opt(0, 0, 0).unwrap_or_default();
                FieldValue::Time(Utc.from_utc_datetime(&naive).fixed_offset())
            }
            _ => return Err(invalid()),
        },
        ColumnKind::DateTime => match v {
            DbValue::Null => FieldValue::Null,
            DbValue::Str(s) => {
                let naive =
                    NaiveDateTime::parse_from_str(s, DATETIME_LAYOUT).map_err(|_| invalid())?;
                FieldValue::Time(Utc.from_utc_datetime(&naive).fixed_offset())
            }
            _ => return Err(invalid()),
        },
        ColumnKind::Reference { .. } => match v {
            DbValue::Null => FieldValue::Null,
            DbValue::U64(id) => FieldValue::Ref(RefValue::Id(*id)),
            DbValue::I64(id) => FieldValue::Ref(RefValue::Id(*id as u64)),
            DbValue::Str(s) => FieldValue::Ref(RefValue::Id(s.parse().map_err(|_| invalid())?)),
            _ => return Err(invalid()),
        },
        ColumnKind::ReferenceMany { .. } => match v {
            DbValue::Null => FieldValue::Null,
            DbValue::Str(s) => {
                let ids: Vec<u64> = serde_json::from_str(s).map_err(|_| invalid())?;
                FieldValue::RefList(ids.into_iter().map(RefValue::Id).collect())
            }
            _ => return Err(invalid()),
        },
    })
}
