// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bind setters: application value → canonical DB scalar.
//!
//! One setter per logical column type, each enforcing its validation rules
//! (nullability, length, numeric range, enum membership, UTC-only
//! timestamps, reference-type match). Canonical forms are what lands in SQL
//! parameters and cache computations: integers as `U64`/`I64`, floats as
//! fixed-format strings rounded to the column precision, temporal values as
//! layout-formatted strings, SET columns as comma-joined member lists.

use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::error::BindError;
use crate::schema::{Column, ColumnKind, EnumDefinition, DATETIME_LAYOUT, DATE_LAYOUT};
use crate::value::{DbValue, FieldValue, RefValue};

pub fn bind_value(column: &Column, v: &FieldValue) -> Result<DbValue, BindError> {
    match &column.kind {
        ColumnKind::Id => bind_number(&column.name, v, true, false, 0, u64::MAX),
        ColumnKind::Uint { max } => bind_number(&column.name, v, true, column.nullable, 0, *max),
        ColumnKind::Int { min, max } => bind_number(&column.name, v, false, column.nullable, *min, *max),
        ColumnKind::Float { unsigned, precision, decimal_size } => {
            bind_float(&column.name, v, *unsigned, column.nullable, *precision, *decimal_size)
        }
        ColumnKind::String { length, required } => bind_string(&column.name, v, *length, *required),
        ColumnKind::Bytes => bind_bytes(&column.name, v),
        ColumnKind::Bool => bind_bool(&column.name, v, column.nullable),
        ColumnKind::Enum { def, required } => bind_enum(&column.name, v, def, *required),
        ColumnKind::Set { def, required } => bind_set(&column.name, v, def, *required),
        ColumnKind::Date => bind_date(&column.name, v, column.nullable, DATE_LAYOUT),
        ColumnKind::DateTime => bind_date(&column.name, v, column.nullable, DATETIME_LAYOUT),
        ColumnKind::Reference { entity, .. } => bind_reference(&column.name, v, entity, column.nullable),
        ColumnKind::ReferenceMany { .. } => bind_reference_many(&column.name, v),
    }
}

/// Cache-comparable string form. Booleans render `"1"`/`"0"`, temporal
/// values the layout-formatted string, floats the canonical fixed form.
pub fn attr_to_string(column: &Column, v: &FieldValue) -> Result<String, BindError> {
    let bound = bind_value(column, v)?;
    Ok(bound.to_attr_string())
}

fn nil_not_allowed(column: &str) -> BindError {
    BindError::new(column, "nil is not allowed")
}

enum Num {
    Unsigned(u64),
    Signed(i64),
    Nil,
}

fn numeric(column: &str, v: &FieldValue, unsigned: bool) -> Result<Num, BindError> {
    Ok(match v {
        FieldValue::Null => Num::Nil,
        FieldValue::U64(n) => Num::Unsigned(*n),
        FieldValue::I64(n) => Num::Signed(*n),
        // Floats are truncated toward zero.
        FieldValue::F64(f) => Num::Signed(*f as i64),
        FieldValue::Str(s) => {
            if unsigned {
                Num::Unsigned(
                    s.parse::<u64>()
                        .map_err(|_| BindError::new(column, format!("invalid number {s}")))?,
                )
            } else {
                Num::Signed(
                    s.parse::<i64>()
                        .map_err(|_| BindError::new(column, format!("invalid number {s}")))?,
                )
            }
        }
        _ => return Err(BindError::new(column, "invalid value")),
    })
}

fn bind_number(
    column: &str,
    v: &FieldValue,
    unsigned: bool,
    nullable: bool,
    min: i64,
    max: u64,
) -> Result<DbValue, BindError> {
    let num = numeric(column, v, unsigned)?;
    if matches!(num, Num::Nil) {
        if !nullable {
            return Err(nil_not_allowed(column));
        }
        return Ok(DbValue::Null);
    }
    if unsigned {
        let value = match num {
            Num::Unsigned(n) => n,
            Num::Signed(n) if n < 0 => {
                return Err(BindError::new(column, format!("negative number {n} not allowed")))
            }
            Num::Signed(n) => n as u64,
            Num::Nil => unreachable!(),
        };
        if value > max {
            return Err(BindError::new(column, format!("value {value} exceeded max allowed value")));
        }
        Ok(DbValue::U64(value))
    } else {
        let value = match num {
            Num::Signed(n) => n,
            Num::Unsigned(n) => {
                if n > i64::MAX as u64 {
                    return Err(BindError::new(column, format!("value {n} exceeded max allowed value")));
                }
                n as i64
            }
            Num::Nil => unreachable!(),
        };
        if value > 0 && value as u64 > max {
            return Err(BindError::new(column, format!("value {value} exceeded max allowed value")));
        }
        if value < 0 && value < min {
            return Err(BindError::new(column, format!("value {value} exceeded min allowed value")));
        }
        Ok(DbValue::I64(value))
    }
}

fn bind_float(
    column: &str,
    v: &FieldValue,
    unsigned: bool,
    nullable: bool,
    precision: usize,
    decimal_size: i32,
) -> Result<DbValue, BindError> {
    let value = match v {
        FieldValue::Null => {
            if !nullable {
                return Err(nil_not_allowed(column));
            }
            return Ok(DbValue::Null);
        }
        FieldValue::F64(f) => *f,
        FieldValue::U64(n) => *n as f64,
        FieldValue::I64(n) => *n as f64,
        FieldValue::Str(s) => s
            .parse::<f64>()
            .map_err(|_| BindError::new(column, format!("invalid number {s}")))?,
        _ => return Err(BindError::new(column, "invalid value")),
    };
    if unsigned && value < 0.0 {
        return Err(BindError::new(column, format!("negative number {value} not allowed")));
    }
    if value == 0.0 {
        return Ok(DbValue::Str("0".to_string()));
    }
    let factor = 10f64.powi(precision as i32);
    let rounded = (value * factor).round() / factor;
    let formatted = format!("{rounded:.precision$}");
    if decimal_size != -1 {
        if let Some(dot) = formatted.find('.') {
            if dot as i32 > decimal_size {
                return Err(BindError::new(
                    column,
                    format!("decimal size too big, max {decimal_size} allowed"),
                ));
            }
        }
    }
    Ok(DbValue::Str(formatted))
}

fn bind_string(column: &str, v: &FieldValue, length: usize, required: bool) -> Result<DbValue, BindError> {
    let empty = || {
        if required {
            Err(BindError::new(column, "empty string not allowed"))
        } else {
            Ok(DbValue::Null)
        }
    };
    match v {
        FieldValue::Null => empty(),
        FieldValue::Str(s) if s.is_empty() => empty(),
        FieldValue::Str(s) => {
            if length > 0 && s.len() > length {
                return Err(BindError::new(column, format!("text too long, max {length} allowed")));
            }
            Ok(DbValue::Str(s.clone()))
        }
        _ => Err(BindError::new(column, "invalid value")),
    }
}

fn bind_bytes(column: &str, v: &FieldValue) -> Result<DbValue, BindError> {
    match v {
        FieldValue::Null => Ok(DbValue::Null),
        FieldValue::Str(s) if s.is_empty() => Ok(DbValue::Null),
        FieldValue::Str(s) => Ok(DbValue::Str(s.clone())),
        FieldValue::Bytes(b) if b.is_empty() => Ok(DbValue::Null),
        FieldValue::Bytes(b) => Ok(DbValue::Str(String::from_utf8_lossy(b).into_owned())),
        _ => Err(BindError::new(column, "invalid value")),
    }
}

fn bind_bool(column: &str, v: &FieldValue, nullable: bool) -> Result<DbValue, BindError> {
    match v {
        FieldValue::Null => {
            if nullable {
                Ok(DbValue::Null)
            } else {
                Err(nil_not_allowed(column))
            }
        }
        FieldValue::Bool(b) => Ok(DbValue::Bool(*b)),
        FieldValue::U64(n) => Ok(DbValue::Bool(*n == 1)),
        FieldValue::I64(n) => Ok(DbValue::Bool(*n == 1)),
        FieldValue::Str(s) => {
            let s = s.to_lowercase();
            Ok(DbValue::Bool(s == "true" || s == "1" || s == "yes"))
        }
        _ => Err(BindError::new(column, "invalid value")),
    }
}

fn bind_enum(
    column: &str,
    v: &FieldValue,
    def: &EnumDefinition,
    required: bool,
) -> Result<DbValue, BindError> {
    let as_string = match v {
        FieldValue::Null => None,
        FieldValue::Str(s) if s.is_empty() => None,
        FieldValue::Str(s) => Some(s.clone()),
        _ => return Err(BindError::new(column, "invalid value")),
    };
    match as_string {
        None => {
            if required {
                Err(nil_not_allowed(column))
            } else {
                Ok(DbValue::Null)
            }
        }
        Some(s) => {
            if !def.has(&s) {
                return Err(BindError::new(column, format!("invalid value: {s}")));
            }
            Ok(DbValue::Str(s))
        }
    }
}

fn bind_set(
    column: &str,
    v: &FieldValue,
    def: &EnumDefinition,
    required: bool,
) -> Result<DbValue, BindError> {
    let empty = || {
        if required {
            Err(nil_not_allowed(column))
        } else {
            Ok(DbValue::Null)
        }
    };
    let canonical = match v {
        FieldValue::Null => return empty(),
        FieldValue::List(values) => values.join(","),
        FieldValue::Str(s) => s.trim_matches(['[', ']']).replace(' ', ","),
        _ => return Err(BindError::new(column, "invalid value")),
    };
    if canonical.is_empty() {
        return empty();
    }
    for member in canonical.split(',') {
        if !def.has(member) {
            return Err(BindError::new(column, format!("invalid value: {member}")));
        }
    }
    Ok(DbValue::Str(canonical))
}

fn bind_date(column: &str, v: &FieldValue, nullable: bool, layout: &str) -> Result<DbValue, BindError> {
    match v {
        FieldValue::Null => {
            if nullable {
                Ok(DbValue::Null)
            } else {
                Err(nil_not_allowed(column))
            }
        }
        FieldValue::Time(t) => {
            if t.offset().local_minus_utc() != 0 {
                return Err(BindError::new(column, "time must be in UTC location"));
            }
            Ok(DbValue::Str(t.format(layout).to_string()))
        }
        FieldValue::Str(s) => {
            let parsed = if layout == DATE_LAYOUT {
                NaiveDate::parse_from_str(s, layout)
                    .map(|d| d.and_hms_opt(0, 0, 0).unwrap_or_default())
            } else {
                NaiveDateTime::parse_from_str(s, layout)
            };
            let naive = parsed.map_err(|_| BindError::new(column, format!("invalid time {s}")))?;
            let utc = Utc.from_utc_datetime(&naive);
            Ok(DbValue::Str(utc.format(layout).to_string()))
        }
        _ => Err(BindError::new(column, "invalid value")),
    }
}

fn bind_reference(
    column: &str,
    v: &FieldValue,
    target_entity: &str,
    nullable: bool,
) -> Result<DbValue, BindError> {
    let null = || {
        if nullable {
            Ok(DbValue::Null)
        } else {
            Err(nil_not_allowed(column))
        }
    };
    let id = match v {
        FieldValue::Null => return null(),
        FieldValue::Ref(RefValue::Id(id)) => *id,
        FieldValue::Ref(RefValue::Entity(entity)) => {
            let guard = entity.read();
            if guard.schema().entity_name != target_entity {
                return Err(BindError::new(column, "invalid reference type"));
            }
            guard.id()
        }
        other => match bind_number(column, other, true, nullable, 0, u64::MAX)? {
            DbValue::U64(id) => id,
            _ => return null(),
        },
    };
    if id == 0 {
        return null();
    }
    Ok(DbValue::U64(id))
}

fn bind_reference_many(column: &str, v: &FieldValue) -> Result<DbValue, BindError> {
    match v {
        FieldValue::Null => Ok(DbValue::Null),
        FieldValue::RefList(refs) => {
            if refs.is_empty() {
                return Ok(DbValue::Null);
            }
            let mut ids = Vec::with_capacity(refs.len());
            for r in refs {
                let id = r.id();
                if id == 0 {
                    return Err(BindError::new(column, "nil is not allowed"));
                }
                ids.push(id);
            }
            Ok(DbValue::Str(
                serde_json::to_string(&ids).map_err(|_| BindError::new(column, "invalid value"))?,
            ))
        }
        _ => Err(BindError::new(column, "invalid value")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    fn bind(column: &Column, v: FieldValue) -> Result<DbValue, BindError> {
        column.bind(&v)
    }

    #[test]
    fn test_uint_accepts_strings_and_floats() {
        let col = Column::uint("Age", 255);
        assert_eq!(bind(&col, "42".into()).unwrap(), DbValue::U64(42));
        assert_eq!(bind(&col, FieldValue::F64(7.9)).unwrap(), DbValue::U64(7));
        assert_eq!(bind(&col, FieldValue::I64(3)).unwrap(), DbValue::U64(3));
    }

    #[test]
    fn test_uint_rejects_negative_and_overflow() {
        let col = Column::uint("Age", 255);
        let err = bind(&col, FieldValue::I64(-5)).unwrap_err();
        assert_eq!(err.message, "negative number -5 not allowed");
        let err = bind(&col, FieldValue::U64(256)).unwrap_err();
        assert_eq!(err.message, "value 256 exceeded max allowed value");
        let err = bind(&col, FieldValue::Str("abc".into())).unwrap_err();
        assert_eq!(err.message, "invalid number abc");
    }

    #[test]
    fn test_number_null_handling() {
        let required = Column::uint("Age", 255);
        let err = bind(&required, FieldValue::Null).unwrap_err();
        assert_eq!(err.message, "nil is not allowed");
        let nullable = Column::uint("Age", 255).nullable();
        assert_eq!(bind(&nullable, FieldValue::Null).unwrap(), DbValue::Null);
    }

    #[test]
    fn test_int_range() {
        let col = Column::int("Delta", -128, 127);
        assert_eq!(bind(&col, FieldValue::I64(-128)).unwrap(), DbValue::I64(-128));
        let err = bind(&col, FieldValue::I64(-129)).unwrap_err();
        assert_eq!(err.message, "value -129 exceeded min allowed value");
        let err = bind(&col, FieldValue::I64(128)).unwrap_err();
        assert_eq!(err.message, "value 128 exceeded max allowed value");
    }

    #[test]
    fn test_float_rounding_and_zero() {
        let col = Column::float("Price", 2);
        assert_eq!(bind(&col, FieldValue::F64(0.0)).unwrap(), DbValue::Str("0".into()));
        assert_eq!(bind(&col, FieldValue::F64(1.005)).unwrap(), DbValue::Str("1.00".into()));
        assert_eq!(bind(&col, FieldValue::F64(2.346)).unwrap(), DbValue::Str("2.35".into()));
        assert_eq!(bind(&col, "3.1".into()).unwrap(), DbValue::Str("3.10".into()));
    }

    #[test]
    fn test_float_below_precision_keeps_fixed_form() {
        // Only an exact zero canonicalises to "0"; values that merely
        // round to zero keep the fixed-format rendering.
        let col = Column::float("Price", 2);
        assert_eq!(bind(&col, FieldValue::F64(0.001)).unwrap(), DbValue::Str("0.00".into()));
        assert_eq!(bind(&col, "0.004".into()).unwrap(), DbValue::Str("0.00".into()));
        assert_eq!(bind(&col, FieldValue::F64(0.0)).unwrap(), DbValue::Str("0".into()));
    }

    #[test]
    fn test_float_unsigned_and_decimal_size() {
        let col = Column::float_unsigned("Price", 2);
        let err = bind(&col, FieldValue::F64(-1.5)).unwrap_err();
        assert!(err.message.starts_with("negative number"));

        let col = Column::decimal("Price", 2, 3);
        assert_eq!(bind(&col, FieldValue::F64(999.99)).unwrap(), DbValue::Str("999.99".into()));
        let err = bind(&col, FieldValue::F64(1000.0)).unwrap_err();
        assert_eq!(err.message, "decimal size too big, max 3 allowed");
    }

    #[test]
    fn test_string_rules() {
        let col = Column::string("Name", 5).required();
        assert_eq!(bind(&col, "abc".into()).unwrap(), DbValue::Str("abc".into()));
        let err = bind(&col, "".into()).unwrap_err();
        assert_eq!(err.message, "empty string not allowed");
        let err = bind(&col, "abcdef".into()).unwrap_err();
        assert_eq!(err.message, "text too long, max 5 allowed");

        let optional = Column::string("Name", 0);
        assert_eq!(bind(&optional, "".into()).unwrap(), DbValue::Null);
        assert_eq!(bind(&optional, FieldValue::Null).unwrap(), DbValue::Null);
    }

    #[test]
    fn test_bool_coercions() {
        let col = Column::boolean("Active");
        assert_eq!(bind(&col, true.into()).unwrap(), DbValue::Bool(true));
        assert_eq!(bind(&col, FieldValue::U64(1)).unwrap(), DbValue::Bool(true));
        assert_eq!(bind(&col, FieldValue::U64(2)).unwrap(), DbValue::Bool(false));
        assert_eq!(bind(&col, "YES".into()).unwrap(), DbValue::Bool(true));
        assert_eq!(bind(&col, "no".into()).unwrap(), DbValue::Bool(false));
    }

    #[test]
    fn test_enum_membership() {
        let def = EnumDefinition::new(&["red", "green", "blue"]);
        let col = Column::enumeration("Color", def.clone()).required();
        assert_eq!(bind(&col, "red".into()).unwrap(), DbValue::Str("red".into()));
        let err = bind(&col, "pink".into()).unwrap_err();
        assert_eq!(err.message, "invalid value: pink");
        let err = bind(&col, "".into()).unwrap_err();
        assert_eq!(err.message, "nil is not allowed");

        let optional = Column::enumeration("Color", def);
        assert_eq!(bind(&optional, "".into()).unwrap(), DbValue::Null);
    }

    #[test]
    fn test_set_canonicalisation() {
        let def = EnumDefinition::new(&["a", "b", "c"]);
        let col = Column::set("Flags", def);
        assert_eq!(bind(&col, "[a b]".into()).unwrap(), DbValue::Str("a,b".into()));
        assert_eq!(bind(&col, "a,c".into()).unwrap(), DbValue::Str("a,c".into()));
        assert_eq!(
            bind(&col, FieldValue::List(vec!["b".into(), "c".into()])).unwrap(),
            DbValue::Str("b,c".into())
        );
        let err = bind(&col, "a,x".into()).unwrap_err();
        assert_eq!(err.message, "invalid value: x");
        assert_eq!(bind(&col, FieldValue::Null).unwrap(), DbValue::Null);
    }

    #[test]
    fn test_datetime_requires_utc() {
        let col = Column::datetime("CreatedAt");
        let utc = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 5, 1, 12, 30, 0)
            .unwrap();
        assert_eq!(
            bind(&col, FieldValue::Time(utc)).unwrap(),
            DbValue::Str("2024-05-01 12:30:00".into())
        );
        let offset = FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2024, 5, 1, 12, 30, 0)
            .unwrap();
        let err = bind(&col, FieldValue::Time(offset)).unwrap_err();
        assert_eq!(err.message, "time must be in UTC location");
    }

    #[test]
    fn test_date_parses_strings() {
        let col = Column::date("Born");
        assert_eq!(bind(&col, "1990-03-04".into()).unwrap(), DbValue::Str("1990-03-04".into()));
        let err = bind(&col, "03/04/1990".into()).unwrap_err();
        assert_eq!(err.message, "invalid time 03/04/1990");
    }

    #[test]
    fn test_reference_id_scalars() {
        let col = Column::reference("Author", "User");
        assert_eq!(
            bind(&col, FieldValue::Ref(RefValue::Id(7))).unwrap(),
            DbValue::U64(7)
        );
        assert_eq!(bind(&col, FieldValue::U64(9)).unwrap(), DbValue::U64(9));
        // Zero ids are null-treated.
        assert_eq!(bind(&col, FieldValue::U64(0)).unwrap(), DbValue::Null);
        assert_eq!(bind(&col, FieldValue::Null).unwrap(), DbValue::Null);

        let required = Column::reference("Author", "User").required();
        let err = bind(&required, FieldValue::U64(0)).unwrap_err();
        assert_eq!(err.message, "nil is not allowed");
    }

    #[test]
    fn test_reference_many_canonical_json() {
        let col = Column::reference_many("Tags", "Tag");
        let refs = FieldValue::RefList(vec![RefValue::Id(1), RefValue::Id(3)]);
        assert_eq!(bind(&col, refs).unwrap(), DbValue::Str("[1,3]".into()));
        assert_eq!(bind(&col, FieldValue::RefList(vec![])).unwrap(), DbValue::Null);
        let err = bind(&col, FieldValue::RefList(vec![RefValue::Id(0)])).unwrap_err();
        assert_eq!(err.message, "nil is not allowed");
    }

    #[test]
    fn test_attr_to_string_forms() {
        let flag = Column::boolean("Active");
        assert_eq!(flag.attr_to_string(&true.into()).unwrap(), "1");
        assert_eq!(flag.attr_to_string(&false.into()).unwrap(), "0");

        let date = Column::date("Born");
        assert_eq!(date.attr_to_string(&"1990-03-04".into()).unwrap(), "1990-03-04");

        let price = Column::float("Price", 2);
        assert_eq!(price.attr_to_string(&FieldValue::F64(1.5)).unwrap(), "1.50");
    }
}
