// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! sqlx-backed SQL executor.
//!
//! Implements [`SqlExec`] over an `AnyPool` so MySQL and SQLite connection
//! strings both work. A transaction, when open, is held inside the adapter
//! and all statements route through it until commit or rollback.
//!
//! ## sqlx Any driver quirks
//!
//! The `Any` driver exposes limited type information, so row decoding
//! probes column types in order (i64, f64, String, bytes) and maps NULLs
//! to [`DbValue::Null`].

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{Any, AnyPool, Row as _, Transaction};
use tokio::sync::Mutex;

use crate::backend::{ExecResult, Row, SqlExec};
use crate::error::OrmError;
use crate::resilience::retry::{retry, RetryConfig};
use crate::value::DbValue;

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

pub struct SqlxExec {
    pool: AnyPool,
    transaction: Mutex<Option<Transaction<'static, Any>>>,
    in_tx: std::sync::atomic::AtomicBool,
}

impl SqlxExec {
    /// Connect with startup-mode retry (fails fast on bad configuration).
    pub async fn connect(connection_string: &str) -> Result<Self, OrmError> {
        install_drivers();
        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(20)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| OrmError::Db(e.to_string()))
        })
        .await?;
        Ok(Self {
            pool,
            transaction: Mutex::new(None),
            in_tx: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn bind_args<'q>(
        mut query: sqlx::query::Query<'q, Any, sqlx::any::AnyArguments<'q>>,
        args: &'q [DbValue],
    ) -> sqlx::query::Query<'q, Any, sqlx::any::AnyArguments<'q>> {
        for arg in args {
            query = match arg {
                DbValue::Null => query.bind(None::<String>),
                DbValue::U64(v) => query.bind(*v as i64),
                DbValue::I64(v) => query.bind(*v),
                DbValue::F64(v) => query.bind(*v),
                DbValue::Str(s) => query.bind(s.as_str()),
                DbValue::Bytes(b) => query.bind(b.as_slice()),
                DbValue::Bool(b) => query.bind(*b),
            };
        }
        query
    }

    fn decode_row(row: &AnyRow) -> Row {
        let mut values = Vec::with_capacity(row.columns().len());
        for (idx, _column) in row.columns().iter().enumerate() {
            let value = if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
                v.map(DbValue::I64).unwrap_or(DbValue::Null)
            } else if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
                v.map(DbValue::F64).unwrap_or(DbValue::Null)
            } else if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
                v.map(DbValue::Str).unwrap_or(DbValue::Null)
            } else if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
                // The Any driver reads TEXT columns as bytes on some drivers.
                v.map(|bytes| match String::from_utf8(bytes) {
                    Ok(s) => DbValue::Str(s),
                    Err(e) => DbValue::Bytes(e.into_bytes()),
                })
                .unwrap_or(DbValue::Null)
            } else {
                DbValue::Null
            };
            values.push(value);
        }
        values
    }
}

#[async_trait]
impl SqlExec for SqlxExec {
    async fn exec(&self, sql: &str, args: &[DbValue]) -> Result<ExecResult, OrmError> {
        let mut guard = self.transaction.lock().await;
        let result = if let Some(tx) = guard.as_mut() {
            // No retry inside an open transaction: a replayed statement
            // would not be atomic with the rest of it.
            Self::bind_args(sqlx::query(sql), args)
                .execute(&mut **tx)
                .await
        } else {
            retry("sql_exec", &RetryConfig::query(), || async {
                Self::bind_args(sqlx::query(sql), args).execute(&self.pool).await
            })
            .await
        }
        .map_err(|e| OrmError::Db(e.to_string()))?;
        Ok(ExecResult {
            last_insert_id: result.last_insert_id().map(|id| id as u64).unwrap_or(0),
            rows_affected: result.rows_affected(),
        })
    }

    async fn query(&self, sql: &str, args: &[DbValue]) -> Result<Vec<Row>, OrmError> {
        let mut guard = self.transaction.lock().await;
        let rows = if let Some(tx) = guard.as_mut() {
            Self::bind_args(sqlx::query(sql), args)
                .fetch_all(&mut **tx)
                .await
        } else {
            retry("sql_query", &RetryConfig::query(), || async {
                Self::bind_args(sqlx::query(sql), args).fetch_all(&self.pool).await
            })
            .await
        }
        .map_err(|e| OrmError::Db(e.to_string()))?;
        Ok(rows.iter().map(Self::decode_row).collect())
    }

    async fn begin(&self) -> Result<(), OrmError> {
        let mut guard = self.transaction.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let tx = self.pool.begin().await.map_err(|e| OrmError::Db(e.to_string()))?;
        *guard = Some(tx);
        self.in_tx.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn commit(&self) -> Result<(), OrmError> {
        let mut guard = self.transaction.lock().await;
        if let Some(tx) = guard.take() {
            tx.commit().await.map_err(|e| OrmError::Db(e.to_string()))?;
        }
        self.in_tx.store(false, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), OrmError> {
        let mut guard = self.transaction.lock().await;
        if let Some(tx) = guard.take() {
            tx.rollback().await.map_err(|e| OrmError::Db(e.to_string()))?;
        }
        self.in_tx.store(false, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_tx.load(std::sync::atomic::Ordering::SeqCst)
    }
}
