// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transaction-aware DB pool wrapper.
//!
//! Thin adaptor over an injected [`SqlExec`]: every statement is logged
//! with its pool, elapsed time and row counts, and driver errors are
//! classified into the recoverable taxonomy (duplicate key, foreign key)
//! before they propagate.

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::backend::{ExecResult, Row, SqlExec};
use crate::error::OrmError;
use crate::value::DbValue;

#[derive(Clone)]
pub struct Db {
    code: String,
    autoincrement: u64,
    exec: Arc<dyn SqlExec>,
}

impl Db {
    pub fn new(code: &str, autoincrement: u64, exec: Arc<dyn SqlExec>) -> Self {
        Self { code: code.to_string(), autoincrement: autoincrement.max(1), exec }
    }

    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    /// The pool's `auto_increment_increment`, read at registry validation.
    #[must_use]
    pub fn autoincrement(&self) -> u64 {
        self.autoincrement
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.exec.in_transaction()
    }

    pub async fn exec(&self, sql: &str, args: &[DbValue]) -> Result<ExecResult, OrmError> {
        let start = Instant::now();
        let result = self.exec.exec(sql, args).await;
        let elapsed = start.elapsed();
        crate::metrics::record_sql_statement(&self.code, "exec", elapsed);
        match result {
            Ok(res) => {
                debug!(
                    pool = %self.code,
                    sql,
                    rows = res.rows_affected,
                    elapsed_us = elapsed.as_micros() as u64,
                    "EXEC"
                );
                Ok(res)
            }
            Err(OrmError::Db(message)) => {
                debug!(pool = %self.code, sql, error = %message, "EXEC failed");
                Err(OrmError::from_driver(message))
            }
            Err(err) => Err(err),
        }
    }

    pub async fn query(&self, sql: &str, args: &[DbValue]) -> Result<Vec<Row>, OrmError> {
        let start = Instant::now();
        let result = self.exec.query(sql, args).await;
        let elapsed = start.elapsed();
        crate::metrics::record_sql_statement(&self.code, "query", elapsed);
        match result {
            Ok(rows) => {
                debug!(
                    pool = %self.code,
                    sql,
                    rows = rows.len(),
                    elapsed_us = elapsed.as_micros() as u64,
                    "SELECT"
                );
                Ok(rows)
            }
            Err(OrmError::Db(message)) => {
                debug!(pool = %self.code, sql, error = %message, "SELECT failed");
                Err(OrmError::from_driver(message))
            }
            Err(err) => Err(err),
        }
    }

    pub async fn begin(&self) -> Result<(), OrmError> {
        debug!(pool = %self.code, "TRANSACTION START");
        self.exec.begin().await
    }

    pub async fn commit(&self) -> Result<(), OrmError> {
        debug!(pool = %self.code, "TRANSACTION COMMIT");
        self.exec.commit().await
    }

    pub async fn rollback(&self) -> Result<(), OrmError> {
        if !self.exec.in_transaction() {
            return Ok(());
        }
        debug!(pool = %self.code, "TRANSACTION ROLLBACK");
        self.exec.rollback().await
    }
}
