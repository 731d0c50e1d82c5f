//! SQL dialect capability
//!
//! The allocation engine never spells vendor syntax itself. Sequence draws,
//! timestamps, row limits, row locks, positional placeholders, the
//! insert-ignore idiom and error classification all come from a [`Dialect`]
//! chosen at startup.

use async_trait::async_trait;
use sqlx::PgConnection;

use crate::error::{classify_driver_error, LoaderError, LoaderResult};

#[async_trait]
pub trait Dialect: Send + Sync + std::fmt::Debug {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Query returning the next value of `sequence` as a single BIGINT column
    fn sequence_query(&self, sequence: &str) -> String;

    /// Expression evaluating to the store's current timestamp
    fn current_timestamp(&self) -> &'static str;

    /// Clause restricting a SELECT to at most `n` rows
    fn limit_clause(&self, n: u32) -> String;

    /// Clause appended to a SELECT to lock the selected rows in scan order
    fn lock_rows_clause(&self) -> &'static str;

    /// Positional bind parameter, 1-based
    fn placeholder(&self, index: usize) -> String;

    /// `WITH` prefix binding `query` to `name`, evaluated exactly once
    fn materialized_cte(&self, name: &str, query: &str) -> String;

    /// Expression for "now minus `millis_param` milliseconds", where
    /// `millis_param` is a placeholder bound to a BIGINT
    fn timestamp_minus_millis(&self, millis_param: &str) -> String;

    /// Multi-row INSERT of `rows` rows into `columns` that silently skips rows
    /// colliding on `conflict_columns`. Parameters are numbered row-major.
    fn upsert_statement(
        &self,
        table: &str,
        columns: &[&str],
        conflict_columns: &[&str],
        rows: usize,
    ) -> String;

    /// Whether `err` is a unique-constraint violation
    fn is_duplicate_key(&self, err: &sqlx::Error) -> bool;

    /// Translate a driver error into the loader taxonomy
    fn classify(&self, err: sqlx::Error) -> LoaderError;

    /// Draw the next value from `sequence`
    async fn next_sequence_value(
        &self,
        conn: &mut PgConnection,
        sequence: &str,
    ) -> LoaderResult<i64> {
        let value: Option<i64> = sqlx::query_scalar(&self.sequence_query(sequence))
            .fetch_optional(conn)
            .await
            .map_err(|e| self.classify(e))?;

        value.ok_or_else(|| {
            LoaderError::invariant(format!("sequence {} returned no value", sequence))
        })
    }
}

/// PostgreSQL dialect
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

/// SQLSTATE classes that indicate a connection-level or retryable failure
const PG_TRANSIENT_PREFIXES: &[&str] = &["08", "57P", "53"];
const PG_TRANSIENT_CODES: &[&str] = &["40001", "40P01"];
const PG_UNIQUE_VIOLATION: &str = "23505";

#[async_trait]
impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn sequence_query(&self, sequence: &str) -> String {
        format!("SELECT nextval('{}')", sequence)
    }

    fn current_timestamp(&self) -> &'static str {
        "CURRENT_TIMESTAMP"
    }

    fn limit_clause(&self, n: u32) -> String {
        format!("LIMIT {}", n)
    }

    fn lock_rows_clause(&self) -> &'static str {
        "FOR UPDATE"
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn materialized_cte(&self, name: &str, query: &str) -> String {
        format!("WITH {} AS MATERIALIZED ({})", name, query)
    }

    fn timestamp_minus_millis(&self, millis_param: &str) -> String {
        format!(
            "({} - ({} * INTERVAL '1 millisecond'))",
            self.current_timestamp(),
            millis_param
        )
    }

    fn upsert_statement(
        &self,
        table: &str,
        columns: &[&str],
        conflict_columns: &[&str],
        rows: usize,
    ) -> String {
        let width = columns.len();
        let values = (0..rows)
            .map(|row| {
                let params = (1..=width)
                    .map(|col| self.placeholder(row * width + col))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("({})", params)
            })
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "INSERT INTO {} ({}) VALUES {} ON CONFLICT ({}) DO NOTHING",
            table,
            columns.join(", "),
            values,
            conflict_columns.join(", ")
        )
    }

    fn is_duplicate_key(&self, err: &sqlx::Error) -> bool {
        err.as_database_error()
            .and_then(|db| db.code())
            .is_some_and(|code| code == PG_UNIQUE_VIOLATION)
    }

    fn classify(&self, err: sqlx::Error) -> LoaderError {
        let transient = err
            .as_database_error()
            .and_then(|db| db.code())
            .is_some_and(|code| {
                PG_TRANSIENT_CODES.iter().any(|c| *c == code)
                    || PG_TRANSIENT_PREFIXES.iter().any(|p| code.starts_with(p))
            });

        if transient {
            LoaderError::Transient(err)
        } else {
            classify_driver_error(err)
        }
    }
}
