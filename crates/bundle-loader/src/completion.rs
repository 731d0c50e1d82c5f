//! Completion tracker
//!
//! A lease is completed exactly once. Repeated calls (a retried RPC, a
//! duplicate message) find `completed_at` already set and change nothing.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::db::Store;
use crate::error::LoaderResult;
use crate::types::Lease;

#[derive(Debug, Clone)]
pub struct CompletionTracker {
    store: Store,
}

#[derive(FromRow)]
struct LeaseRow {
    id: i64,
    work_item_id: i64,
    allocation_id: i64,
    owner_instance_id: i64,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    failure_count: Option<i32>,
    rows_processed: Option<i32>,
    version: i32,
}

impl From<LeaseRow> for Lease {
    fn from(row: LeaseRow) -> Self {
        Lease {
            id: row.id,
            work_item_id: row.work_item_id,
            allocation_id: row.allocation_id,
            owner_instance_id: row.owner_instance_id,
            started_at: row.started_at,
            completed_at: row.completed_at,
            failure_count: row.failure_count,
            rows_processed: row.rows_processed,
            version: row.version,
        }
    }
}

impl CompletionTracker {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Record the outcome of a lease. Returns `false` if the lease was already
    /// completed, in which case the stored metrics are left alone.
    pub async fn mark_done(
        &self,
        lease_id: i64,
        failure_count: i32,
        rows_processed: i32,
    ) -> LoaderResult<bool> {
        let d = self.store.dialect();
        let sql = format!(
            "UPDATE leases SET completed_at = {}, failure_count = {}, rows_processed = {} \
             WHERE id = {} AND completed_at IS NULL",
            d.current_timestamp(),
            d.placeholder(1),
            d.placeholder(2),
            d.placeholder(3)
        );

        let updated = sqlx::query(&sql)
            .bind(failure_count)
            .bind(rows_processed)
            .bind(lease_id)
            .execute(self.store.pool())
            .await
            .map_err(|e| self.store.classify(e))?
            .rows_affected();

        if updated == 0 {
            tracing::debug!(lease_id, "Lease already completed, keeping recorded metrics");
            return Ok(false);
        }

        tracing::info!(lease_id, failure_count, rows_processed, "Lease completed");
        Ok(true)
    }

    /// Record a line of a bundle that could not be ingested
    pub async fn record_error(
        &self,
        lease_id: i64,
        line_number: i64,
        message: &str,
    ) -> LoaderResult<()> {
        let d = self.store.dialect();
        let sql = format!(
            "INSERT INTO load_errors (lease_id, line_number, message, recorded_at) \
             VALUES ({}, {}, {}, {})",
            d.placeholder(1),
            d.placeholder(2),
            d.placeholder(3),
            d.current_timestamp()
        );

        sqlx::query(&sql)
            .bind(lease_id)
            .bind(line_number)
            .bind(message)
            .execute(self.store.pool())
            .await
            .map_err(|e| self.store.classify(e))?;

        tracing::warn!(lease_id, line_number, error = message, "Bundle line failed to load");
        Ok(())
    }

    pub async fn error_count(&self, lease_id: i64) -> LoaderResult<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM load_errors WHERE lease_id = {}",
            self.store.dialect().placeholder(1)
        );

        sqlx::query_scalar(&sql)
            .bind(lease_id)
            .fetch_one(self.store.pool())
            .await
            .map_err(|e| self.store.classify(e))
    }

    pub async fn lease(&self, lease_id: i64) -> LoaderResult<Option<Lease>> {
        let sql = format!("{} WHERE id = {}", SELECT_LEASE, self.store.dialect().placeholder(1));

        let row: Option<LeaseRow> = sqlx::query_as(&sql)
            .bind(lease_id)
            .fetch_optional(self.store.pool())
            .await
            .map_err(|e| self.store.classify(e))?;

        Ok(row.map(Lease::from))
    }

    /// Every lease ever taken on a work item, oldest first
    pub async fn leases_for(&self, work_item_id: i64) -> LoaderResult<Vec<Lease>> {
        let sql = format!(
            "{} WHERE work_item_id = {} ORDER BY id",
            SELECT_LEASE,
            self.store.dialect().placeholder(1)
        );

        let rows: Vec<LeaseRow> = sqlx::query_as(&sql)
            .bind(work_item_id)
            .fetch_all(self.store.pool())
            .await
            .map_err(|e| self.store.classify(e))?;

        Ok(rows.into_iter().map(Lease::from).collect())
    }
}

const SELECT_LEASE: &str = "SELECT id, work_item_id, allocation_id, owner_instance_id, started_at, \
     completed_at, failure_count, rows_processed, version FROM leases";
