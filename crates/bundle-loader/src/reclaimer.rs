//! Stale allocation reclaimer
//!
//! Any loader instance may run this. Three predicate-guarded statements, each
//! idempotent on its own; a crash part-way through is repaired by the next
//! pass rather than rolled back.

use std::time::Duration;

use crate::config::MAX_RECLAIM_WINDOW;
use crate::db::Store;
use crate::error::LoaderResult;
use crate::types::{InstanceStatus, ReclaimSummary};

#[derive(Debug, Clone)]
pub struct StaleAllocationReclaimer {
    store: Store,
}

/// Windows beyond [`MAX_RECLAIM_WINDOW`] are clamped to it; the store cannot
/// represent intervals much longer.
fn millis(duration: Duration) -> i64 {
    let clamped = duration.min(MAX_RECLAIM_WINDOW);
    i64::try_from(clamped.as_millis()).unwrap_or(i64::MAX)
}

impl StaleAllocationReclaimer {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Mark RUNNING instances whose heartbeat is at least `heartbeat_timeout`
    /// old as STOPPED. Touches no work items.
    pub async fn stop_dead_instances(&self, heartbeat_timeout: Duration) -> LoaderResult<u64> {
        let d = self.store.dialect();
        let sql = format!(
            "UPDATE loader_instances SET status = '{stopped}' \
             WHERE status = '{running}' AND heartbeat_time <= {cutoff}",
            stopped = InstanceStatus::Stopped.as_str(),
            running = InstanceStatus::Running.as_str(),
            cutoff = d.timestamp_minus_millis(&d.placeholder(1)),
        );

        let stopped = sqlx::query(&sql)
            .bind(millis(heartbeat_timeout))
            .execute(self.store.pool())
            .await
            .map_err(|e| self.store.classify(e))?
            .rows_affected();

        if stopped > 0 {
            tracing::info!(
                instances_stopped = stopped,
                heartbeat_timeout_ms = millis(heartbeat_timeout),
                "Marked unresponsive loader instances as stopped"
            );
        }

        Ok(stopped)
    }

    /// Return unfinished work owned by STOPPED instances to the unclaimed
    /// pool. The abandoned lease rows stay as they are. Items marked by an
    /// allocation that died before creating leases are freed as well.
    pub async fn release_abandoned(&self) -> LoaderResult<u64> {
        let sql = format!(
            "UPDATE work_items SET allocation_id = NULL, owner_instance_id = NULL \
             WHERE allocation_id IS NOT NULL \
               AND owner_instance_id IN ( \
                   SELECT id FROM loader_instances WHERE status = '{stopped}') \
               AND NOT EXISTS ( \
                   SELECT 1 FROM leases l \
                   WHERE l.work_item_id = work_items.id \
                     AND l.allocation_id = work_items.allocation_id \
                     AND l.completed_at IS NOT NULL)",
            stopped = InstanceStatus::Stopped.as_str(),
        );

        let released = sqlx::query(&sql)
            .execute(self.store.pool())
            .await
            .map_err(|e| self.store.classify(e))?
            .rows_affected();

        if released > 0 {
            tracing::info!(items_released = released, "Released work items held by stopped instances");
        }

        Ok(released)
    }

    /// Return work whose current lease completed at least `recycle_after` ago
    /// to the unclaimed pool, bumping its version.
    pub async fn recycle_completed(&self, recycle_after: Duration) -> LoaderResult<u64> {
        let d = self.store.dialect();
        let sql = format!(
            "UPDATE work_items \
             SET allocation_id = NULL, owner_instance_id = NULL, version = version + 1 \
             WHERE allocation_id IS NOT NULL \
               AND EXISTS ( \
                   SELECT 1 FROM leases l \
                   WHERE l.work_item_id = work_items.id \
                     AND l.allocation_id = work_items.allocation_id \
                     AND l.completed_at IS NOT NULL \
                     AND l.completed_at <= {cutoff})",
            cutoff = d.timestamp_minus_millis(&d.placeholder(1)),
        );

        let recycled = sqlx::query(&sql)
            .bind(millis(recycle_after))
            .execute(self.store.pool())
            .await
            .map_err(|e| self.store.classify(e))?
            .rows_affected();

        if recycled > 0 {
            tracing::info!(
                items_recycled = recycled,
                recycle_after_secs = recycle_after.as_secs(),
                "Recycled completed work items"
            );
        }

        Ok(recycled)
    }

    /// Run detection, release and (when `recycle_after` is set) recycling
    /// back to back
    pub async fn reclaim_stale(
        &self,
        heartbeat_timeout: Duration,
        recycle_after: Option<Duration>,
    ) -> LoaderResult<ReclaimSummary> {
        let instances_stopped = self.stop_dead_instances(heartbeat_timeout).await?;
        let items_released = self.release_abandoned().await?;
        let items_recycled = match recycle_after {
            Some(after) => self.recycle_completed(after).await?,
            None => 0,
        };

        Ok(ReclaimSummary {
            instances_stopped,
            items_released,
            items_recycled,
        })
    }
}
