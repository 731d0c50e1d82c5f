//! Job allocator
//!
//! Claims a batch of unclaimed work items for one loader instance without any
//! lock manager:
//!
//! 1. Draw a fresh value from `allocation_seq`. It is unique to this call,
//!    which is the whole correctness argument: nobody else can reference it.
//! 2. Mark up to `max_count` unclaimed items of the requested type with that
//!    value and the owner. Candidates are locked in `(last_modified, id)`
//!    order so concurrent allocators take row locks in the same order and
//!    cannot deadlock each other.
//! 3. Insert one lease per item carrying the value.
//! 4. Read back exactly those rows by the value.
//!
//! All four steps share one transaction so a concurrent reclaim pass never
//! sees items marked without their leases. An owner that a peer has already
//! stopped gets nothing.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::db::Store;
use crate::error::{LoaderError, LoaderResult};
use crate::types::{
    AllocatedItem, Allocation, AllocationId, BundleLocation, BundleType, InstanceStatus,
    LoaderInstance,
};

pub const ALLOCATION_SEQUENCE: &str = "allocation_seq";

#[derive(Debug, Clone)]
pub struct JobAllocator {
    store: Store,
}

#[derive(FromRow)]
struct AllocatedRow {
    lease_id: i64,
    work_item_id: i64,
    location_container: String,
    location_path: String,
    location_name: String,
    size_bytes: i64,
    bundle_type: String,
    last_modified: DateTime<Utc>,
    version: i32,
    started_at: DateTime<Utc>,
}

impl TryFrom<AllocatedRow> for AllocatedItem {
    type Error = LoaderError;

    fn try_from(row: AllocatedRow) -> Result<Self, Self::Error> {
        Ok(AllocatedItem {
            lease_id: row.lease_id,
            work_item_id: row.work_item_id,
            location: BundleLocation::new(
                row.location_container,
                row.location_path,
                row.location_name,
            ),
            size_bytes: row.size_bytes,
            bundle_type: BundleType::from_stored(&row.bundle_type)?,
            last_modified: row.last_modified,
            version: row.version,
            started_at: row.started_at,
        })
    }
}

impl JobAllocator {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Claim up to `max_count` unclaimed work items of `bundle_type` for `owner`
    pub async fn allocate(
        &self,
        bundle_type: BundleType,
        owner: &LoaderInstance,
        max_count: u32,
    ) -> LoaderResult<Allocation> {
        if max_count == 0 {
            return Ok(Allocation::empty());
        }

        let d = self.store.dialect();
        let classify = |e| self.store.classify(e);

        let mut tx = self.store.pool().begin().await.map_err(classify)?;

        let status_sql = format!(
            "SELECT status FROM loader_instances WHERE id = {}",
            d.placeholder(1)
        );
        let status: Option<String> = sqlx::query_scalar(&status_sql)
            .bind(owner.id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(classify)?;

        match status.as_deref().map(InstanceStatus::from_stored).transpose()? {
            None => {
                return Err(LoaderError::invariant(format!(
                    "loader instance {} is not registered",
                    owner.id
                )));
            },
            Some(InstanceStatus::Stopped) => {
                tx.commit().await.map_err(classify)?;
                tracing::warn!(
                    instance_id = owner.id,
                    "Instance was stopped by a peer, refusing to allocate"
                );
                return Ok(Allocation::empty());
            },
            Some(InstanceStatus::Running) => {},
        }

        let allocation_id =
            AllocationId::new(d.next_sequence_value(&mut *tx, ALLOCATION_SEQUENCE).await?);

        // Materialized: the LIMIT must hold for the statement, not per join row.
        let candidates = d.materialized_cte(
            "candidates",
            &format!(
                "SELECT id FROM work_items \
                 WHERE allocation_id IS NULL AND bundle_type = {p3} \
                 ORDER BY last_modified, id {limit} {lock}",
                p3 = d.placeholder(3),
                limit = d.limit_clause(max_count),
                lock = d.lock_rows_clause(),
            ),
        );
        let mark = format!(
            "{candidates} \
             UPDATE work_items SET allocation_id = {p1}, owner_instance_id = {p2} \
             FROM candidates \
             WHERE work_items.id = candidates.id AND work_items.allocation_id IS NULL",
            p1 = d.placeholder(1),
            p2 = d.placeholder(2),
        );
        let marked = sqlx::query(&mark)
            .bind(allocation_id.value())
            .bind(owner.id)
            .bind(bundle_type.as_str())
            .execute(&mut *tx)
            .await
            .map_err(classify)?
            .rows_affected();

        if marked > u64::from(max_count) {
            return Err(LoaderError::invariant(format!(
                "{} marked {} work items, more than the {} requested",
                allocation_id, marked, max_count
            )));
        }

        if marked == 0 {
            // Nothing to claim; the drawn value is simply never used.
            tx.commit().await.map_err(classify)?;
            tracing::debug!(
                instance_id = owner.id,
                bundle_type = %bundle_type,
                "No unclaimed work items"
            );
            return Ok(Allocation::new(allocation_id, Vec::new()));
        }

        let leases = format!(
            "INSERT INTO leases (work_item_id, allocation_id, owner_instance_id, started_at, version) \
             SELECT id, allocation_id, owner_instance_id, {now}, version \
             FROM work_items WHERE allocation_id = {p1}",
            now = d.current_timestamp(),
            p1 = d.placeholder(1),
        );
        let leased = sqlx::query(&leases)
            .bind(allocation_id.value())
            .execute(&mut *tx)
            .await
            .map_err(classify)?
            .rows_affected();

        if leased != marked {
            return Err(LoaderError::invariant(format!(
                "{} marked {} work items but created {} leases",
                allocation_id, marked, leased
            )));
        }

        let fetch = format!(
            "SELECT l.id AS lease_id, w.id AS work_item_id, w.location_container, \
             w.location_path, w.location_name, w.size_bytes, w.bundle_type, w.last_modified, \
             l.version, l.started_at \
             FROM work_items w JOIN leases l \
               ON l.work_item_id = w.id AND l.allocation_id = w.allocation_id \
             WHERE w.allocation_id = {p1} \
             ORDER BY w.last_modified, w.id",
            p1 = d.placeholder(1),
        );
        let rows: Vec<AllocatedRow> = sqlx::query_as(&fetch)
            .bind(allocation_id.value())
            .fetch_all(&mut *tx)
            .await
            .map_err(classify)?;

        tx.commit().await.map_err(classify)?;

        let items = rows
            .into_iter()
            .map(AllocatedItem::try_from)
            .collect::<LoaderResult<Vec<_>>>()?;

        tracing::info!(
            instance_id = owner.id,
            allocation = %allocation_id,
            bundle_type = %bundle_type,
            claimed = items.len(),
            "Allocated work items"
        );

        Ok(Allocation::new(allocation_id, items))
    }
}
