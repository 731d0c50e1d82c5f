//! Work item catalog
//!
//! Turns object-store listings into WorkItem rows. Registration is idempotent
//! on location; a changed size or modification time bumps the version so
//! downstream consumers treat earlier ingests of the bundle as superseded,
//! and returns finished work to the unclaimed pool. While a lease on the item
//! is still open the change is left unrecorded, so the next listing after
//! that lease ends picks it up.

use chrono::{DateTime, SubsecRound, Utc};
use sqlx::FromRow;

use crate::db::Store;
use crate::error::{LoaderError, LoaderResult};
use crate::types::{BundleLocation, BundleType, NewWorkItem, QueueStatus, WorkItem};

const WORK_ITEM_COLUMNS: &[&str] = &[
    "location_container",
    "location_path",
    "location_name",
    "size_bytes",
    "bundle_type",
    "last_modified",
];
const LOCATION_COLUMNS: &[&str] = &["location_container", "location_path", "location_name"];

#[derive(Debug, Clone)]
pub struct WorkItemCatalog {
    store: Store,
}

#[derive(FromRow)]
struct WorkItemRow {
    id: i64,
    location_container: String,
    location_path: String,
    location_name: String,
    size_bytes: i64,
    bundle_type: String,
    last_modified: DateTime<Utc>,
    version: i32,
    allocation_id: Option<i64>,
    owner_instance_id: Option<i64>,
}

impl TryFrom<WorkItemRow> for WorkItem {
    type Error = LoaderError;

    fn try_from(row: WorkItemRow) -> Result<Self, Self::Error> {
        Ok(WorkItem {
            id: row.id,
            location: BundleLocation::new(
                row.location_container,
                row.location_path,
                row.location_name,
            ),
            size_bytes: row.size_bytes,
            bundle_type: BundleType::from_stored(&row.bundle_type)?,
            last_modified: row.last_modified,
            version: row.version,
            allocation_id: row.allocation_id,
            owner_instance_id: row.owner_instance_id,
        })
    }
}

#[derive(FromRow)]
struct QueueStatusRow {
    unclaimed_items: i64,
    claimed_items: i64,
    open_leases: i64,
    running_instances: i64,
    stopped_instances: i64,
}

impl WorkItemCatalog {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Register a discovered bundle and return its work item id
    pub async fn register_work_item(&self, item: &NewWorkItem) -> LoaderResult<i64> {
        let d = self.store.dialect();
        // Storage keeps microseconds; compare like with like on re-registration.
        let last_modified = item.last_modified.trunc_subsecs(6);
        let classify = |e| self.store.classify(e);

        let mut tx = self.store.pool().begin().await.map_err(classify)?;

        let insert = d.upsert_statement("work_items", WORK_ITEM_COLUMNS, LOCATION_COLUMNS, 1);
        let inserted = sqlx::query(&insert)
            .bind(&item.location.container)
            .bind(&item.location.path)
            .bind(&item.location.name)
            .bind(item.size_bytes)
            .bind(item.bundle_type.as_str())
            .bind(last_modified)
            .execute(&mut *tx)
            .await
            .map_err(classify)?
            .rows_affected();

        let select = format!(
            "SELECT id, size_bytes, last_modified, allocation_id FROM work_items \
             WHERE location_container = {} AND location_path = {} AND location_name = {} {}",
            d.placeholder(1),
            d.placeholder(2),
            d.placeholder(3),
            d.lock_rows_clause()
        );
        let (id, size_bytes, stored_modified, allocation_id): (
            i64,
            i64,
            DateTime<Utc>,
            Option<i64>,
        ) = sqlx::query_as(&select)
            .bind(&item.location.container)
            .bind(&item.location.path)
            .bind(&item.location.name)
            .fetch_optional(&mut *tx)
            .await
            .map_err(classify)?
            .ok_or_else(|| {
                LoaderError::invariant(format!("work item {} vanished after insert", item.location))
            })?;

        let changed =
            inserted == 0 && (size_bytes != item.size_bytes || stored_modified != last_modified);

        if changed {
            let in_flight = match allocation_id {
                Some(allocation_id) => {
                    let open = format!(
                        "SELECT EXISTS (SELECT 1 FROM leases \
                         WHERE work_item_id = {} AND allocation_id = {} AND completed_at IS NULL)",
                        d.placeholder(1),
                        d.placeholder(2)
                    );
                    sqlx::query_scalar::<_, bool>(&open)
                        .bind(id)
                        .bind(allocation_id)
                        .fetch_one(&mut *tx)
                        .await
                        .map_err(classify)?
                },
                None => false,
            };

            if in_flight {
                tracing::info!(
                    work_item_id = id,
                    location = %item.location,
                    "Bundle changed while being ingested, deferring the new version"
                );
            } else {
                let update = format!(
                    "UPDATE work_items SET size_bytes = {}, last_modified = {}, \
                     version = version + 1, allocation_id = NULL, owner_instance_id = NULL \
                     WHERE id = {}",
                    d.placeholder(1),
                    d.placeholder(2),
                    d.placeholder(3)
                );
                sqlx::query(&update)
                    .bind(item.size_bytes)
                    .bind(last_modified)
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(classify)?;

                tracing::info!(
                    work_item_id = id,
                    location = %item.location,
                    "Bundle changed since last listing, version bumped"
                );
            }
        }

        tx.commit().await.map_err(classify)?;

        if inserted > 0 {
            tracing::debug!(work_item_id = id, location = %item.location, "Registered work item");
        }

        Ok(id)
    }

    pub async fn work_item(&self, id: i64) -> LoaderResult<Option<WorkItem>> {
        let sql = format!(
            "SELECT id, location_container, location_path, location_name, size_bytes, \
             bundle_type, last_modified, version, allocation_id, owner_instance_id \
             FROM work_items WHERE id = {}",
            self.store.dialect().placeholder(1)
        );

        let row: Option<WorkItemRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(self.store.pool())
            .await
            .map_err(|e| self.store.classify(e))?;

        row.map(WorkItem::try_from).transpose()
    }

    /// Counts of claimed and unclaimed work and of live and dead instances
    pub async fn queue_status(&self) -> LoaderResult<QueueStatus> {
        let sql = "SELECT \
            (SELECT COUNT(*) FROM work_items WHERE allocation_id IS NULL) AS unclaimed_items, \
            (SELECT COUNT(*) FROM work_items WHERE allocation_id IS NOT NULL) AS claimed_items, \
            (SELECT COUNT(*) FROM leases l JOIN work_items w \
                ON w.id = l.work_item_id AND w.allocation_id = l.allocation_id \
                WHERE l.completed_at IS NULL) AS open_leases, \
            (SELECT COUNT(*) FROM loader_instances WHERE status = 'RUNNING') AS running_instances, \
            (SELECT COUNT(*) FROM loader_instances WHERE status = 'STOPPED') AS stopped_instances";

        let row: QueueStatusRow = sqlx::query_as(sql)
            .fetch_one(self.store.pool())
            .await
            .map_err(|e| self.store.classify(e))?;

        Ok(QueueStatus {
            unclaimed_items: row.unclaimed_items,
            claimed_items: row.claimed_items,
            open_leases: row.open_leases,
            running_instances: row.running_instances,
            stopped_instances: row.stopped_instances,
        })
    }
}
