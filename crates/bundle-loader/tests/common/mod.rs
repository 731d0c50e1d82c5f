//! Shared helpers for the database integration tests.
//!
//! Every test gets a fresh database from `#[sqlx::test]` with the workspace
//! migrations applied; these helpers only seed rows and age timestamps.

#![allow(dead_code)]

use bundle_loader::{BundleLoader, BundleLocation, BundleType, NewWorkItem, Store};
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use sqlx::PgPool;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("bundle_loader=debug")
        .with_test_writer()
        .try_init();
}

pub fn loader(pool: PgPool) -> BundleLoader {
    init_tracing();
    BundleLoader::new(Store::postgres(pool), 100)
}

/// A listing entry in `bucket` whose modification times increase with `index`
pub fn new_item(name: &str, index: i64, bundle_type: BundleType) -> NewWorkItem {
    let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap_or_else(Utc::now);
    NewWorkItem {
        location: BundleLocation::new("bucket", "", name),
        size_bytes: 1024,
        bundle_type,
        last_modified: base + ChronoDuration::seconds(index),
    }
}

pub async fn register_items(
    loader: &BundleLoader,
    count: usize,
    bundle_type: BundleType,
) -> Vec<i64> {
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let item = new_item(&format!("{}-{:03}.ndjson", bundle_type, i), i as i64, bundle_type);
        ids.push(loader.register_work_item(&item).await.unwrap());
    }
    ids
}

/// Age an instance's heartbeat by `seconds`
pub async fn age_heartbeat(pool: &PgPool, instance_id: i64, seconds: i64) {
    sqlx::query(
        "UPDATE loader_instances \
         SET heartbeat_time = heartbeat_time - ($1 * INTERVAL '1 second') WHERE id = $2",
    )
    .bind(seconds)
    .bind(instance_id)
    .execute(pool)
    .await
    .unwrap();
}

/// Age a lease's completion time by `seconds`
pub async fn age_completion(pool: &PgPool, lease_id: i64, seconds: i64) {
    sqlx::query(
        "UPDATE leases SET completed_at = completed_at - ($1 * INTERVAL '1 second') WHERE id = $2",
    )
    .bind(seconds)
    .bind(lease_id)
    .execute(pool)
    .await
    .unwrap();
}

pub async fn count(pool: &PgPool, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(pool).await.unwrap()
}
