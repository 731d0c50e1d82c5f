//! Job allocation against a live database
//!
//! Coverage includes:
//! - Disjoint claims under concurrent allocators
//! - Partial batches, empty pools and zero-size requests
//! - Bundle type filtering and oldest-first ordering
//! - Lease rows created alongside each claim
//! - Owners that are stopped or unknown

use std::collections::HashSet;

use bundle_loader::{BundleType, LoaderError, LoaderInstance};
use futures::future::join_all;
use sqlx::PgPool;

mod common;

#[sqlx::test(migrations = "../../migrations")]
async fn test_concurrent_allocators_never_share_items(pool: PgPool) -> anyhow::Result<()> {
    let loader = common::loader(pool.clone());
    let registered = common::register_items(&loader, 40, BundleType::Ndjson).await;

    let mut instances: Vec<LoaderInstance> = Vec::new();
    for i in 0..8 {
        instances.push(loader.register(&format!("host-{}", i), 1000 + i).await?);
    }

    let mut claimed: Vec<i64> = Vec::new();
    for _round in 0..50 {
        let results = join_all(
            instances
                .iter()
                .map(|instance| loader.allocate(BundleType::Ndjson, instance, 3)),
        )
        .await;

        for result in results {
            let allocation = result?;
            assert!(allocation.len() <= 3, "batch of {} exceeds the request", allocation.len());
            claimed.extend(allocation.items().iter().map(|item| item.work_item_id));
        }

        if loader.queue_status().await?.unclaimed_items == 0 {
            break;
        }
    }

    let unique: HashSet<i64> = claimed.iter().copied().collect();
    assert_eq!(unique.len(), claimed.len(), "a work item was claimed twice");
    assert_eq!(unique, registered.into_iter().collect::<HashSet<_>>());

    let leases = common::count(&pool, "SELECT COUNT(*) FROM leases").await;
    assert_eq!(leases, 40);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_allocation_takes_what_is_available(pool: PgPool) -> anyhow::Result<()> {
    let loader = common::loader(pool.clone());
    common::register_items(&loader, 5, BundleType::Ndjson).await;
    let instance = loader.register("host-a", 1).await?;

    let first = loader.allocate(BundleType::Ndjson, &instance, 3).await?;
    assert_eq!(first.len(), 3);
    assert_eq!(
        common::count(&pool, "SELECT COUNT(*) FROM work_items WHERE allocation_id IS NOT NULL")
            .await,
        3
    );

    let second = loader.allocate(BundleType::Ndjson, &instance, 10).await?;
    assert_eq!(second.len(), 2);
    assert_ne!(first.id(), second.id());

    let third = loader.allocate(BundleType::Ndjson, &instance, 10).await?;
    assert!(third.is_empty());
    assert!(third.id().is_some());

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_zero_sized_request_claims_nothing(pool: PgPool) -> anyhow::Result<()> {
    let loader = common::loader(pool);
    common::register_items(&loader, 2, BundleType::Ndjson).await;
    let instance = loader.register("host-a", 1).await?;

    let allocation = loader.allocate(BundleType::Ndjson, &instance, 0).await?;
    assert!(allocation.is_empty());
    assert!(allocation.id().is_none());
    assert_eq!(loader.queue_status().await?.unclaimed_items, 2);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_allocation_filters_by_type_and_orders_oldest_first(
    pool: PgPool,
) -> anyhow::Result<()> {
    let loader = common::loader(pool);
    let ndjson = common::register_items(&loader, 3, BundleType::Ndjson).await;
    common::register_items(&loader, 2, BundleType::Json).await;
    let instance = loader.register("host-a", 1).await?;

    let allocation = loader.allocate(BundleType::Ndjson, &instance, 10).await?;
    let ids: Vec<i64> = allocation.items().iter().map(|item| item.work_item_id).collect();
    assert_eq!(ids, ndjson);
    assert!(allocation
        .items()
        .iter()
        .all(|item| item.bundle_type == BundleType::Ndjson));

    let json = loader.allocate(BundleType::Json, &instance, 10).await?;
    assert_eq!(json.len(), 2);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_claim_creates_open_lease_for_owner(pool: PgPool) -> anyhow::Result<()> {
    let loader = common::loader(pool);
    let ids = common::register_items(&loader, 1, BundleType::Ndjson).await;
    let instance = loader.register("host-a", 1).await?;

    let allocation = loader.allocate(BundleType::Ndjson, &instance, 1).await?;
    let item = &allocation.items()[0];
    assert_eq!(item.work_item_id, ids[0]);
    assert_eq!(item.version, 1);

    let lease = loader.completion().lease(item.lease_id).await?.unwrap();
    assert_eq!(lease.owner_instance_id, instance.id());
    assert_eq!(lease.work_item_id, ids[0]);
    assert!(lease.completed_at.is_none());

    let work_item = loader.catalog().work_item(ids[0]).await?.unwrap();
    assert!(work_item.is_claimed());
    assert_eq!(work_item.owner_instance_id, Some(instance.id()));

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_stopped_owner_gets_nothing(pool: PgPool) -> anyhow::Result<()> {
    let loader = common::loader(pool.clone());
    common::register_items(&loader, 2, BundleType::Ndjson).await;
    let instance = loader.register("host-a", 1).await?;

    common::age_heartbeat(&pool, instance.id(), 120).await;
    loader
        .reclaim_stale(std::time::Duration::from_secs(60), None)
        .await?;

    let allocation = loader.allocate(BundleType::Ndjson, &instance, 5).await?;
    assert!(allocation.is_empty());
    assert_eq!(loader.queue_status().await?.unclaimed_items, 2);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_unregistered_owner_is_rejected(pool: PgPool) -> anyhow::Result<()> {
    let loader = common::loader(pool.clone());
    common::register_items(&loader, 1, BundleType::Ndjson).await;
    let instance = loader.register("host-a", 1).await?;

    sqlx::query("DELETE FROM loader_instances WHERE id = $1")
        .bind(instance.id())
        .execute(&pool)
        .await?;

    let result = loader.allocate(BundleType::Ndjson, &instance, 1).await;
    assert!(matches!(result, Err(LoaderError::Invariant(_))));
    assert_eq!(loader.queue_status().await?.unclaimed_items, 1);

    Ok(())
}
