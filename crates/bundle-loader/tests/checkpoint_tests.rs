//! Checkpointing, resume and completion

use std::time::Duration;

use bundle_loader::{
    BatchOutcome, BundleType, CheckpointOutcome, Checkpointer, LoaderError, ProcessedRecord, Store,
};
use sqlx::PgPool;

mod common;

fn record(type_id: i32, key: &str, line_number: i64) -> ProcessedRecord {
    ProcessedRecord {
        type_id,
        natural_key: key.to_string(),
        line_number,
    }
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_resume_after_crash_skips_duplicates(pool: PgPool) -> anyhow::Result<()> {
    let loader = common::loader(pool);
    let ids = common::register_items(&loader, 1, BundleType::Ndjson).await;
    let item = ids[0];
    let types = loader.ensure_reference_data(&["Patient"]).await?;
    let patient = types["Patient"];

    assert_eq!(loader.last_processed_line(item).await?, None);

    for (line, key) in [(1, "p1"), (2, "p2"), (3, "p3")] {
        assert_eq!(
            loader.record_processed(patient, key, item, line).await?,
            CheckpointOutcome::Recorded
        );
    }
    assert_eq!(loader.last_processed_line(item).await?, Some(3));

    // A restarted worker replays line 3 before moving on.
    assert_eq!(
        loader.record_processed(patient, "p3", item, 3).await?,
        CheckpointOutcome::Duplicate
    );

    let outcome = loader
        .record_processed_batch(item, &[record(patient, "p3", 3), record(patient, "p4", 4)])
        .await?;
    assert_eq!(
        outcome,
        BatchOutcome {
            recorded: 1,
            duplicates: 1
        }
    );
    assert_eq!(loader.last_processed_line(item).await?, Some(4));

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_checkpoint_for_unknown_work_item(pool: PgPool) -> anyhow::Result<()> {
    let loader = common::loader(pool);
    let types = loader.ensure_reference_data(&["Patient"]).await?;

    let result = loader.record_processed(types["Patient"], "p1", 9999, 1).await;
    assert!(matches!(result, Err(LoaderError::Invariant(_))));

    let result = loader
        .record_processed_batch(9999, &[record(types["Patient"], "p1", 1)])
        .await;
    assert!(matches!(result, Err(LoaderError::Invariant(_))));

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_buffer_flushes_in_batches(pool: PgPool) -> anyhow::Result<()> {
    let loader = common::loader(pool.clone());
    let ids = common::register_items(&loader, 1, BundleType::Ndjson).await;
    let types = loader.ensure_reference_data(&["Observation"]).await?;
    let observation = types["Observation"];

    let checkpointer = Checkpointer::new(Store::postgres(pool.clone()), 2);
    let mut buffer = checkpointer.buffer(ids[0]);

    for line in 1..=3 {
        buffer.push(record(observation, &format!("o{}", line), line)).await?;
    }
    assert_eq!(buffer.pending(), 1);
    assert_eq!(common::count(&pool, "SELECT COUNT(*) FROM checkpoints").await, 2);

    let totals = buffer.finish().await?;
    assert_eq!(totals.recorded, 3);
    assert_eq!(common::count(&pool, "SELECT COUNT(*) FROM checkpoints").await, 3);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_recycled_item_starts_from_the_top(pool: PgPool) -> anyhow::Result<()> {
    let loader = common::loader(pool.clone());
    let ids = common::register_items(&loader, 1, BundleType::Ndjson).await;
    let types = loader.ensure_reference_data(&["Patient"]).await?;
    let instance = loader.register("host-a", 1).await?;

    let allocation = loader.allocate(BundleType::Ndjson, &instance, 1).await?;
    loader.record_processed(types["Patient"], "p1", ids[0], 1).await?;
    let lease_id = allocation.items()[0].lease_id;
    loader.mark_done(lease_id, 0, 1).await?;

    common::age_completion(&pool, lease_id, 120).await;
    let timeout = Duration::from_secs(60);
    loader.reclaim_stale(timeout, Some(timeout)).await?;

    assert_eq!(loader.last_processed_line(ids[0]).await?, None);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_lease_completes_once(pool: PgPool) -> anyhow::Result<()> {
    let loader = common::loader(pool);
    let ids = common::register_items(&loader, 1, BundleType::Ndjson).await;
    let instance = loader.register("host-a", 1).await?;
    let allocation = loader.allocate(BundleType::Ndjson, &instance, 1).await?;
    let lease_id = allocation.items()[0].lease_id;

    assert!(loader.mark_done(lease_id, 2, 40).await?);
    assert!(!loader.mark_done(lease_id, 0, 99).await?);

    let lease = loader.completion().lease(lease_id).await?.unwrap();
    assert!(lease.completed_at.is_some());
    assert_eq!(lease.failure_count, Some(2));
    assert_eq!(lease.rows_processed, Some(40));

    let history = loader.completion().leases_for(ids[0]).await?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, lease_id);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_load_errors_are_recorded_per_lease(pool: PgPool) -> anyhow::Result<()> {
    let loader = common::loader(pool);
    common::register_items(&loader, 1, BundleType::Ndjson).await;
    let instance = loader.register("host-a", 1).await?;
    let allocation = loader.allocate(BundleType::Ndjson, &instance, 1).await?;
    let lease_id = allocation.items()[0].lease_id;

    loader.record_error(lease_id, 7, "missing id").await?;
    loader.record_error(lease_id, 9, "expected value at line 1").await?;

    assert_eq!(loader.completion().error_count(lease_id).await?, 2);

    Ok(())
}
