//! `BundleLoader` facade
//!
//! Bundles every component over one shared store. Clone it freely; all
//! clones share the pool.

use std::collections::HashMap;
use std::time::Duration;

use crate::allocator::JobAllocator;
use crate::catalog::WorkItemCatalog;
use crate::checkpoint::Checkpointer;
use crate::completion::CompletionTracker;
use crate::config::LoaderConfig;
use crate::db::{create_pool, Store};
use crate::error::LoaderResult;
use crate::instances::InstanceRegistry;
use crate::reclaimer::StaleAllocationReclaimer;
use crate::reference::ReferenceDataRegistrar;
use crate::types::{
    Allocation, BatchOutcome, BundleType, CheckpointOutcome, LoaderInstance, NewWorkItem,
    ProcessedRecord, QueueStatus, ReclaimSummary,
};

#[derive(Debug, Clone)]
pub struct BundleLoader {
    store: Store,
    instances: InstanceRegistry,
    allocator: JobAllocator,
    reclaimer: StaleAllocationReclaimer,
    checkpointer: Checkpointer,
    completion: CompletionTracker,
    reference: ReferenceDataRegistrar,
    catalog: WorkItemCatalog,
}

impl BundleLoader {
    pub fn new(store: Store, checkpoint_batch_size: usize) -> Self {
        Self {
            instances: InstanceRegistry::new(store.clone()),
            allocator: JobAllocator::new(store.clone()),
            reclaimer: StaleAllocationReclaimer::new(store.clone()),
            checkpointer: Checkpointer::new(store.clone(), checkpoint_batch_size),
            completion: CompletionTracker::new(store.clone()),
            reference: ReferenceDataRegistrar::new(store.clone()),
            catalog: WorkItemCatalog::new(store.clone()),
            store,
        }
    }

    /// Open a PostgreSQL pool from `config`
    pub async fn connect(config: &LoaderConfig) -> LoaderResult<Self> {
        let pool = create_pool(&config.database).await?;
        Ok(Self::new(Store::postgres(pool), config.checkpoint_batch_size))
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> LoaderResult<()> {
        sqlx::migrate!("../../migrations").run(self.store.pool()).await?;
        tracing::info!("Database migrations applied");
        Ok(())
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn instances(&self) -> &InstanceRegistry {
        &self.instances
    }

    pub fn allocator(&self) -> &JobAllocator {
        &self.allocator
    }

    pub fn reclaimer(&self) -> &StaleAllocationReclaimer {
        &self.reclaimer
    }

    pub fn checkpointer(&self) -> &Checkpointer {
        &self.checkpointer
    }

    pub fn completion(&self) -> &CompletionTracker {
        &self.completion
    }

    pub fn reference(&self) -> &ReferenceDataRegistrar {
        &self.reference
    }

    pub fn catalog(&self) -> &WorkItemCatalog {
        &self.catalog
    }

    pub async fn register(&self, host: &str, pid: u32) -> LoaderResult<LoaderInstance> {
        self.instances.register(host, pid).await
    }

    pub async fn heartbeat(&self, instance: &LoaderInstance) -> LoaderResult<bool> {
        self.instances.heartbeat(instance).await
    }

    pub async fn reclaim_stale(
        &self,
        heartbeat_timeout: Duration,
        recycle_after: Option<Duration>,
    ) -> LoaderResult<ReclaimSummary> {
        self.reclaimer.reclaim_stale(heartbeat_timeout, recycle_after).await
    }

    pub async fn allocate(
        &self,
        bundle_type: BundleType,
        owner: &LoaderInstance,
        max_count: u32,
    ) -> LoaderResult<Allocation> {
        self.allocator.allocate(bundle_type, owner, max_count).await
    }

    pub async fn record_processed(
        &self,
        type_id: i32,
        natural_key: &str,
        work_item_id: i64,
        line_number: i64,
    ) -> LoaderResult<CheckpointOutcome> {
        self.checkpointer
            .record_processed(type_id, natural_key, work_item_id, line_number)
            .await
    }

    pub async fn record_processed_batch(
        &self,
        work_item_id: i64,
        records: &[ProcessedRecord],
    ) -> LoaderResult<BatchOutcome> {
        self.checkpointer.record_processed_batch(work_item_id, records).await
    }

    pub async fn last_processed_line(&self, work_item_id: i64) -> LoaderResult<Option<i64>> {
        self.checkpointer.last_processed_line(work_item_id).await
    }

    pub async fn mark_done(
        &self,
        lease_id: i64,
        failure_count: i32,
        rows_processed: i32,
    ) -> LoaderResult<bool> {
        self.completion.mark_done(lease_id, failure_count, rows_processed).await
    }

    pub async fn record_error(
        &self,
        lease_id: i64,
        line_number: i64,
        message: &str,
    ) -> LoaderResult<()> {
        self.completion.record_error(lease_id, line_number, message).await
    }

    pub async fn ensure_reference_data<S>(&self, names: &[S]) -> LoaderResult<HashMap<String, i32>>
    where
        S: AsRef<str>,
    {
        self.reference.ensure(names).await
    }

    pub async fn register_work_item(&self, item: &NewWorkItem) -> LoaderResult<i64> {
        self.catalog.register_work_item(item).await
    }

    pub async fn queue_status(&self) -> LoaderResult<QueueStatus> {
        self.catalog.queue_status().await
    }
}
