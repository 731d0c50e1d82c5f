//! Ingestion checkpointer
//!
//! Records which natural keys have been ingested from which line of a work
//! item. A key that is already recorded is a duplicate, not a failure: after
//! a crash the same lines are submitted again and must be absorbed quietly.
//!
//! Checkpoints carry the work item version they were written under, and
//! resume only looks at the current version, so a recycled item is read
//! again from the top.

use chrono::{DateTime, Utc};

use crate::db::Store;
use crate::error::{LoaderError, LoaderResult};
use crate::types::{BatchOutcome, CheckpointOutcome, ProcessedRecord};

const CHECKPOINT_COLUMNS: &[&str] = &[
    "type_id",
    "natural_key",
    "work_item_id",
    "work_item_version",
    "line_number",
    "recorded_at",
];
const CHECKPOINT_KEY: &[&str] = &["type_id", "natural_key"];

#[derive(Debug, Clone)]
pub struct Checkpointer {
    store: Store,
    batch_size: usize,
}

impl Checkpointer {
    pub fn new(store: Store, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Record that `natural_key` of type `type_id` was produced by
    /// `line_number` of the work item
    pub async fn record_processed(
        &self,
        type_id: i32,
        natural_key: &str,
        work_item_id: i64,
        line_number: i64,
    ) -> LoaderResult<CheckpointOutcome> {
        let d = self.store.dialect();
        let sql = format!(
            "INSERT INTO checkpoints ({columns}) \
             SELECT {p1}, {p2}, w.id, w.version, {p3}, {now} FROM work_items w WHERE w.id = {p4}",
            columns = CHECKPOINT_COLUMNS.join(", "),
            p1 = d.placeholder(1),
            p2 = d.placeholder(2),
            p3 = d.placeholder(3),
            p4 = d.placeholder(4),
            now = d.current_timestamp(),
        );

        let result = sqlx::query(&sql)
            .bind(type_id)
            .bind(natural_key)
            .bind(line_number)
            .bind(work_item_id)
            .execute(self.store.pool())
            .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => Err(LoaderError::invariant(format!(
                "checkpoint for unknown work item {}",
                work_item_id
            ))),
            Ok(_) => Ok(CheckpointOutcome::Recorded),
            Err(e) if d.is_duplicate_key(&e) => {
                tracing::debug!(
                    type_id,
                    natural_key,
                    work_item_id,
                    line_number,
                    "Natural key already checkpointed, skipping"
                );
                Ok(CheckpointOutcome::Duplicate)
            },
            Err(e) => Err(self.store.classify(e)),
        }
    }

    /// Record many checkpoints for one work item, committing every
    /// `batch_size` rows so progress survives a later failure
    pub async fn record_processed_batch(
        &self,
        work_item_id: i64,
        records: &[ProcessedRecord],
    ) -> LoaderResult<BatchOutcome> {
        let mut total = BatchOutcome::default();

        for chunk in records.chunks(self.batch_size) {
            total += self.flush_chunk(work_item_id, chunk).await?;
        }

        Ok(total)
    }

    async fn flush_chunk(
        &self,
        work_item_id: i64,
        chunk: &[ProcessedRecord],
    ) -> LoaderResult<BatchOutcome> {
        if chunk.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let d = self.store.dialect();
        let classify = |e| self.store.classify(e);

        let mut tx = self.store.pool().begin().await.map_err(classify)?;

        let current = format!(
            "SELECT version, {} FROM work_items WHERE id = {}",
            d.current_timestamp(),
            d.placeholder(1)
        );
        let (version, now): (i32, DateTime<Utc>) = sqlx::query_as(&current)
            .bind(work_item_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(classify)?
            .ok_or_else(|| {
                LoaderError::invariant(format!("checkpoint for unknown work item {}", work_item_id))
            })?;

        let sql = d.upsert_statement("checkpoints", CHECKPOINT_COLUMNS, CHECKPOINT_KEY, chunk.len());
        let mut query = sqlx::query(&sql);
        for record in chunk {
            query = query
                .bind(record.type_id)
                .bind(&record.natural_key)
                .bind(work_item_id)
                .bind(version)
                .bind(record.line_number)
                .bind(now);
        }

        let recorded = query.execute(&mut *tx).await.map_err(classify)?.rows_affected();
        tx.commit().await.map_err(classify)?;

        let outcome = BatchOutcome {
            recorded,
            duplicates: chunk.len() as u64 - recorded,
        };

        if outcome.duplicates > 0 {
            tracing::debug!(
                work_item_id,
                duplicates = outcome.duplicates,
                "Skipped natural keys that were already checkpointed"
            );
        }

        Ok(outcome)
    }

    /// Highest line recorded for the current version of the work item
    pub async fn last_processed_line(&self, work_item_id: i64) -> LoaderResult<Option<i64>> {
        let sql = format!(
            "SELECT MAX(c.line_number) FROM checkpoints c \
             JOIN work_items w ON w.id = c.work_item_id AND w.version = c.work_item_version \
             WHERE c.work_item_id = {}",
            self.store.dialect().placeholder(1)
        );

        sqlx::query_scalar(&sql)
            .bind(work_item_id)
            .fetch_one(self.store.pool())
            .await
            .map_err(|e| self.store.classify(e))
    }

    /// Buffer that flushes itself every `batch_size` records
    pub fn buffer(&self, work_item_id: i64) -> CheckpointBuffer {
        CheckpointBuffer {
            checkpointer: self.clone(),
            work_item_id,
            pending: Vec::with_capacity(self.batch_size),
            totals: BatchOutcome::default(),
        }
    }
}

/// Accumulates checkpoints for one work item and writes them in batches.
/// Call [`CheckpointBuffer::finish`] to write the tail.
#[derive(Debug)]
pub struct CheckpointBuffer {
    checkpointer: Checkpointer,
    work_item_id: i64,
    pending: Vec<ProcessedRecord>,
    totals: BatchOutcome,
}

impl CheckpointBuffer {
    pub async fn push(&mut self, record: ProcessedRecord) -> LoaderResult<()> {
        self.pending.push(record);
        if self.pending.len() >= self.checkpointer.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> LoaderResult<()> {
        let pending = std::mem::take(&mut self.pending);
        self.totals += self
            .checkpointer
            .flush_chunk(self.work_item_id, &pending)
            .await?;
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub async fn finish(mut self) -> LoaderResult<BatchOutcome> {
        self.flush().await?;
        Ok(self.totals)
    }
}
