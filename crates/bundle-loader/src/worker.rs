//! Loader worker
//!
//! Drives the engine end to end for one process: register, keep the
//! heartbeat alive, and repeatedly reclaim, allocate and ingest until told
//! to stop. Ingestion resumes from the last checkpointed line, so a bundle
//! that was half done by a dead peer is only read from where it stopped.

use std::future::Future;

use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::LoaderConfig;
use crate::error::{LoaderError, LoaderResult};
use crate::loader::BundleLoader;
use crate::source::BundleSource;
use crate::types::{AllocatedItem, LoaderInstance, ProcessedRecord};

/// Counts from one pass of the worker loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub claimed: usize,
    pub reclaimed: u64,
    pub recycled: u64,
    pub completed: usize,
    pub rows_processed: u64,
    pub failures: u64,
}

impl PassSummary {
    pub fn is_idle(&self) -> bool {
        self.claimed == 0 && self.reclaimed == 0 && self.recycled == 0
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ItemOutcome {
    rows_processed: u64,
    failures: u64,
}

#[derive(Debug, Clone)]
pub struct LoaderWorker {
    loader: BundleLoader,
    config: LoaderConfig,
}

impl LoaderWorker {
    pub fn new(loader: BundleLoader, config: LoaderConfig) -> Self {
        Self { loader, config }
    }

    pub fn loader(&self) -> &BundleLoader {
        &self.loader
    }

    /// Run until `shutdown` resolves or a peer marks this instance stopped.
    /// A pass in progress is finished before shutting down.
    pub async fn run<S, F>(&self, source: &S, shutdown: F) -> LoaderResult<()>
    where
        S: BundleSource + ?Sized,
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);

        let instance = self.loader.instances().register_current_process().await?;
        let mut heartbeat = self
            .loader
            .instances()
            .spawn_heartbeat(instance.clone(), self.config.heartbeat_interval);

        tracing::info!(
            instance_id = instance.id(),
            bundle_type = %self.config.bundle_type,
            batch_size = self.config.allocation_batch_size,
            "Loader worker started"
        );

        let result = loop {
            if heartbeat.is_finished() {
                break heartbeat_outcome(&mut heartbeat).await;
            }

            let summary = match self.run_pass(&instance, source).await {
                Ok(summary) => summary,
                Err(e) => break Err(e),
            };

            if shutdown.as_mut().now_or_never().is_some() {
                break Ok(());
            }

            if summary.claimed == 0 {
                tokio::select! {
                    _ = shutdown.as_mut() => break Ok(()),
                    outcome = &mut heartbeat => break join_outcome(outcome),
                    _ = tokio::time::sleep(self.config.poll_interval) => {},
                }
            }
        };

        heartbeat.abort();

        match &result {
            Ok(()) => tracing::info!(instance_id = instance.id(), "Loader worker stopped"),
            Err(e) => {
                tracing::error!(instance_id = instance.id(), error = %e, "Loader worker failed")
            },
        }

        result
    }

    /// Register, run a single pass with the heartbeat alive, then mark the
    /// instance stopped so no RUNNING row is left behind.
    pub async fn run_once<S>(&self, source: &S) -> LoaderResult<PassSummary>
    where
        S: BundleSource + ?Sized,
    {
        let instance = self.loader.instances().register_current_process().await?;
        let heartbeat = self
            .loader
            .instances()
            .spawn_heartbeat(instance.clone(), self.config.heartbeat_interval);

        let result = self.run_pass(&instance, source).await;
        heartbeat.abort();

        self.loader.instances().stop(&instance).await?;
        result
    }

    /// One reclaim, allocate and ingest cycle
    pub async fn run_pass<S>(
        &self,
        instance: &LoaderInstance,
        source: &S,
    ) -> LoaderResult<PassSummary>
    where
        S: BundleSource + ?Sized,
    {
        let mut summary = PassSummary::default();

        if self.config.reclaim_enabled {
            let reclaimed = self
                .loader
                .reclaim_stale(self.config.heartbeat_timeout, self.config.recycle_after)
                .await?;
            summary.reclaimed = reclaimed.items_released;
            summary.recycled = reclaimed.items_recycled;
        }

        let allocation = self
            .loader
            .allocate(self.config.bundle_type, instance, self.config.allocation_batch_size)
            .await?;
        summary.claimed = allocation.len();

        for item in allocation.items() {
            let outcome = self.process_item(item, source).await?;
            summary.completed += 1;
            summary.rows_processed += outcome.rows_processed;
            summary.failures += outcome.failures;
        }

        if !summary.is_idle() {
            tracing::info!(
                instance_id = instance.id(),
                claimed = summary.claimed,
                reclaimed = summary.reclaimed,
                recycled = summary.recycled,
                completed = summary.completed,
                rows_processed = summary.rows_processed,
                failures = summary.failures,
                "Pass finished"
            );
        }

        Ok(summary)
    }

    async fn process_item<S>(&self, item: &AllocatedItem, source: &S) -> LoaderResult<ItemOutcome>
    where
        S: BundleSource + ?Sized,
    {
        let resume_after = self
            .loader
            .last_processed_line(item.work_item_id)
            .await?
            .unwrap_or(0);

        if resume_after > 0 {
            tracing::info!(
                work_item_id = item.work_item_id,
                location = %item.location,
                resume_after,
                "Resuming partially ingested bundle"
            );
        }

        let lines = match source.read_records(item, resume_after).await {
            Ok(lines) => lines,
            Err(e) => {
                // Unreadable bundle: line 0 stands for the bundle as a whole.
                self.loader.record_error(item.lease_id, 0, &e.to_string()).await?;
                self.loader.mark_done(item.lease_id, 1, 0).await?;
                return Ok(ItemOutcome {
                    rows_processed: 0,
                    failures: 1,
                });
            },
        };

        let type_names: Vec<&str> = lines
            .iter()
            .filter_map(|line| line.record.as_ref().ok())
            .map(|record| record.resource_type.as_str())
            .collect();
        let type_ids = self.loader.ensure_reference_data(&type_names[..]).await?;

        let mut buffer = self.loader.checkpointer().buffer(item.work_item_id);
        let mut failures: u64 = 0;

        for line in lines {
            match line.record {
                Ok(record) => {
                    let type_id = type_ids.get(&record.resource_type).copied().ok_or_else(|| {
                        LoaderError::invariant(format!(
                            "no dictionary id for {}",
                            record.resource_type
                        ))
                    })?;
                    buffer
                        .push(ProcessedRecord {
                            type_id,
                            natural_key: record.natural_key,
                            line_number: line.line_number,
                        })
                        .await?;
                },
                Err(message) => {
                    self.loader
                        .record_error(item.lease_id, line.line_number, &message)
                        .await?;
                    failures += 1;
                },
            }
        }

        let written = buffer.finish().await?;

        self.loader
            .mark_done(item.lease_id, saturating_i32(failures), saturating_i32(written.recorded))
            .await?;

        Ok(ItemOutcome {
            rows_processed: written.recorded,
            failures,
        })
    }
}

fn saturating_i32(n: u64) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

async fn heartbeat_outcome(handle: &mut JoinHandle<LoaderResult<()>>) -> LoaderResult<()> {
    join_outcome(handle.await)
}

fn join_outcome(
    outcome: Result<LoaderResult<()>, tokio::task::JoinError>,
) -> LoaderResult<()> {
    match outcome {
        Ok(Ok(())) => {
            tracing::warn!("Instance was stopped by a peer, leaving the work loop");
            Ok(())
        },
        Ok(Err(e)) => Err(e),
        Err(e) => Err(LoaderError::invariant(format!("heartbeat task died: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_pass() {
        assert!(PassSummary::default().is_idle());
        let busy = PassSummary {
            reclaimed: 1,
            ..Default::default()
        };
        assert!(!busy.is_idle());
    }

    #[test]
    fn test_saturating_i32() {
        assert_eq!(saturating_i32(7), 7);
        assert_eq!(saturating_i32(u64::MAX), i32::MAX);
    }
}
