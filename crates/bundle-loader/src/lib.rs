//! Bundle Loader
//!
//! Coordinates a fleet of loader processes that share one relational
//! database. Bundles of healthcare records are registered as work items;
//! each loader claims disjoint batches of them, records a checkpoint per
//! ingested resource, and completes its lease. Dead loaders are detected by
//! heartbeat age and their unfinished work is handed to the survivors.
//!
//! # Components
//!
//! - [`InstanceRegistry`]: registration and heartbeats
//! - [`JobAllocator`]: race-free claiming of work items
//! - [`StaleAllocationReclaimer`]: dead-worker detection and recycling
//! - [`Checkpointer`]: idempotent per-record progress
//! - [`CompletionTracker`]: lease completion and per-line errors
//! - [`ReferenceDataRegistrar`]: shared name dictionary
//! - [`WorkItemCatalog`]: registering discovered bundles
//! - [`LoaderWorker`]: the loop tying them together
//!
//! # Example
//!
//! ```no_run
//! use bundle_loader::{BundleLoader, LoaderConfig, LocalNdjsonSource, LoaderWorker};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = LoaderConfig::from_env()?;
//!     let loader = BundleLoader::connect(&config).await?;
//!     loader.migrate().await?;
//!
//!     let source = LocalNdjsonSource::new("./data/bundles");
//!     let worker = LoaderWorker::new(loader, config);
//!     worker
//!         .run(&source, async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

pub mod allocator;
pub mod catalog;
pub mod checkpoint;
pub mod completion;
pub mod config;
pub mod db;
pub mod dialect;
pub mod error;
pub mod instances;
pub mod loader;
pub mod reclaimer;
pub mod reference;
pub mod source;
pub mod types;
pub mod worker;

pub use allocator::JobAllocator;
pub use catalog::WorkItemCatalog;
pub use checkpoint::{CheckpointBuffer, Checkpointer};
pub use completion::CompletionTracker;
pub use config::LoaderConfig;
pub use db::{create_pool, DbConfig, Store};
pub use dialect::{Dialect, PostgresDialect};
pub use error::{LoaderError, LoaderResult};
pub use instances::InstanceRegistry;
pub use loader::BundleLoader;
pub use reclaimer::StaleAllocationReclaimer;
pub use reference::ReferenceDataRegistrar;
pub use source::{BundleSource, LocalNdjsonSource, SourceLine, SourceRecord};
pub use types::*;
pub use worker::{LoaderWorker, PassSummary};
