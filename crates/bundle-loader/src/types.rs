//! Core types for the allocation engine

use bundle_common::BundleError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LoaderError;

/// Bundle file format; also the type tag used to filter allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BundleType {
    /// A single JSON document holding an `entry` array
    Json,
    /// Newline-delimited JSON, one resource per line
    Ndjson,
}

impl BundleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BundleType::Json => "JSON",
            BundleType::Ndjson => "NDJSON",
        }
    }

    /// Parse a type tag read back from storage. Anything unknown there means
    /// the schema and the code disagree.
    pub(crate) fn from_stored(value: &str) -> Result<Self, LoaderError> {
        value
            .parse()
            .map_err(|_| LoaderError::invariant(format!("unknown bundle type in storage: {}", value)))
    }
}

impl std::str::FromStr for BundleType {
    type Err = BundleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "JSON" => Ok(BundleType::Json),
            "NDJSON" => Ok(BundleType::Ndjson),
            _ => Err(BundleError::UnknownBundleType(s.to_string())),
        }
    }
}

impl std::fmt::Display for BundleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness status of a loader instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceStatus {
    Running,
    Stopped,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Running => "RUNNING",
            InstanceStatus::Stopped => "STOPPED",
        }
    }

    pub(crate) fn from_stored(value: &str) -> Result<Self, LoaderError> {
        match value {
            "RUNNING" => Ok(InstanceStatus::Running),
            "STOPPED" => Ok(InstanceStatus::Stopped),
            other => Err(LoaderError::invariant(format!(
                "unknown instance status in storage: {}",
                other
            ))),
        }
    }
}

/// Identity of a registered loader process.
///
/// Returned by registration and passed explicitly to every operation that
/// acts on behalf of the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderInstance {
    pub(crate) id: i64,
    pub(crate) key: Uuid,
    pub(crate) host: String,
    pub(crate) pid: u32,
}

impl LoaderInstance {
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn key(&self) -> Uuid {
        self.key
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

/// Stored state of a loader instance
#[derive(Debug, Clone, Serialize)]
pub struct InstanceRecord {
    pub id: i64,
    pub instance_key: String,
    pub host: String,
    pub pid: i32,
    pub heartbeat_time: DateTime<Utc>,
    pub status: InstanceStatus,
}

/// Where a bundle lives in the object store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleLocation {
    pub container: String,
    pub path: String,
    pub name: String,
}

impl BundleLocation {
    pub fn new(
        container: impl Into<String>,
        path: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            container: container.into(),
            path: path.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for BundleLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}/{}", self.container, self.name)
        } else {
            write!(f, "{}/{}/{}", self.container, self.path, self.name)
        }
    }
}

/// A discovered bundle, as reported by an object-store listing
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub location: BundleLocation,
    pub size_bytes: i64,
    pub bundle_type: BundleType,
    pub last_modified: DateTime<Utc>,
}

/// A unit of ingestion work (maps to work_items table)
#[derive(Debug, Clone, Serialize)]
pub struct WorkItem {
    pub id: i64,
    pub location: BundleLocation,
    pub size_bytes: i64,
    pub bundle_type: BundleType,
    pub last_modified: DateTime<Utc>,
    pub version: i32,
    pub allocation_id: Option<i64>,
    pub owner_instance_id: Option<i64>,
}

impl WorkItem {
    pub fn is_claimed(&self) -> bool {
        self.allocation_id.is_some()
    }
}

/// One attempt to process a work item (maps to leases table)
#[derive(Debug, Clone, Serialize)]
pub struct Lease {
    pub id: i64,
    pub work_item_id: i64,
    pub allocation_id: i64,
    pub owner_instance_id: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_count: Option<i32>,
    pub rows_processed: Option<i32>,
    pub version: i32,
}

/// Opaque token for one allocation batch.
///
/// Only the allocator can mint one; the raw sequence value is not exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocationId(i64);

impl AllocationId {
    pub(crate) fn new(value: i64) -> Self {
        Self(value)
    }

    pub(crate) fn value(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for AllocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "alloc-{}", self.0)
    }
}

/// A work item claimed by the caller together with its fresh lease
#[derive(Debug, Clone)]
pub struct AllocatedItem {
    pub lease_id: i64,
    pub work_item_id: i64,
    pub location: BundleLocation,
    pub size_bytes: i64,
    pub bundle_type: BundleType,
    pub last_modified: DateTime<Utc>,
    pub version: i32,
    pub started_at: DateTime<Utc>,
}

/// Result of one `allocate` call
#[derive(Debug, Clone, Default)]
pub struct Allocation {
    id: Option<AllocationId>,
    items: Vec<AllocatedItem>,
}

impl Allocation {
    pub(crate) fn new(id: AllocationId, items: Vec<AllocatedItem>) -> Self {
        Self { id: Some(id), items }
    }

    pub(crate) fn empty() -> Self {
        Self::default()
    }

    /// The allocation token, or `None` when nothing was requested
    pub fn id(&self) -> Option<AllocationId> {
        self.id
    }

    pub fn items(&self) -> &[AllocatedItem] {
        &self.items
    }

    pub fn into_items(self) -> Vec<AllocatedItem> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Counts from one reclaim pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimSummary {
    pub instances_stopped: u64,
    pub items_released: u64,
    pub items_recycled: u64,
}

impl ReclaimSummary {
    pub fn is_empty(&self) -> bool {
        self.instances_stopped == 0 && self.items_released == 0 && self.items_recycled == 0
    }
}

/// A record ready to be checkpointed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedRecord {
    pub type_id: i32,
    pub natural_key: String,
    pub line_number: i64,
}

/// Outcome of a single checkpoint insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    Recorded,
    /// The natural key was already checkpointed; nothing was written
    Duplicate,
}

/// Totals from a batched checkpoint flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub recorded: u64,
    pub duplicates: u64,
}

impl std::ops::AddAssign for BatchOutcome {
    fn add_assign(&mut self, rhs: Self) {
        self.recorded += rhs.recorded;
        self.duplicates += rhs.duplicates;
    }
}

/// Snapshot of the shared work queue
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStatus {
    pub unclaimed_items: i64,
    pub claimed_items: i64,
    pub open_leases: i64,
    pub running_instances: i64,
    pub stopped_instances: i64,
}
