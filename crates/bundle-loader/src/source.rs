//! Bundle sources
//!
//! A [`BundleSource`] turns a claimed work item into numbered lines, each
//! either a parsed record or the reason it could not be parsed. The engine
//! only needs the resource type and natural key of a record to checkpoint it.

use async_trait::async_trait;
use bundle_common::{BundleError, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::types::{AllocatedItem, BundleLocation, BundleType};

/// The identity of one ingested resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    pub resource_type: String,
    pub natural_key: String,
}

/// One numbered line (or bundle entry) of a work item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLine {
    /// 1-based
    pub line_number: i64,
    pub record: std::result::Result<SourceRecord, String>,
}

/// Reads the records of a claimed bundle
#[async_trait]
pub trait BundleSource: Send + Sync {
    /// Read the lines of `item` numbered above `skip_lines`
    ///
    /// # Arguments
    /// * `item` - The allocated work item
    /// * `skip_lines` - Highest line already checkpointed for the current
    ///   version (0 to read everything)
    ///
    /// # Returns
    /// Lines in ascending order. An `Err` means the bundle as a whole could
    /// not be read; per-line problems are reported inside [`SourceLine`].
    async fn read_records(&self, item: &AllocatedItem, skip_lines: i64) -> Result<Vec<SourceLine>>;
}

/// Reads bundles from a directory laid out as `<root>/<container>/<path>/<name>`
#[derive(Debug, Clone)]
pub struct LocalNdjsonSource {
    root: PathBuf,
}

impl LocalNdjsonSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, location: &BundleLocation) -> PathBuf {
        let mut path = self.root.join(&location.container);
        if !location.path.is_empty() {
            path.push(&location.path);
        }
        path.push(&location.name);
        path
    }
}

#[async_trait]
impl BundleSource for LocalNdjsonSource {
    async fn read_records(&self, item: &AllocatedItem, skip_lines: i64) -> Result<Vec<SourceLine>> {
        let path = self.path_for(&item.location);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BundleError::BundleNotFound(path.display().to_string()));
            },
            Err(e) => return Err(e.into()),
        };

        let lines = match item.bundle_type {
            BundleType::Ndjson => parse_ndjson(&content, skip_lines),
            BundleType::Json => parse_json_bundle(&content, skip_lines)?,
        };

        tracing::debug!(
            work_item_id = item.work_item_id,
            path = %path.display(),
            skip_lines,
            lines = lines.len(),
            "Read bundle"
        );

        Ok(lines)
    }
}

fn parse_ndjson(content: &str, skip_lines: i64) -> Vec<SourceLine> {
    content
        .lines()
        .enumerate()
        .map(|(idx, line)| (idx as i64 + 1, line))
        .filter(|(line_number, line)| *line_number > skip_lines && !line.trim().is_empty())
        .map(|(line_number, line)| SourceLine {
            line_number,
            record: serde_json::from_str::<Value>(line)
                .map_err(|e| e.to_string())
                .and_then(|value| identify(&value)),
        })
        .collect()
}

/// A JSON bundle is one document; entry `i` of its `entry` array counts as
/// line `i + 1`.
fn parse_json_bundle(content: &str, skip_lines: i64) -> Result<Vec<SourceLine>> {
    let document: Value = serde_json::from_str(content)?;
    let entries = document
        .get("entry")
        .and_then(Value::as_array)
        .ok_or_else(|| BundleError::parse(0, "bundle has no entry array"))?;

    Ok(entries
        .iter()
        .enumerate()
        .map(|(idx, entry)| (idx as i64 + 1, entry))
        .filter(|(line_number, _)| *line_number > skip_lines)
        .map(|(line_number, entry)| SourceLine {
            line_number,
            record: match entry.get("resource") {
                Some(resource) => identify(resource),
                None => Err("entry has no resource".to_string()),
            },
        })
        .collect())
}

fn identify(resource: &Value) -> std::result::Result<SourceRecord, String> {
    let resource_type = resource
        .get("resourceType")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or("missing resourceType")?;
    let natural_key = resource
        .get("id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or("missing id")?;

    Ok(SourceRecord {
        resource_type: resource_type.to_string(),
        natural_key: natural_key.to_string(),
    })
}
