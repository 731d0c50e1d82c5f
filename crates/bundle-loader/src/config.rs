//! Loader configuration
//!
//! Read from the environment (after loading `.env`). Every knob has a
//! default; only `DATABASE_URL` is mandatory.

use std::time::Duration;

use crate::db::DbConfig;
use crate::error::{LoaderError, LoaderResult};
use crate::types::BundleType;

pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_ALLOCATION_BATCH_SIZE: u32 = 10;
pub const DEFAULT_CHECKPOINT_BATCH_SIZE: usize = 500;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_BUNDLE_TYPE: BundleType = BundleType::Ndjson;

/// Six bind parameters per checkpoint row against the PostgreSQL limit of 65535
pub const MAX_CHECKPOINT_BATCH_SIZE: usize = 10_000;

/// Longest heartbeat timeout or recycle delay accepted (100 years)
pub const MAX_RECLAIM_WINDOW: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub database: DbConfig,
    /// How often a running loader refreshes its heartbeat
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which peers consider an instance dead
    pub heartbeat_timeout: Duration,
    /// Cool-down before completed work returns to the pool; `None` disables
    /// recycling
    pub recycle_after: Option<Duration>,
    pub allocation_batch_size: u32,
    pub checkpoint_batch_size: usize,
    /// Idle wait between passes that found nothing to do
    pub poll_interval: Duration,
    pub bundle_type: BundleType,
    pub reclaim_enabled: bool,
}

impl LoaderConfig {
    /// Defaults for everything except the database
    pub fn new(database: DbConfig) -> Self {
        Self {
            database,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            heartbeat_timeout: Duration::from_millis(DEFAULT_HEARTBEAT_TIMEOUT_MS),
            recycle_after: None,
            allocation_batch_size: DEFAULT_ALLOCATION_BATCH_SIZE,
            checkpoint_batch_size: DEFAULT_CHECKPOINT_BATCH_SIZE,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            bundle_type: DEFAULT_BUNDLE_TYPE,
            reclaim_enabled: true,
        }
    }

    pub fn from_env() -> LoaderResult<Self> {
        dotenvy::dotenv().ok();
        let config = Self::from_lookup(&|key: &str| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_lookup<F>(lookup: &F) -> LoaderResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new(DbConfig::from_lookup(lookup)?);

        if let Some(secs) = parse_var::<u64, _>(lookup, "LOADER_HEARTBEAT_INTERVAL_SECS")? {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_var::<u64, _>(lookup, "LOADER_HEARTBEAT_TIMEOUT_MS")? {
            config.heartbeat_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<i64, _>(lookup, "LOADER_RECYCLE_SECONDS")? {
            if secs < 0 {
                return Err(LoaderError::config(format!(
                    "LOADER_RECYCLE_SECONDS must not be negative, got {}",
                    secs
                )));
            }
            config.recycle_after = Some(Duration::from_secs(secs.unsigned_abs()));
        }
        if let Some(n) = parse_var(lookup, "LOADER_ALLOCATION_BATCH_SIZE")? {
            config.allocation_batch_size = n;
        }
        if let Some(n) = parse_var(lookup, "LOADER_CHECKPOINT_BATCH_SIZE")? {
            config.checkpoint_batch_size = n;
        }
        if let Some(secs) = parse_var::<u64, _>(lookup, "LOADER_POLL_INTERVAL_SECS")? {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(value) = lookup("LOADER_BUNDLE_TYPE") {
            config.bundle_type = value.parse()?;
        }
        if let Some(enabled) = parse_var(lookup, "LOADER_RECLAIM_ENABLED")? {
            config.reclaim_enabled = enabled;
        }

        Ok(config)
    }

    pub fn validate(&self) -> LoaderResult<()> {
        self.database.validate()?;

        if self.allocation_batch_size == 0 {
            return Err(LoaderError::config(
                "LOADER_ALLOCATION_BATCH_SIZE must be greater than 0",
            ));
        }
        if self.checkpoint_batch_size == 0 || self.checkpoint_batch_size > MAX_CHECKPOINT_BATCH_SIZE {
            return Err(LoaderError::config(format!(
                "LOADER_CHECKPOINT_BATCH_SIZE must be between 1 and {}",
                MAX_CHECKPOINT_BATCH_SIZE
            )));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(LoaderError::config(
                "LOADER_HEARTBEAT_INTERVAL_SECS must be greater than 0",
            ));
        }
        check_reclaim_window("heartbeat timeout", self.heartbeat_timeout)?;
        if let Some(recycle_after) = self.recycle_after {
            check_reclaim_window("recycle delay", recycle_after)?;
        }
        if self.heartbeat_interval >= self.heartbeat_timeout {
            return Err(LoaderError::config(format!(
                "heartbeat interval ({:?}) must be shorter than the heartbeat timeout ({:?})",
                self.heartbeat_interval, self.heartbeat_timeout
            )));
        }

        Ok(())
    }
}

/// Reject reclaim windows longer than [`MAX_RECLAIM_WINDOW`]
pub fn check_reclaim_window(name: &str, window: Duration) -> LoaderResult<()> {
    if window > MAX_RECLAIM_WINDOW {
        return Err(LoaderError::config(format!(
            "{} of {:?} exceeds the maximum of {:?}",
            name, window, MAX_RECLAIM_WINDOW
        )));
    }
    Ok(())
}

fn parse_var<T, F>(lookup: &F, key: &str) -> LoaderResult<Option<T>>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| LoaderError::config(format!("Invalid value for {}: {}", key, raw))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let mut map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        map.entry("DATABASE_URL".to_string())
            .or_insert_with(|| "postgresql://localhost/loader".to_string());
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = LoaderConfig::from_lookup(&lookup_from(&[])).unwrap();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.heartbeat_timeout, Duration::from_millis(60_000));
        assert_eq!(config.recycle_after, None);
        assert_eq!(config.allocation_batch_size, DEFAULT_ALLOCATION_BATCH_SIZE);
        assert_eq!(config.bundle_type, BundleType::Ndjson);
        assert!(config.reclaim_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let config = LoaderConfig::from_lookup(&lookup_from(&[
            ("LOADER_RECYCLE_SECONDS", "0"),
            ("LOADER_BUNDLE_TYPE", "json"),
            ("LOADER_RECLAIM_ENABLED", "false"),
            ("LOADER_CHECKPOINT_BATCH_SIZE", "50"),
        ]))
        .unwrap();
        assert_eq!(config.recycle_after, Some(Duration::ZERO));
        assert_eq!(config.bundle_type, BundleType::Json);
        assert!(!config.reclaim_enabled);
        assert_eq!(config.checkpoint_batch_size, 50);
    }

    #[test]
    fn test_negative_recycle_rejected() {
        let result = LoaderConfig::from_lookup(&lookup_from(&[("LOADER_RECYCLE_SECONDS", "-1")]));
        assert!(matches!(result, Err(LoaderError::Config(_))));
    }

    #[test]
    fn test_garbage_number_rejected() {
        let result =
            LoaderConfig::from_lookup(&lookup_from(&[("LOADER_ALLOCATION_BATCH_SIZE", "ten")]));
        assert!(matches!(result, Err(LoaderError::Config(_))));
    }

    #[test]
    fn test_unknown_bundle_type_rejected() {
        let result = LoaderConfig::from_lookup(&lookup_from(&[("LOADER_BUNDLE_TYPE", "csv")]));
        assert!(matches!(result, Err(LoaderError::Bundle(_))));
    }

    #[test]
    fn test_validate_rejects_zero_batches() {
        let mut config = LoaderConfig::new(DbConfig::new("postgresql://localhost/loader"));
        config.allocation_batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = LoaderConfig::new(DbConfig::new("postgresql://localhost/loader"));
        config.checkpoint_batch_size = 0;
        assert!(config.validate().is_err());

        config.checkpoint_batch_size = MAX_CHECKPOINT_BATCH_SIZE + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unrepresentable_windows() {
        let mut config = LoaderConfig::new(DbConfig::new("postgresql://localhost/loader"));
        config.heartbeat_timeout = Duration::from_millis(u64::MAX);
        assert!(matches!(config.validate(), Err(LoaderError::Config(_))));

        let mut config = LoaderConfig::new(DbConfig::new("postgresql://localhost/loader"));
        config.recycle_after = Some(MAX_RECLAIM_WINDOW + Duration::from_secs(1));
        assert!(matches!(config.validate(), Err(LoaderError::Config(_))));

        config.recycle_after = Some(MAX_RECLAIM_WINDOW);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_heartbeat_window() {
        let mut config = LoaderConfig::new(DbConfig::new("postgresql://localhost/loader"));
        config.heartbeat_interval = Duration::from_secs(60);
        config.heartbeat_timeout = Duration::from_secs(60);
        assert!(config.validate().is_err());
    }
}
