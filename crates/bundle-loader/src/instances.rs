//! Loader instance registry
//!
//! Each loader process registers once and then refreshes its heartbeat on a
//! fixed interval from a dedicated task, so a worker busy with a large bundle
//! still reports liveness. An instance is marked STOPPED by a peer's reclaim
//! pass, or by itself when a single-pass run exits.

use sqlx::FromRow;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use uuid::Uuid;

use crate::db::Store;
use crate::error::{LoaderError, LoaderResult};
use crate::types::{InstanceRecord, InstanceStatus, LoaderInstance};

#[derive(Debug, Clone)]
pub struct InstanceRegistry {
    store: Store,
}

#[derive(FromRow)]
struct InstanceRow {
    id: i64,
    instance_key: String,
    host: String,
    pid: i32,
    heartbeat_time: chrono::DateTime<chrono::Utc>,
    status: String,
}

impl InstanceRegistry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Register a new RUNNING instance with a freshly minted key
    pub async fn register(&self, host: &str, pid: u32) -> LoaderResult<LoaderInstance> {
        let stored_pid = i32::try_from(pid).map_err(|_| {
            LoaderError::invariant(format!("process id {} does not fit the store", pid))
        })?;
        let key = Uuid::new_v4();
        let d = self.store.dialect();
        let sql = format!(
            "INSERT INTO loader_instances (instance_key, host, pid, heartbeat_time, status) \
             VALUES ({}, {}, {}, {}, '{}') RETURNING id",
            d.placeholder(1),
            d.placeholder(2),
            d.placeholder(3),
            d.current_timestamp(),
            InstanceStatus::Running.as_str()
        );

        let id: i64 = sqlx::query_scalar(&sql)
            .bind(key.to_string())
            .bind(host)
            .bind(stored_pid)
            .fetch_one(self.store.pool())
            .await
            .map_err(|e| self.store.classify(e))?;

        tracing::info!(instance_id = id, instance_key = %key, host, pid, "Registered loader instance");

        Ok(LoaderInstance {
            id,
            key,
            host: host.to_string(),
            pid,
        })
    }

    /// Register using this machine's host name and process id
    pub async fn register_current_process(&self) -> LoaderResult<LoaderInstance> {
        let host = hostname::get()
            .unwrap_or_else(|_| "unknown".into())
            .to_string_lossy()
            .to_string();
        self.register(&host, std::process::id()).await
    }

    /// Refresh the heartbeat. Returns `false` when the instance is no longer
    /// RUNNING, meaning a peer has already judged it dead.
    pub async fn heartbeat(&self, instance: &LoaderInstance) -> LoaderResult<bool> {
        let d = self.store.dialect();
        let sql = format!(
            "UPDATE loader_instances SET heartbeat_time = {} WHERE id = {} AND status = '{}'",
            d.current_timestamp(),
            d.placeholder(1),
            InstanceStatus::Running.as_str()
        );

        let result = sqlx::query(&sql)
            .bind(instance.id)
            .execute(self.store.pool())
            .await
            .map_err(|e| self.store.classify(e))?;

        Ok(result.rows_affected() == 1)
    }

    /// Mark the instance STOPPED. Returns `false` when it already was.
    pub async fn stop(&self, instance: &LoaderInstance) -> LoaderResult<bool> {
        let d = self.store.dialect();
        let sql = format!(
            "UPDATE loader_instances SET status = '{}' WHERE id = {} AND status = '{}'",
            InstanceStatus::Stopped.as_str(),
            d.placeholder(1),
            InstanceStatus::Running.as_str()
        );

        let result = sqlx::query(&sql)
            .bind(instance.id)
            .execute(self.store.pool())
            .await
            .map_err(|e| self.store.classify(e))?;

        let stopped = result.rows_affected() == 1;
        if stopped {
            tracing::info!(instance_id = instance.id, "Loader instance stopped");
        }
        Ok(stopped)
    }

    /// Run `heartbeat` every `period` until the instance is stopped by a peer
    /// (`Ok`) or a write fails (`Err`). Abort the handle on shutdown.
    pub fn spawn_heartbeat(
        &self,
        instance: LoaderInstance,
        period: Duration,
    ) -> JoinHandle<LoaderResult<()>> {
        let registry = self.clone();

        tokio::spawn(async move {
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                timer.tick().await;

                match registry.heartbeat(&instance).await {
                    Ok(true) => {
                        tracing::trace!(instance_id = instance.id, "Heartbeat");
                    },
                    Ok(false) => {
                        tracing::warn!(
                            instance_id = instance.id,
                            "Instance was marked stopped by a peer, heartbeat ending"
                        );
                        return Ok(());
                    },
                    Err(e) => {
                        tracing::error!(instance_id = instance.id, error = %e, "Heartbeat failed");
                        return Err(e);
                    },
                }
            }
        })
    }

    /// Look up the stored state of an instance
    pub async fn fetch(&self, instance_id: i64) -> LoaderResult<Option<InstanceRecord>> {
        let sql = format!(
            "SELECT id, instance_key, host, pid, heartbeat_time, status \
             FROM loader_instances WHERE id = {}",
            self.store.dialect().placeholder(1)
        );

        let row: Option<InstanceRow> = sqlx::query_as(&sql)
            .bind(instance_id)
            .fetch_optional(self.store.pool())
            .await
            .map_err(|e| self.store.classify(e))?;

        row.map(|r| {
            Ok(InstanceRecord {
                id: r.id,
                instance_key: r.instance_key,
                host: r.host,
                pid: r.pid,
                heartbeat_time: r.heartbeat_time,
                status: InstanceStatus::from_stored(&r.status)?,
            })
        })
        .transpose()
    }
}
