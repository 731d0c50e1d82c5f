//! Connection pool and the shared store handle

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::Arc;
use std::time::Duration;

use crate::dialect::{Dialect, PostgresDialect};
use crate::error::{LoaderError, LoaderResult};

pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_DB_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_DB_CONNECT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_DB_IDLE_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: Option<u64>,
}

impl DbConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            min_connections: DEFAULT_DB_MIN_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DB_CONNECT_TIMEOUT_SECS,
            idle_timeout_secs: Some(DEFAULT_DB_IDLE_TIMEOUT_SECS),
        }
    }

    pub fn from_lookup<F>(lookup: &F) -> LoaderResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup("DATABASE_URL")
            .ok_or_else(|| LoaderError::config("DATABASE_URL not set"))?;
        let mut config = Self::new(url);

        if let Some(v) = lookup("DB_MAX_CONNECTIONS").and_then(|s| s.parse().ok()) {
            config.max_connections = v;
        }
        if let Some(v) = lookup("DB_MIN_CONNECTIONS").and_then(|s| s.parse().ok()) {
            config.min_connections = v;
        }
        if let Some(v) = lookup("DB_CONNECT_TIMEOUT").and_then(|s| s.parse().ok()) {
            config.connect_timeout_secs = v;
        }
        if let Some(v) = lookup("DB_IDLE_TIMEOUT").and_then(|s| s.parse().ok()) {
            config.idle_timeout_secs = Some(v);
        }

        Ok(config)
    }

    pub fn validate(&self) -> LoaderResult<()> {
        if self.url.is_empty() {
            return Err(LoaderError::config("Database URL cannot be empty"));
        }
        if self.max_connections == 0 {
            return Err(LoaderError::config(
                "Database max_connections must be greater than 0",
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(LoaderError::config(format!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }
}

pub async fn create_pool(config: &DbConfig) -> LoaderResult<PgPool> {
    let mut options = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs));

    if let Some(idle_timeout) = config.idle_timeout_secs {
        options = options.idle_timeout(Duration::from_secs(idle_timeout));
    }

    let pool = options.connect(&config.url).await?;

    tracing::info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Database connection pool created"
    );

    Ok(pool)
}

/// Pool plus dialect, shared by every component. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Store {
    pool: PgPool,
    dialect: Arc<dyn Dialect>,
}

impl Store {
    pub fn new(pool: PgPool, dialect: Arc<dyn Dialect>) -> Self {
        Self { pool, dialect }
    }

    /// Store backed by PostgreSQL
    pub fn postgres(pool: PgPool) -> Self {
        Self::new(pool, Arc::new(PostgresDialect))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    /// Translate a driver error through the dialect
    pub(crate) fn classify(&self, err: sqlx::Error) -> LoaderError {
        self.dialect.classify(err)
    }

    /// `$1, $2, ...` style parameter list starting at `first`
    pub(crate) fn placeholders(&self, first: usize, count: usize) -> String {
        (first..first + count)
            .map(|i| self.dialect.placeholder(i))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub async fn health_check(&self) -> LoaderResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| self.classify(e))
    }
}
