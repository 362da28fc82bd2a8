use crate::error::{IngestError, Result};
use crate::resilience::RetryExecutor;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Pool sizing and timeouts
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: crate::constants::database::DEFAULT_MAX_CONNECTIONS,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300), // 5 minutes
            max_lifetime: Duration::from_secs(3600), // 1 hour
        }
    }
}

impl PoolSettings {
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections.max(1);
        self.min_connections = self.min_connections.min(self.max_connections);
        self
    }
}

pub struct DatabaseConnection {
    pool: PgPool,
}

impl DatabaseConnection {
    /// Build the pool and ping it, retrying the whole bring-up with `retry`.
    /// Exhausting the policy is fatal to startup.
    pub async fn connect(
        dsn: &str,
        settings: &PoolSettings,
        retry: &RetryExecutor,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        info!(
            max_connections = settings.max_connections,
            acquire_timeout_secs = settings.acquire_timeout.as_secs(),
            "🔌 Connecting to PostgreSQL"
        );

        let pool = retry
            .run("connect_database", cancel, || Self::open(dsn, settings))
            .await
            .map_err(IngestError::from)?;

        info!(
            pool_size = pool.size(),
            "✅ Database pool initialized"
        );

        Ok(Self { pool })
    }

    async fn open(dsn: &str, settings: &PoolSettings) -> Result<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(settings.acquire_timeout)
            .idle_timeout(settings.idle_timeout)
            .max_lifetime(settings.max_lifetime)
            .connect(dsn)
            .await
            .map_err(|e| IngestError::from_sqlx("connect_database", e))?;

        if let Err(err) = ping(&pool).await {
            pool.close().await;
            return Err(err);
        }
        Ok(pool)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn into_pool(self) -> PgPool {
        self.pool
    }

    pub async fn health_check(&self) -> Result<bool> {
        ping(&self.pool).await.map(|()| true)
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

async fn ping(pool: &PgPool) -> Result<()> {
    let row = sqlx::query("SELECT 1 AS health")
        .fetch_one(pool)
        .await
        .map_err(|e| IngestError::from_sqlx("ping_database", e))?;

    let health: i32 = row.get("health");
    if health == 1 {
        Ok(())
    } else {
        Err(IngestError::database_connection(format!(
            "unexpected health check result: {health}"
        )))
    }
}
