use crawlq_core::AppError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::{DatabaseConfig, QueueConfig};
use crate::queue_repository::PgMessageQueue;
use crate::record_repository::PgRecordStore;

/// Owns the connection pool, runs migrations and vends the record store
/// and message queue.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL with the given configuration, retrying up to
    /// `connect_attempts` times.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let attempts = config.connect_attempts.max(1);
        let mut attempt = 0;
        let pool = loop {
            attempt += 1;
            match PgPoolOptions::new()
                .max_connections(config.max_connections)
                .acquire_timeout(config.acquire_timeout)
                .connect(&config.url)
                .await
            {
                Ok(pool) => break pool,
                Err(e) if attempt >= attempts => {
                    return Err(AppError::DatabaseError(format!(
                        "Failed to connect after {attempts} attempts: {e}"
                    )));
                }
                Err(e) => {
                    tracing::warn!(attempt, attempts, error = %e, "Database connection failed, retrying");
                    tokio::time::sleep(config.connect_retry_delay).await;
                }
            }
        };

        Ok(Self { pool })
    }

    /// Create a `Database` from an existing pool (useful for testing).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    pub fn record_store(&self) -> PgRecordStore {
        PgRecordStore::new(self.pool.clone())
    }

    pub fn message_queue(&self, config: QueueConfig) -> PgMessageQueue {
        PgMessageQueue::new(self.pool.clone(), config)
    }

    /// Check database connectivity.
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
