use std::sync::Arc;

use sqlx::{PgPool, Pool, Postgres};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crawlq_core::error::AppError;
use crawlq_core::queue::{Delivery, MessageQueue};

use crate::config::QueueConfig;

/// PostgreSQL-backed message queue.
///
/// Consumers claim rows with `SELECT FOR UPDATE SKIP LOCKED` and hold them
/// under a lease. A message whose lease expires without an acknowledgement
/// becomes claimable again, which gives at-least-once delivery.
#[derive(Clone)]
pub struct PgMessageQueue {
    pool: Pool<Postgres>,
    config: QueueConfig,
    consumer_id: String,
    pollers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl PgMessageQueue {
    pub fn new(pool: PgPool, config: QueueConfig) -> Self {
        Self {
            pool,
            config,
            consumer_id: format!("consumer-{}", Uuid::new_v4()),
            pollers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Claim the oldest claimable message on `queue`, if any.
    pub async fn claim(&self, queue: &str) -> Result<Option<PgDelivery>, AppError> {
        let row = sqlx::query_as::<_, ClaimedRow>(
            r#"
            UPDATE queue_messages
            SET status = 'delivered',
                consumer_id = $2,
                lease_token = $3,
                lease_expires_at = NOW() + make_interval(secs => $4),
                delivery_count = delivery_count + 1,
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM queue_messages
                WHERE queue_name = $1
                  AND (status = 'ready'
                       OR (status = 'delivered' AND lease_expires_at < NOW()))
                ORDER BY id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, body, delivery_count, lease_token
            "#,
        )
        .bind(queue)
        .bind(&self.consumer_id)
        .bind(Uuid::new_v4())
        .bind(self.config.lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::QueueError(e.to_string()))?;

        Ok(row.map(|row| PgDelivery {
            pool: self.pool.clone(),
            id: row.id,
            lease_token: row.lease_token,
            body: row.body,
            delivery_count: row.delivery_count.max(0) as u32,
        }))
    }

    /// Wait for the pollers started by `consume` to exit.
    ///
    /// Returns once their cancellation tokens have fired and any claim in
    /// flight at that moment has landed.
    pub async fn join_pollers(&self) {
        let handles = std::mem::take(&mut *self.pollers.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(consumer = %self.consumer_id, error = %e, "Queue poller panicked");
            }
        }
    }

    /// Return every message still leased by this consumer to the ready state.
    ///
    /// Called on shutdown for deliveries that were buffered but never handed
    /// to a worker. Call [`join_pollers`](Self::join_pollers) first so a late
    /// claim is not left holding its lease.
    pub async fn release_unacked(&self) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET status = 'ready', consumer_id = NULL, lease_token = NULL,
                lease_expires_at = NULL, updated_at = NOW()
            WHERE consumer_id = $1 AND status = 'delivered'
            "#,
        )
        .bind(&self.consumer_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::QueueError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    /// Count messages on `queue` by status: (ready, delivered, dead).
    pub async fn depth(&self, queue: &str) -> Result<(i64, i64, i64), AppError> {
        sqlx::query_as::<_, (i64, i64, i64)>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'ready'),
                COUNT(*) FILTER (WHERE status = 'delivered'),
                COUNT(*) FILTER (WHERE status = 'dead')
            FROM queue_messages
            WHERE queue_name = $1
            "#,
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::QueueError(e.to_string()))
    }

    async fn is_declared(&self, queue: &str) -> Result<bool, AppError> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM queues WHERE name = $1)")
            .bind(queue)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::QueueError(e.to_string()))
    }

    async fn poll(self, queue: String, tx: mpsc::Sender<PgDelivery>, cancel: CancellationToken) {
        tracing::debug!(queue = %queue, consumer = %self.consumer_id, "Queue poller started");

        loop {
            // Only claim when a worker has room for the delivery.
            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                permit = tx.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let backoff = match self.claim(&queue).await {
                Ok(Some(delivery)) => {
                    permit.send(delivery);
                    continue;
                }
                Ok(None) => self.config.poll_interval,
                Err(e) => {
                    tracing::error!(queue = %queue, error = %e, "Failed to claim message");
                    self.config.poll_interval * 2
                }
            };
            drop(permit);

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(backoff) => {}
            }
        }

        tracing::debug!(queue = %queue, consumer = %self.consumer_id, "Queue poller stopped");
    }
}

#[derive(sqlx::FromRow)]
struct ClaimedRow {
    id: i64,
    body: Vec<u8>,
    delivery_count: i32,
    lease_token: Uuid,
}

fn is_foreign_key_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == "23503")
}

impl MessageQueue for PgMessageQueue {
    type Delivery = PgDelivery;

    async fn declare_queue(&self, queue: &str) -> Result<(), AppError> {
        sqlx::query("INSERT INTO queues (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(queue)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::QueueError(e.to_string()))?;

        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8], persistent: bool) -> Result<(), AppError> {
        sqlx::query("INSERT INTO queue_messages (queue_name, body, persistent) VALUES ($1, $2, $3)")
            .bind(queue)
            .bind(body)
            .bind(persistent)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_foreign_key_violation(&e) {
                    AppError::QueueError(format!("queue '{queue}' is not declared"))
                } else {
                    AppError::QueueError(e.to_string())
                }
            })?;

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<PgDelivery>, AppError> {
        if !self.is_declared(queue).await? {
            return Err(AppError::QueueError(format!(
                "queue '{queue}' is not declared"
            )));
        }

        let (tx, rx) = mpsc::channel(self.config.prefetch.max(1));
        let poller = tokio::spawn(self.clone().poll(queue.to_string(), tx, cancel));
        self.pollers.lock().await.push(poller);
        Ok(rx)
    }
}

/// A message claimed from [`PgMessageQueue`].
///
/// Acknowledgements only apply while this delivery still holds the lease;
/// once another consumer has reclaimed the message they fail with
/// [`AppError::QueueError`].
#[derive(Debug)]
pub struct PgDelivery {
    pool: Pool<Postgres>,
    id: i64,
    lease_token: Uuid,
    body: Vec<u8>,
    delivery_count: u32,
}

impl PgDelivery {
    pub fn id(&self) -> i64 {
        self.id
    }

    /// 1 on first delivery.
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    async fn settle(&self, sql: &str, action: &str) -> Result<(), AppError> {
        let result = sqlx::query(sql)
            .bind(self.id)
            .bind(self.lease_token)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::QueueError(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(AppError::QueueError(format!(
                "cannot {action} message {}: lease lost",
                self.id
            )));
        }
        Ok(())
    }
}

impl Delivery for PgDelivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    async fn success(self) -> Result<(), AppError> {
        self.settle(
            "DELETE FROM queue_messages WHERE id = $1 AND lease_token = $2",
            "ack",
        )
        .await
    }

    async fn try_again(self) -> Result<(), AppError> {
        self.settle(
            r#"
            UPDATE queue_messages
            SET status = 'ready', consumer_id = NULL, lease_token = NULL,
                lease_expires_at = NULL, updated_at = NOW()
            WHERE id = $1 AND lease_token = $2
            "#,
            "requeue",
        )
        .await
    }

    async fn reject(self) -> Result<(), AppError> {
        self.settle(
            r#"
            UPDATE queue_messages
            SET status = 'dead', consumer_id = NULL, lease_token = NULL,
                lease_expires_at = NULL, dead_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND lease_token = $2
            "#,
            "reject",
        )
        .await
    }
}

