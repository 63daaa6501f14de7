//! PostgreSQL store implementation.

use std::time::Duration;

use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use super::UnitOfWork;
use super::outbox::{DeadLetterQuery, OutboxStore};
use crate::error::{Error, Result};
use crate::message::{MessageHeaders, OutboxMessage, OutboxStatus, RetryDecision, StoredMessage};

const MESSAGE_COLUMNS: &str = "id, destination, payload, headers, status, attempts, created_at, \
     last_attempt_at, published_at, next_retry_at, last_error";

/// PostgreSQL-backed store for production use.
///
/// Claims use `FOR UPDATE SKIP LOCKED`, so any number of processors can poll
/// the same table: a row locked by one claimer is skipped by the others, and
/// the status flip to `PROCESSING` happens in the same statement.
///
/// # Database Schema
///
/// Requires the `outbox_relay.outbox` table from `migrations/`, with the
/// `(status, next_retry_at, created_at)` index serving the claim query.
///
/// # Clocks
///
/// Claim and stale-release timestamps are computed in the database to avoid
/// skew between processors. `published_at` and `next_retry_at` come from the
/// processor's clock.
///
/// # Example
///
/// ```ignore
/// use outbox_relay::{PgStore, OutboxStore, UnitOfWork};
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://...").await?;
/// let store = PgStore::new(pool);
///
/// let mut uow = store.begin().await?;
/// sqlx::query("UPDATE orders SET state = 'placed' WHERE id = $1")
///     .bind(order_id)
///     .execute(&mut **uow.transaction())
///     .await?;
/// uow.append(message).await?;
/// uow.commit().await?;
/// ```
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    destination: String,
    payload: Vec<u8>,
    headers: Json<MessageHeaders>,
    status: String,
    attempts: i32,
    created_at: OffsetDateTime,
    last_attempt_at: Option<OffsetDateTime>,
    published_at: Option<OffsetDateTime>,
    next_retry_at: OffsetDateTime,
    last_error: Option<String>,
}

impl TryFrom<MessageRow> for OutboxMessage {
    type Error = Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        Ok(OutboxMessage::from(StoredMessage {
            id: row.id,
            destination: row.destination,
            payload: row.payload,
            headers: row.headers.0,
            status: row.status.parse()?,
            attempts: u32::try_from(row.attempts).unwrap_or_default(),
            created_at: row.created_at,
            last_attempt_at: row.last_attempt_at,
            published_at: row.published_at,
            next_retry_at: row.next_retry_at,
            last_error: row.last_error,
        }))
    }
}

impl PgStore {
    /// Create a new PostgreSQL store from a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Explain a status update that matched no `PROCESSING` row.
    ///
    /// `Ok(())` when the message already reached `target`, which makes
    /// repeated acknowledgements idempotent.
    async fn explain_missed_update(&self, id: Uuid, target: OutboxStatus) -> Result<()> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM outbox_relay.outbox WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        let Some(status) = status else {
            return Err(Error::MessageNotFound(id));
        };
        let current: OutboxStatus = status.parse()?;
        if current == target && target == OutboxStatus::Published {
            return Ok(());
        }
        Err(Error::invalid_transition(id, current, target))
    }
}

/// Insert `message` inside a transaction the caller already owns.
///
/// This is what [`PgUnitOfWork::append`] runs; use it directly when the
/// business code manages its own `sqlx` transaction.
pub async fn append_in(tx: &mut Transaction<'_, Postgres>, message: &OutboxMessage) -> Result<()> {
    if message.status() != OutboxStatus::Pending {
        return Err(Error::invalid_transition(
            message.id(),
            message.status(),
            OutboxStatus::Pending,
        ));
    }

    let result = sqlx::query(
        r#"INSERT INTO outbox_relay.outbox
               (id, destination, payload, headers, status, attempts, created_at, next_retry_at)
           VALUES ($1, $2, $3, $4, 'PENDING', 0, $5, $6)"#,
    )
    .bind(message.id())
    .bind(message.destination())
    .bind(message.payload())
    .bind(Json(message.headers()))
    .bind(message.created_at())
    .bind(message.next_retry_at())
    .execute(&mut **tx)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            Err(Error::DuplicateMessage(message.id()))
        }
        Err(e) => Err(e.into()),
    }
}

/// PostgreSQL unit of work.
///
/// Wraps a transaction shared with the caller's business writes.
pub struct PgUnitOfWork<'a> {
    tx: Transaction<'a, Postgres>,
    aborted: bool,
}

impl<'a> PgUnitOfWork<'a> {
    /// The underlying transaction, for business writes that must commit
    /// together with the appended messages.
    pub fn transaction(&mut self) -> &mut Transaction<'a, Postgres> {
        &mut self.tx
    }
}

impl UnitOfWork for PgUnitOfWork<'_> {
    async fn append(&mut self, message: OutboxMessage) -> Result<()> {
        if self.aborted {
            return Err(Error::UnitOfWorkClosed);
        }
        // Postgres aborts the transaction on any failed statement.
        let result = append_in(&mut self.tx, &message).await;
        if result.is_err() {
            self.aborted = true;
        }
        result
    }

    async fn commit(self) -> Result<()> {
        if self.aborted {
            return Err(Error::UnitOfWorkClosed);
        }
        self.tx.commit().await?;
        Ok(())
    }
}

impl OutboxStore for PgStore {
    type UnitOfWork<'a> = PgUnitOfWork<'a>;

    async fn begin<'a>(&'a self) -> Result<Self::UnitOfWork<'a>> {
        let tx = self.pool.begin().await?;
        Ok(PgUnitOfWork { tx, aborted: false })
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<OutboxMessage>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let sql = format!(
            r#"
            WITH due AS (
                SELECT id FROM outbox_relay.outbox
                WHERE status IN ('PENDING', 'FAILED')
                  AND next_retry_at <= now()
                ORDER BY created_at, id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_relay.outbox AS o
            SET status = 'PROCESSING',
                last_attempt_at = now()
            FROM due
            WHERE o.id = due.id
            RETURNING {}
            "#,
            prefixed_columns("o")
        );

        let rows: Vec<MessageRow> = sqlx::query_as(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        // RETURNING does not preserve the CTE's ordering.
        let mut claimed = rows
            .into_iter()
            .map(OutboxMessage::try_from)
            .collect::<Result<Vec<_>>>()?;
        claimed.sort_by_key(|m| (m.created_at(), m.id()));
        Ok(claimed)
    }

    async fn mark_published(&self, id: Uuid, published_at: OffsetDateTime) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_relay.outbox
            SET status = 'PUBLISHED',
                published_at = $2
            WHERE id = $1
              AND status = 'PROCESSING'
            "#,
        )
        .bind(id)
        .bind(published_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return self
                .explain_missed_update(id, OutboxStatus::Published)
                .await;
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        reason: &str,
        attempts: u32,
        decision: RetryDecision,
    ) -> Result<()> {
        let retry_at = match decision {
            RetryDecision::RetryAt(at) => Some(at),
            RetryDecision::DeadLetter => None,
        };
        let target = decision.target_status();

        let result = sqlx::query(
            r#"
            UPDATE outbox_relay.outbox
            SET status = $2,
                attempts = GREATEST(attempts, $3),
                last_error = $4,
                next_retry_at = COALESCE($5, next_retry_at)
            WHERE id = $1
              AND status = 'PROCESSING'
            "#,
        )
        .bind(id)
        .bind(target.as_str())
        .bind(i32::try_from(attempts).unwrap_or(i32::MAX))
        .bind(reason)
        .bind(retry_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return self.explain_missed_update(id, target).await;
        }
        Ok(())
    }

    async fn count_by_status(&self, status: OutboxStatus) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM outbox_relay.outbox WHERE status = $1")
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn release_stale(&self, older_than: Duration) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_relay.outbox
            SET status = 'PENDING'
            WHERE status = 'PROCESSING'
              AND (last_attempt_at IS NULL
                   OR last_attempt_at < now() - ($1 * interval '1 second'))
            "#,
        )
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxMessage>> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM outbox_relay.outbox WHERE id = $1");
        let row: Option<MessageRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(OutboxMessage::try_from).transpose()
    }

    async fn fetch_dead_letters(&self, query: &DeadLetterQuery) -> Result<Vec<OutboxMessage>> {
        let sql = format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM outbox_relay.outbox
            WHERE status = 'DEAD'
              AND ($1::text IS NULL OR destination = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#
        );
        let rows: Vec<MessageRow> = sqlx::query_as(&sql)
            .bind(query.destination.as_deref())
            .bind(query.effective_limit() as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(OutboxMessage::try_from).collect()
    }
}

fn prefixed_columns(alias: &str) -> String {
    MESSAGE_COLUMNS
        .split(", ")
        .map(|column| format!("{alias}.{column}"))
        .collect::<Vec<_>>()
        .join(", ")
}
