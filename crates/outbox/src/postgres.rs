use async_trait::async_trait;
use chrono::Utc;
use common::EventId;
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use crate::row::{OutboxRow, OutboxStatus};
use crate::store::{BusinessRecord, ParticipantStore};
use crate::{OutboxError, Result};

/// PostgreSQL-backed participant storage.
///
/// The business upsert and the outbox insert share one transaction; a
/// failure on either side rolls both back.
#[derive(Clone)]
pub struct PostgresParticipantStore {
    pool: PgPool,
}

impl PostgresParticipantStore {
    /// Creates a new PostgreSQL participant store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    fn row_to_outbox(row: PgRow) -> Result<OutboxRow> {
        let status: String = row.try_get("status")?;

        Ok(OutboxRow {
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            delivered_at: row.try_get("delivered_at")?,
            attempt_count: row.try_get::<i32, _>("attempt_count")? as u32,
            status: OutboxStatus::from_str_value(&status).ok_or_else(|| {
                OutboxError::Serialization(serde_json::Error::io(std::io::Error::other(
                    format!("invalid outbox status: {status}"),
                )))
            })?,
        })
    }
}

#[async_trait]
impl ParticipantStore for PostgresParticipantStore {
    async fn commit(&self, business: BusinessRecord, event: OutboxRow) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO business_records (id, kind, data, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET data = $3, updated_at = $4
            "#,
        )
        .bind(&business.id)
        .bind(&business.kind)
        .bind(&business.data)
        .bind(business.updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO outbox_events
                (event_id, aggregate_type, aggregate_id, event_type, payload,
                 created_at, delivered_at, attempt_count, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(event.event_id.as_uuid())
        .bind(&event.aggregate_type)
        .bind(&event.aggregate_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.created_at)
        .bind(event.delivered_at)
        .bind(event.attempt_count as i32)
        .bind(event.status.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxRow>> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, aggregate_type, aggregate_id, event_type, payload,
                   created_at, delivered_at, attempt_count, status
            FROM outbox_events
            WHERE status = 'PENDING'
            ORDER BY created_at ASC, event_id ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_outbox).collect()
    }

    async fn mark_delivered(&self, event_id: EventId) -> Result<()> {
        sqlx::query(
            "UPDATE outbox_events SET status = 'DELIVERED', delivered_at = $2 \
             WHERE event_id = $1 AND status = 'PENDING'",
        )
        .bind(event_id.as_uuid())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_publish_failure(
        &self,
        event_id: EventId,
        dead_after: u32,
    ) -> Result<OutboxStatus> {
        let status: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE outbox_events
            SET attempt_count = attempt_count + 1,
                status = CASE WHEN attempt_count + 1 >= $2 THEN 'DEAD' ELSE 'PENDING' END
            WHERE event_id = $1 AND status = 'PENDING'
            RETURNING status
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(dead_after as i32)
        .fetch_optional(&self.pool)
        .await?;

        match status {
            Some(status) => OutboxStatus::from_str_value(&status)
                .ok_or(OutboxError::RowNotFound(event_id)),
            None => {
                // Row already settled; report its current status.
                let current: Option<String> =
                    sqlx::query_scalar("SELECT status FROM outbox_events WHERE event_id = $1")
                        .bind(event_id.as_uuid())
                        .fetch_optional(&self.pool)
                        .await?;
                current
                    .and_then(|s| OutboxStatus::from_str_value(&s))
                    .ok_or(OutboxError::RowNotFound(event_id))
            }
        }
    }

    async fn get_business(&self, id: &str) -> Result<Option<BusinessRecord>> {
        let row = sqlx::query(
            "SELECT id, kind, data, updated_at FROM business_records WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(BusinessRecord {
                id: row.try_get("id")?,
                kind: row.try_get("kind")?,
                data: row.try_get("data")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }
}
