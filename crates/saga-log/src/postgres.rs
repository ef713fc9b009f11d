use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::SagaId;
use saga_core::{SagaInstance, SagaStatus, StepResult};
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use crate::error::SagaLogError;
use crate::store::SagaLogStore;
use crate::Result;

const COLUMNS: &str = "saga_id, definition_id, status, current_step_index, step_results, \
     input_payload, client_request_id, owner_id, lease_expiry, created_at, updated_at, \
     deadline_at, failure_reason";

/// PostgreSQL-backed saga log implementation.
#[derive(Clone)]
pub struct PostgresSagaLog {
    pool: PgPool,
}

impl PostgresSagaLog {
    /// Creates a new PostgreSQL saga log.
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

    fn row_to_saga(row: PgRow) -> Result<SagaInstance> {
        let status: String = row.try_get("status")?;
        let step_results: serde_json::Value = row.try_get("step_results")?;
        let step_results: Vec<StepResult> = serde_json::from_value(step_results)?;

        Ok(SagaInstance {
            saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
            definition_id: row.try_get("definition_id")?,
            status: SagaStatus::from_str_value(&status).map_err(|e| {
                SagaLogError::Serialization(serde_json::Error::io(std::io::Error::other(
                    e.to_string(),
                )))
            })?,
            current_step_index: row.try_get::<i64, _>("current_step_index")? as usize,
            step_results,
            input_payload: row.try_get("input_payload")?,
            client_request_id: row.try_get("client_request_id")?,
            owner_id: row.try_get("owner_id")?,
            lease_expiry: row.try_get("lease_expiry")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            deadline_at: row.try_get("deadline_at")?,
            failure_reason: row.try_get("failure_reason")?,
        })
    }

    async fn held_by(&self, saga_id: SagaId) -> Result<String> {
        let owner: Option<Option<String>> =
            sqlx::query_scalar("SELECT owner_id FROM saga_log WHERE saga_id = $1")
                .bind(saga_id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;

        match owner {
            None => Err(SagaLogError::NotFound(saga_id)),
            Some(owner) => Ok(owner.unwrap_or_else(|| "<none>".into())),
        }
    }
}

#[async_trait]
impl SagaLogStore for PostgresSagaLog {
    async fn insert(&self, saga: &SagaInstance) -> Result<()> {
        let step_results = serde_json::to_value(&saga.step_results)?;

        let result = sqlx::query(
            r#"
            INSERT INTO saga_log
                (saga_id, definition_id, status, current_step_index, step_results,
                 input_payload, client_request_id, owner_id, lease_expiry,
                 created_at, updated_at, deadline_at, failure_reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(saga.saga_id.as_uuid())
        .bind(&saga.definition_id)
        .bind(saga.status.as_str())
        .bind(saga.current_step_index as i64)
        .bind(&step_results)
        .bind(&saga.input_payload)
        .bind(&saga.client_request_id)
        .bind(&saga.owner_id)
        .bind(saga.lease_expiry)
        .bind(saga.created_at)
        .bind(saga.updated_at)
        .bind(saga.deadline_at)
        .bind(&saga.failure_reason)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err))
                if db_err.constraint() == Some("saga_log_pkey") =>
            {
                Err(SagaLogError::AlreadyExists(saga.saga_id))
            }
            Err(sqlx::Error::Database(db_err))
                if db_err.constraint() == Some("saga_log_client_request_id_key") =>
            {
                let key = saga
                    .client_request_id
                    .clone()
                    .unwrap_or_default();
                let existing = self
                    .find_by_client_request(&key)
                    .await?
                    .ok_or(SagaLogError::NotFound(saga.saga_id))?;
                Err(SagaLogError::DuplicateRequest {
                    client_request_id: key,
                    saga_id: existing.saga_id,
                })
            }
            Err(e) => Err(SagaLogError::Database(e)),
        }
    }

    async fn get(&self, saga_id: SagaId) -> Result<Option<SagaInstance>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM saga_log WHERE saga_id = $1"
        ))
        .bind(saga_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_saga).transpose()
    }

    async fn find_by_client_request(
        &self,
        client_request_id: &str,
    ) -> Result<Option<SagaInstance>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM saga_log WHERE client_request_id = $1"
        ))
        .bind(client_request_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_saga).transpose()
    }

    async fn save(&self, saga: &SagaInstance, owner: &str) -> Result<()> {
        let step_results = serde_json::to_value(&saga.step_results)?;

        let result = sqlx::query(
            r#"
            UPDATE saga_log
            SET status = $3, current_step_index = $4, step_results = $5,
                owner_id = $6, lease_expiry = $7, updated_at = $8,
                failure_reason = $9
            WHERE saga_id = $1 AND owner_id = $2
            "#,
        )
        .bind(saga.saga_id.as_uuid())
        .bind(owner)
        .bind(saga.status.as_str())
        .bind(saga.current_step_index as i64)
        .bind(&step_results)
        .bind(&saga.owner_id)
        .bind(saga.lease_expiry)
        .bind(saga.updated_at)
        .bind(&saga.failure_reason)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let held_by = self.held_by(saga.saga_id).await?;
            return Err(SagaLogError::LeaseLost {
                saga_id: saga.saga_id,
                held_by,
            });
        }
        Ok(())
    }

    async fn renew_lease(&self, saga_id: SagaId, owner: &str, ttl: Duration) -> Result<()> {
        let expiry = lease_expiry(ttl);

        let result = sqlx::query(
            "UPDATE saga_log SET lease_expiry = $3, updated_at = $4 \
             WHERE saga_id = $1 AND owner_id = $2",
        )
        .bind(saga_id.as_uuid())
        .bind(owner)
        .bind(expiry)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let held_by = self.held_by(saga_id).await?;
            return Err(SagaLogError::LeaseLost { saga_id, held_by });
        }
        Ok(())
    }

    async fn claim(&self, saga_id: SagaId, owner: &str, ttl: Duration) -> Result<SagaInstance> {
        let expiry = lease_expiry(ttl);

        let row = sqlx::query(&format!(
            r#"
            UPDATE saga_log
            SET owner_id = $2, lease_expiry = $3, updated_at = $4
            WHERE saga_id = $1
              AND (owner_id IS NULL OR owner_id = $2
                   OR lease_expiry IS NULL OR lease_expiry <= $4)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(saga_id.as_uuid())
        .bind(owner)
        .bind(expiry)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_saga(row),
            None => {
                let held_by = self.held_by(saga_id).await?;
                Err(SagaLogError::LeaseHeld { saga_id, held_by })
            }
        }
    }

    async fn release(&self, saga_id: SagaId, owner: &str) -> Result<()> {
        sqlx::query(
            "UPDATE saga_log SET owner_id = NULL, lease_expiry = NULL, updated_at = $3 \
             WHERE saga_id = $1 AND owner_id = $2",
        )
        .bind(saga_id.as_uuid())
        .bind(owner)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn scan_non_terminal(&self) -> Result<Vec<SagaInstance>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS} FROM saga_log
            WHERE status NOT IN ('COMPLETED', 'COMPENSATED', 'COMPENSATION_FAILED', 'ABORTED')
            ORDER BY created_at ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_saga).collect()
    }
}

fn lease_expiry(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30))
}
