//! Postgres-backed operation store
//!
//! The full record is kept as JSON next to a few indexed columns used by
//! the scheduler. Every transition is mirrored into an append-only
//! history table.

use super::{check_append_only, OperationStore};
use crate::error::OrchestrationError;
use crate::models::{HistoryEntry, OperationKind, ToolOperation};
use crate::Result;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use uuid::Uuid;

pub struct PostgresOperationStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PostgresOperationStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)
            .map_err(|e| {
                OrchestrationError::DatabaseError(format!("Failed to configure pool: {}", e))
            })?;
        info!("Operation store backend: postgres");
        Ok(Self::new(pool))
    }

    async fn ensure_schema(&self) -> Result<()> {
        let pool = &self.pool;
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS tool_operations (
                      id UUID PRIMARY KEY,
                      session_id TEXT NOT NULL,
                      kind TEXT NOT NULL,
                      top_state TEXT NOT NULL,
                      sub_state TEXT,
                      next_eval_at TIMESTAMPTZ,
                      spawned_from UUID,
                      version BIGINT NOT NULL,
                      record TEXT NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL,
                      updated_at TIMESTAMPTZ NOT NULL
                    );
                    "#,
                )
                .execute(pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_tool_operations_due
                    ON tool_operations (next_eval_at)
                    WHERE next_eval_at IS NOT NULL;
                    "#,
                )
                .execute(pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_tool_operations_session
                    ON tool_operations (session_id, top_state, created_at);
                    "#,
                )
                .execute(pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE UNIQUE INDEX IF NOT EXISTS idx_tool_operations_spawned_from
                    ON tool_operations (spawned_from)
                    WHERE spawned_from IS NOT NULL;
                    "#,
                )
                .execute(pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS tool_operation_history (
                      operation_id UUID NOT NULL REFERENCES tool_operations (id),
                      seq BIGINT NOT NULL,
                      at TIMESTAMPTZ NOT NULL,
                      from_state TEXT NOT NULL,
                      to_state TEXT NOT NULL,
                      cause TEXT NOT NULL,
                      PRIMARY KEY (operation_id, seq)
                    );
                    "#,
                )
                .execute(pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                OrchestrationError::DatabaseError(format!(
                    "Failed to initialize operation schema: {}",
                    e
                ))
            })?;

        Ok(())
    }

    async fn append_history(
        tx: &mut Transaction<'_, Postgres>,
        operation_id: Uuid,
        entries: &[HistoryEntry],
    ) -> Result<()> {
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO tool_operation_history
                  (operation_id, seq, at, from_state, to_state, cause)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(operation_id)
            .bind(entry.seq as i64)
            .bind(entry.at)
            .bind(entry.from.to_string())
            .bind(entry.to.to_string())
            .bind(serde_json::to_string(&entry.cause)?)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    fn decode(row: &sqlx::postgres::PgRow) -> Result<ToolOperation> {
        let record: String = row.try_get("record")?;
        let mut op: ToolOperation = serde_json::from_str(&record)?;
        let version: i64 = row.try_get("version")?;
        op.version = version as u64;
        Ok(op)
    }

    fn decode_all(rows: &[sqlx::postgres::PgRow]) -> Result<Vec<ToolOperation>> {
        rows.iter().map(Self::decode).collect()
    }
}

fn sub_state_column(op: &ToolOperation) -> Option<&'static str> {
    op.state.sub_state().map(|s| s.as_str())
}

#[async_trait::async_trait]
impl OperationStore for PostgresOperationStore {
    async fn insert(&self, op: &ToolOperation) -> Result<()> {
        self.ensure_schema().await?;

        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO tool_operations
              (id, session_id, kind, top_state, sub_state, next_eval_at, spawned_from,
               version, record, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(op.id)
        .bind(&op.session_id)
        .bind(op.kind.as_str())
        .bind(op.state.top_state().as_str())
        .bind(sub_state_column(op))
        .bind(op.next_due_at())
        .bind(op.spawned_from)
        .bind(op.version as i64)
        .bind(serde_json::to_string(op)?)
        .bind(op.created_at)
        .bind(op.updated_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                drop(tx);
                let existing = match op.spawned_from {
                    Some(parent) => self.find_spawned_from(parent).await?.map(|o| o.id),
                    None => None,
                };
                return Err(OrchestrationError::DuplicateOperation(
                    existing.unwrap_or(op.id),
                ));
            }
            Err(e) => return Err(e.into()),
        }

        Self::append_history(&mut tx, op.id, &op.history).await?;
        tx.commit().await?;

        debug!(operation_id = %op.id, kind = %op.kind, "Operation inserted");
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<ToolOperation>> {
        self.ensure_schema().await?;

        let row = sqlx::query("SELECT record, version FROM tool_operations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn save(&self, op: &ToolOperation, expected_version: u64) -> Result<ToolOperation> {
        self.ensure_schema().await?;

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT record, version FROM tool_operations WHERE id = $1 FOR UPDATE")
            .bind(op.id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(OrchestrationError::OperationNotFound(op.id))?;
        let stored = Self::decode(&row)?;

        if stored.version != expected_version {
            return Err(OrchestrationError::VersionConflict {
                id: op.id,
                expected: expected_version,
            });
        }
        check_append_only(&stored, op)?;

        let mut next = op.clone();
        next.version = expected_version + 1;

        let updated = sqlx::query(
            r#"
            UPDATE tool_operations
            SET top_state = $3, sub_state = $4, next_eval_at = $5, version = $6,
                record = $7, updated_at = $8
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(next.id)
        .bind(expected_version as i64)
        .bind(next.state.top_state().as_str())
        .bind(sub_state_column(&next))
        .bind(next.next_due_at())
        .bind(next.version as i64)
        .bind(serde_json::to_string(&next)?)
        .bind(next.updated_at)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(OrchestrationError::VersionConflict {
                id: op.id,
                expected: expected_version,
            });
        }

        Self::append_history(&mut tx, next.id, &next.history[stored.history.len()..]).await?;
        tx.commit().await?;

        Ok(next)
    }

    async fn find_active_for_session(&self, session_id: &str) -> Result<Option<ToolOperation>> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            SELECT record, version FROM tool_operations
            WHERE session_id = $1 AND top_state IN ('COLLECTING', 'AWAITING_APPROVAL')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn list_for_session(&self, session_id: &str) -> Result<Vec<ToolOperation>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            "SELECT record, version FROM tool_operations WHERE session_id = $1 ORDER BY created_at",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Self::decode_all(&rows)
    }

    async fn due_for_evaluation(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ToolOperation>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            r#"
            SELECT record, version FROM tool_operations
            WHERE next_eval_at IS NOT NULL AND next_eval_at <= $1
            ORDER BY next_eval_at, id
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Self::decode_all(&rows)
    }

    async fn find_spawned_from(&self, parent: Uuid) -> Result<Option<ToolOperation>> {
        self.ensure_schema().await?;

        let row = sqlx::query("SELECT record, version FROM tool_operations WHERE spawned_from = $1")
            .bind(parent)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn pending_recurrences(&self, limit: usize) -> Result<Vec<ToolOperation>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            r#"
            SELECT t.record, t.version FROM tool_operations t
            WHERE t.kind = $1 AND t.top_state = 'COMPLETED'
              AND COALESCE((t.record::jsonb -> 'parameters' ->> 'remaining_repetitions')::BIGINT, 0) > 0
              AND NOT EXISTS (SELECT 1 FROM tool_operations c WHERE c.spawned_from = t.id)
            ORDER BY t.updated_at, t.id
            LIMIT $2
            "#,
        )
        .bind(OperationKind::RecurringSwap.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Self::decode_all(&rows)
    }
}
