//! Postgres-backed command store.
//!
//! All coordination predicates are expressed as conditional `UPDATE`
//! statements so that row-level locking in Postgres is the only mutual
//! exclusion the system relies on. A lost race is observed as a zero-row
//! update, never as an error.
//!
//! ## Error mapping
//!
//! | SQLx error | Postgres code | StoreError | Scenario |
//! |------------|---------------|------------|----------|
//! | Database (unique violation) | `23505` | `AlreadyExists` | Duplicate command id on insert |
//! | Database (other) | any other | `Storage` | Constraint or server failure |
//! | PoolClosed / Io / other | n/a | `Storage` | Transient connectivity; the poll loop retries next tick |

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::types::PgInterval;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use anvil_core::{Clock, Command, CommandId};

use super::r#trait::{CommandStore, FailTransition, QueueStats, StoreError};

/// Postgres implementation of [`CommandStore`].
///
/// Cheap to clone; the pool handles connection management. The table name is
/// `<prefix>commands` and is rendered into the statements once at
/// construction, since identifiers cannot be bound as parameters.
#[derive(Clone)]
pub struct PostgresCommandStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    table: String,
}

impl PostgresCommandStore {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>, table_prefix: &str) -> Self {
        Self {
            pool,
            clock,
            table: format!("{}commands", table_prefix),
        }
    }

    /// Create the commands table and its indexes if they do not exist.
    ///
    /// Migration tooling is the embedding application's concern; this is a
    /// bootstrap convenience for tests and small deployments.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let t = &self.table;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {t} (
                id             UUID PRIMARY KEY,
                target         TEXT NOT NULL,
                name           TEXT NOT NULL,
                input          TEXT NULL,
                output         TEXT NULL,
                scheduled_at   TIMESTAMPTZ NOT NULL,
                timeout        INTERVAL NOT NULL,
                retries_left   INTEGER NOT NULL,
                is_running     BOOLEAN NOT NULL DEFAULT FALSE,
                running_at     TIMESTAMPTZ NULL,
                run_expires_at TIMESTAMPTZ NULL,
                is_completed   BOOLEAN NOT NULL DEFAULT FALSE,
                completed_at   TIMESTAMPTZ NULL,
                is_canceled    BOOLEAN NOT NULL DEFAULT FALSE,
                canceled_at    TIMESTAMPTZ NULL,
                is_failed      BOOLEAN NOT NULL DEFAULT FALSE,
                failed_at      TIMESTAMPTZ NULL
            )
            "#
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_table", e))?;

        for column in ["target", "is_running", "is_completed", "is_failed"] {
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {t}_{column}_idx ON {t} ({column})"
            ))
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_index", e))?;
        }

        Ok(())
    }

    async fn insert_row<'c>(
        &self,
        tx: &mut Transaction<'c, Postgres>,
        command: &Command,
    ) -> Result<(), StoreError> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (
                id, target, name, input, output,
                scheduled_at, timeout, retries_left,
                is_running, running_at, run_expires_at,
                is_completed, completed_at,
                is_canceled, canceled_at,
                is_failed, failed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
            self.table
        ))
        .bind(command.id.as_uuid())
        .bind(&command.target)
        .bind(&command.name)
        .bind(&command.input)
        .bind(&command.output)
        .bind(command.scheduled_at)
        .bind(interval_from_duration(command.timeout))
        .bind(command.retries_left)
        .bind(command.is_running)
        .bind(command.running_at)
        .bind(command.run_expires_at)
        .bind(command.is_completed)
        .bind(command.completed_at)
        .bind(command.is_canceled)
        .bind(command.canceled_at)
        .bind(command.is_failed)
        .bind(command.failed_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists(command.id)
            } else {
                map_sqlx_error("insert_command", e)
            }
        })?;

        Ok(())
    }

    async fn insert_successors<'c>(
        &self,
        tx: &mut Transaction<'c, Postgres>,
        successors: &[Command],
    ) -> Result<(), StoreError> {
        for successor in successors {
            self.insert_row(tx, successor).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl CommandStore for PostgresCommandStore {
    #[instrument(skip(self, command), fields(command_id = %command.id, name = %command.name), err)]
    async fn insert(&self, command: &Command) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        self.insert_row(&mut tx, command).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(())
    }

    async fn get(&self, id: CommandId) -> Result<Option<Command>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT * FROM {} WHERE id = $1",
            self.table
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_command", e))?;

        row.map(|r| command_from_row(&r)).transpose()
    }

    #[instrument(skip(self), fields(target = %target), err)]
    async fn acquire(
        &self,
        target: &str,
        lease: Duration,
    ) -> Result<Option<Command>, StoreError> {
        let now = self.clock.now();
        let expires = now + chrono::Duration::from_std(lease).unwrap_or_default();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        // Pick one candidate. FIFO by scheduled_at, then id, so the oldest
        // due work is preferred; no starvation guarantee is promised.
        let candidate: Option<uuid::Uuid> = sqlx::query_scalar(&format!(
            r#"
            SELECT id FROM {}
            WHERE target = $1
              AND scheduled_at <= $2
              AND NOT is_completed AND NOT is_canceled AND NOT is_failed
              AND (NOT is_running OR run_expires_at < $2)
            ORDER BY scheduled_at ASC, id ASC
            LIMIT 1
            "#,
            self.table
        ))
        .bind(target)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("pick_candidate", e))?;

        let Some(candidate) = candidate else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(None);
        };

        // Lease it, re-checking the same freshness predicate by id. Zero
        // rows affected means another worker won the race; the outer poll
        // loop will try again rather than spinning here.
        let updated = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET is_running = TRUE, running_at = $2, run_expires_at = $3
            WHERE id = $1
              AND scheduled_at <= $2
              AND NOT is_completed AND NOT is_canceled AND NOT is_failed
              AND (NOT is_running OR run_expires_at < $2)
            "#,
            self.table
        ))
        .bind(candidate)
        .bind(now)
        .bind(expires)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lease_candidate", e))?;

        if updated.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(None);
        }

        let row = sqlx::query(&format!(
            "SELECT * FROM {} WHERE id = $1",
            self.table
        ))
        .bind(candidate)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reread_leased", e))?;

        let command = command_from_row(&row)?;

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(Some(command))
    }

    async fn extend(&self, id: CommandId, lease: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let expires = now + chrono::Duration::from_std(lease).unwrap_or_default();

        let updated = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET run_expires_at = $3
            WHERE id = $1 AND is_running AND run_expires_at > $2
            "#,
            self.table
        ))
        .bind(id.as_uuid())
        .bind(now)
        .bind(expires)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("extend_lease", e))?;

        Ok(updated.rows_affected() == 1)
    }

    #[instrument(skip(self, output, successors), fields(command_id = %id), err)]
    async fn complete(
        &self,
        id: CommandId,
        output: Option<String>,
        successors: &[Command],
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        let updated = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET is_running = FALSE, run_expires_at = NULL,
                is_completed = TRUE, completed_at = $2, output = $3
            WHERE id = $1 AND is_running AND NOT is_completed
            "#,
            self.table
        ))
        .bind(id.as_uuid())
        .bind(now)
        .bind(&output)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("complete_command", e))?;

        let transitioned = updated.rows_affected() == 1;
        if transitioned {
            self.insert_successors(&mut tx, successors).await?;
        }

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(transitioned)
    }

    #[instrument(skip(self, successors), fields(command_id = %id), err)]
    async fn cancel(&self, id: CommandId, successors: &[Command]) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        let updated = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET is_running = FALSE, run_expires_at = NULL,
                is_canceled = TRUE, canceled_at = $2
            WHERE id = $1 AND is_running AND NOT is_canceled
            "#,
            self.table
        ))
        .bind(id.as_uuid())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("cancel_command", e))?;

        let transitioned = updated.rows_affected() == 1;
        if transitioned {
            self.insert_successors(&mut tx, successors).await?;
        }

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(transitioned)
    }

    #[instrument(skip(self, successors), fields(command_id = %id), err)]
    async fn fail(
        &self,
        id: CommandId,
        successors: &[Command],
    ) -> Result<FailTransition, StoreError> {
        let now = self.clock.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        // Stage 1: release the lease and burn one retry.
        let released = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET is_running = FALSE, run_expires_at = NULL,
                retries_left = retries_left - 1
            WHERE id = $1 AND is_running AND NOT is_completed
            "#,
            self.table
        ))
        .bind(id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("release_for_retry", e))?;

        if released.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(FailTransition::Superseded);
        }

        // Stage 2: terminal iff the decrement exhausted the retries. Keeping
        // the predicate closed-form in SQL avoids a read-then-write in the
        // caller.
        let failed = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET is_failed = TRUE, failed_at = $2
            WHERE id = $1 AND NOT is_failed AND retries_left = -1
            "#,
            self.table
        ))
        .bind(id.as_uuid())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?;

        let transition = if failed.rows_affected() == 1 {
            self.insert_successors(&mut tx, successors).await?;
            FailTransition::Failed
        } else {
            FailTransition::Retrying
        };

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(transition)
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let deleted = sqlx::query(&format!(
            r#"
            DELETE FROM {}
            WHERE (is_completed AND completed_at < $1)
               OR (is_canceled AND canceled_at < $1)
               OR (is_failed AND failed_at < $1)
            "#,
            self.table
        ))
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge_terminal", e))?;

        Ok(deleted.rows_affected())
    }

    async fn stats(&self, target: &str) -> Result<QueueStats, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT
                COUNT(*) FILTER (
                    WHERE NOT is_running AND NOT is_completed
                      AND NOT is_canceled AND NOT is_failed
                ) AS pending,
                COUNT(*) FILTER (WHERE is_running) AS running,
                COUNT(*) FILTER (WHERE is_completed) AS completed,
                COUNT(*) FILTER (WHERE is_canceled) AS canceled,
                COUNT(*) FILTER (WHERE is_failed) AS failed
            FROM {}
            WHERE target = $1
            "#,
            self.table
        ))
        .bind(target)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("queue_stats", e))?;

        let count = |name: &str| -> Result<u64, StoreError> {
            let v: i64 = row
                .try_get(name)
                .map_err(|e| StoreError::Storage(format!("failed to read {}: {}", name, e)))?;
            Ok(v.max(0) as u64)
        };

        Ok(QueueStats {
            pending: count("pending")?,
            running: count("running")?,
            completed: count("completed")?,
            canceled: count("canceled")?,
            failed: count("failed")?,
        })
    }
}

/// Map a database row into a `Command`.
fn command_from_row(row: &sqlx::postgres::PgRow) -> Result<Command, StoreError> {
    let read = |e: sqlx::Error| StoreError::Storage(format!("failed to read command row: {}", e));

    let id: uuid::Uuid = row.try_get("id").map_err(read)?;
    let timeout: PgInterval = row.try_get("timeout").map_err(read)?;

    Ok(Command {
        id: CommandId::from_uuid(id),
        target: row.try_get("target").map_err(read)?,
        name: row.try_get("name").map_err(read)?,
        input: row.try_get("input").map_err(read)?,
        output: row.try_get("output").map_err(read)?,
        scheduled_at: row.try_get("scheduled_at").map_err(read)?,
        timeout: duration_from_interval(&timeout),
        retries_left: row.try_get("retries_left").map_err(read)?,
        is_running: row.try_get("is_running").map_err(read)?,
        running_at: row.try_get("running_at").map_err(read)?,
        run_expires_at: row.try_get("run_expires_at").map_err(read)?,
        is_completed: row.try_get("is_completed").map_err(read)?,
        completed_at: row.try_get("completed_at").map_err(read)?,
        is_canceled: row.try_get("is_canceled").map_err(read)?,
        canceled_at: row.try_get("canceled_at").map_err(read)?,
        is_failed: row.try_get("is_failed").map_err(read)?,
        failed_at: row.try_get("failed_at").map_err(read)?,
    })
}

fn interval_from_duration(duration: Duration) -> PgInterval {
    PgInterval {
        months: 0,
        days: 0,
        microseconds: duration.as_micros().min(i64::MAX as u128) as i64,
    }
}

fn duration_from_interval(interval: &PgInterval) -> Duration {
    // We only ever write plain microseconds; day/month components can still
    // appear if rows were edited by hand, so fold them in conservatively.
    let micros = interval.microseconds.max(0) as u64
        + interval.days.max(0) as u64 * 86_400_000_000
        + interval.months.max(0) as u64 * 2_592_000_000_000;
    Duration::from_micros(micros)
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
