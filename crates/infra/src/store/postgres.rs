//! Postgres-backed chunk store.
//!
//! Every status change is a single conditional statement
//! (`UPDATE ... WHERE id = $n AND status = $m`), so two actors racing on the same
//! chunk are serialized by the row lock and the loser observes zero affected rows.
//! Multi-statement changes (`apply_atomically`) run in one transaction.
//! Per-step sequence numbers come from a counter row in `batch_step_sequences`;
//! its row lock serializes concurrent inserts into the same step.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | ChunkStoreError |
//! |------------|----------------------|-----------------|
//! | Io / Tls / PoolTimedOut / PoolClosed / WorkerCrashed | N/A | `Unavailable` |
//! | Database (connection exception / admin shutdown) | `08xxx`, `57P01` | `Unavailable` |
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (foreign key violation) | `23503` | `NotFound` |
//! | Database (other) / decode errors | Any other | `Storage` |
//!
//! ## Thread Safety
//!
//! `PostgresChunkStore` is `Send + Sync`. The synchronous `ChunkStore` impl drives
//! the async methods on the runtime handle given at construction, so it must be
//! called from threads that are **not** themselves runtime workers (the worker
//! and maintenance threads in this crate are plain OS threads).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{FromRow, PgConnection, PgPool, Postgres, Row};
use tokio::runtime::Handle;
use tracing::{debug, instrument};

use batchflow_core::{
    ChunkId, JobDefinitionId, JobInstance, JobInstanceId, JobInstanceStatus, NewWorkChunk,
    StepId, WorkChunk, WorkChunkStatus,
};

use super::r#trait::{
    ChunkChanges, ChunkFilter, ChunkQuery, ChunkStats, ChunkStore, ChunkStoreError,
    InstanceUpdate, StoreOp,
};

/// Tables and indexes used by [`PostgresChunkStore`].
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS batch_job_instances (
    id                      UUID PRIMARY KEY,
    job_definition_id       TEXT NOT NULL,
    job_definition_version  INTEGER NOT NULL,
    status                  TEXT NOT NULL,
    current_gated_step_id   TEXT,
    parameters              JSONB NOT NULL,
    created_at              TIMESTAMPTZ NOT NULL,
    start_time              TIMESTAMPTZ,
    end_time                TIMESTAMPTZ,
    error_message           TEXT
);

CREATE TABLE IF NOT EXISTS batch_work_chunks (
    id                  UUID PRIMARY KEY,
    job_instance_id     UUID NOT NULL REFERENCES batch_job_instances (id),
    job_definition_id   TEXT NOT NULL,
    step_id             TEXT NOT NULL,
    sequence            INTEGER NOT NULL,
    status              TEXT NOT NULL,
    data                JSONB,
    created_at          TIMESTAMPTZ NOT NULL,
    updated_at          TIMESTAMPTZ NOT NULL,
    start_time          TIMESTAMPTZ,
    end_time            TIMESTAMPTZ,
    next_poll_time      TIMESTAMPTZ,
    poll_attempts       INTEGER NOT NULL DEFAULT 0,
    error_count         INTEGER NOT NULL DEFAULT 0,
    error_message       TEXT,
    records_processed   BIGINT,
    CONSTRAINT batch_work_chunks_poll_time_only_while_waiting
        CHECK ((status = 'POLL_WAITING') = (next_poll_time IS NOT NULL)),
    CONSTRAINT batch_work_chunks_step_sequence UNIQUE (job_instance_id, step_id, sequence)
);

CREATE TABLE IF NOT EXISTS batch_step_sequences (
    job_instance_id     UUID NOT NULL REFERENCES batch_job_instances (id),
    step_id             TEXT NOT NULL,
    next_sequence       INTEGER NOT NULL,
    PRIMARY KEY (job_instance_id, step_id)
);

CREATE INDEX IF NOT EXISTS idx_batch_work_chunks_instance_status
    ON batch_work_chunks (job_instance_id, status);
CREATE INDEX IF NOT EXISTS idx_batch_job_instances_status
    ON batch_job_instances (status);
"#;

const CHUNK_COLUMNS: &str = "id, job_instance_id, job_definition_id, step_id, sequence, status, data, \
     created_at, updated_at, start_time, end_time, next_poll_time, poll_attempts, error_count, \
     error_message, records_processed";

const INSTANCE_COLUMNS: &str = "id, job_definition_id, job_definition_version, status, \
     current_gated_step_id, parameters, created_at, start_time, end_time, error_message";

/// SET clause shared by single and bulk chunk updates ($1..$9).
const CHUNK_SET_CLAUSE: &str = "status = $1, \
     updated_at = $2, \
     next_poll_time = $3, \
     poll_attempts = poll_attempts + $4, \
     error_count = error_count + $5, \
     error_message = COALESCE($6, error_message), \
     start_time = COALESCE($7::timestamptz, start_time), \
     end_time = COALESCE($8::timestamptz, end_time), \
     records_processed = COALESCE($9, records_processed)";

/// Postgres-backed chunk store.
#[derive(Debug, Clone)]
pub struct PostgresChunkStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresChunkStore {
    /// Create a store over `pool`; sync trait calls run on `runtime`.
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Create the tables if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), ChunkStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    #[instrument(skip(self, instance), fields(job_instance_id = %instance.id), err)]
    pub async fn insert_instance_async(&self, instance: JobInstance) -> Result<(), ChunkStoreError> {
        sqlx::query(
            r#"
            INSERT INTO batch_job_instances (
                id, job_definition_id, job_definition_version, status, current_gated_step_id,
                parameters, created_at, start_time, end_time, error_message
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(instance.id.as_uuid())
        .bind(instance.job_definition_id.as_str())
        .bind(instance.job_definition_version as i32)
        .bind(instance.status.as_str())
        .bind(instance.current_gated_step_id.as_ref().map(|s| s.as_str()))
        .bind(&instance.parameters)
        .bind(instance.created_at)
        .bind(instance.start_time)
        .bind(instance.end_time)
        .bind(instance.error_message.as_deref())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_instance", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_instance_id = %id), err)]
    pub async fn get_instance_async(
        &self,
        id: JobInstanceId,
    ) -> Result<Option<JobInstance>, ChunkStoreError> {
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM batch_job_instances WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_instance", e))?;

        row.map(|r| decode_instance(&r)).transpose()
    }

    #[instrument(skip(self, update), fields(job_instance_id = %id), err)]
    pub async fn update_instance_async(
        &self,
        id: JobInstanceId,
        update: &InstanceUpdate,
    ) -> Result<u64, ChunkStoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        update_instance_on(&mut *conn, id, update).await
    }

    #[instrument(skip(self), err)]
    pub async fn list_active_instances_async(&self) -> Result<Vec<JobInstance>, ChunkStoreError> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM batch_job_instances \
             WHERE status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED') \
             ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_active_instances", e))?;

        rows.iter().map(decode_instance).collect()
    }

    #[instrument(
        skip(self, chunk),
        fields(chunk_id = %chunk.id, job_instance_id = %chunk.job_instance_id, step_id = %chunk.step_id),
        err
    )]
    pub async fn insert_chunk_async(&self, chunk: NewWorkChunk) -> Result<WorkChunk, ChunkStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(
            r#"
            INSERT INTO batch_step_sequences (job_instance_id, step_id, next_sequence)
            VALUES ($1, $2, 1)
            ON CONFLICT (job_instance_id, step_id)
            DO UPDATE SET next_sequence = batch_step_sequences.next_sequence + 1
            RETURNING next_sequence - 1 AS sequence
            "#,
        )
        .bind(chunk.job_instance_id.as_uuid())
        .bind(chunk.step_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("next_sequence", e))?;
        let sequence: i32 = row
            .try_get("sequence")
            .map_err(|e| ChunkStoreError::Storage(format!("failed to read sequence: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO batch_work_chunks (
                id, job_instance_id, job_definition_id, step_id, sequence, status, data,
                created_at, updated_at, poll_attempts, error_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8, 0, 0)
            "#,
        )
        .bind(chunk.id.as_uuid())
        .bind(chunk.job_instance_id.as_uuid())
        .bind(chunk.job_definition_id.as_str())
        .bind(chunk.step_id.as_str())
        .bind(sequence)
        .bind(chunk.status.as_str())
        .bind(&chunk.data)
        .bind(chunk.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_chunk", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(WorkChunk::from_new(chunk, sequence as u32))
    }

    #[instrument(skip(self), fields(chunk_id = %id), err)]
    pub async fn get_chunk_async(&self, id: ChunkId) -> Result<Option<WorkChunk>, ChunkStoreError> {
        let sql = format!("SELECT {CHUNK_COLUMNS} FROM batch_work_chunks WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_chunk", e))?;

        row.map(|r| decode_chunk(&r)).transpose()
    }

    #[instrument(
        skip(self, changes),
        fields(chunk_id = %id, from = %expected_from, to = %to),
        err
    )]
    pub async fn conditional_update_status_async(
        &self,
        id: ChunkId,
        expected_from: WorkChunkStatus,
        to: WorkChunkStatus,
        changes: &ChunkChanges,
    ) -> Result<u64, ChunkStoreError> {
        let sql = format!(
            "UPDATE batch_work_chunks SET {CHUNK_SET_CLAUSE} WHERE id = $10 AND status = $11"
        );
        let result = bind_changes(sqlx::query(&sql), to, changes)
            .bind(id.as_uuid())
            .bind(expected_from.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("conditional_update_status", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(
        skip(self, changes),
        fields(chunk_id = %id, from = %expected_from, to = %to),
        err
    )]
    pub async fn claim_chunk_async(
        &self,
        id: ChunkId,
        expected_from: WorkChunkStatus,
        to: WorkChunkStatus,
        changes: &ChunkChanges,
    ) -> Result<Option<WorkChunk>, ChunkStoreError> {
        let sql = format!(
            "UPDATE batch_work_chunks SET {CHUNK_SET_CLAUSE} WHERE id = $10 AND status = $11 \
             RETURNING {CHUNK_COLUMNS}"
        );
        let row = bind_changes(sqlx::query(&sql), to, changes)
            .bind(id.as_uuid())
            .bind(expected_from.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_chunk", e))?;

        row.map(|r| decode_chunk(&r)).transpose()
    }

    #[instrument(
        skip(self, filter, changes),
        fields(job_instance_id = %filter.job_instance_id, from = %filter.from, to = %to),
        err
    )]
    pub async fn transition_chunks_async(
        &self,
        filter: &ChunkFilter,
        to: WorkChunkStatus,
        changes: &ChunkChanges,
    ) -> Result<u64, ChunkStoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        transition_chunks_on(&mut *conn, filter, to, changes).await
    }

    #[instrument(skip(self, query), fields(job_instance_id = %query.job_instance_id), err)]
    pub async fn query_chunks_async(&self, query: &ChunkQuery) -> Result<Vec<WorkChunk>, ChunkStoreError> {
        let sql = format!(
            "SELECT {CHUNK_COLUMNS} FROM batch_work_chunks \
             WHERE job_instance_id = $1 \
               AND ($2::text IS NULL OR step_id = $2) \
               AND ($3::text IS NULL OR status = $3) \
             ORDER BY created_at ASC, sequence ASC, id ASC \
             LIMIT $4"
        );
        let rows = sqlx::query(&sql)
            .bind(query.job_instance_id.as_uuid())
            .bind(query.step_id.as_ref().map(|s| s.as_str()))
            .bind(query.status.map(|s| s.as_str()))
            .bind(query.limit.map(|l| l as i64))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("query_chunks", e))?;

        rows.iter().map(decode_chunk).collect()
    }

    #[instrument(skip(self), fields(job_instance_id = %job_instance_id), err)]
    pub async fn chunk_counts_async(
        &self,
        job_instance_id: JobInstanceId,
    ) -> Result<ChunkStats, ChunkStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS total
            FROM batch_work_chunks
            WHERE job_instance_id = $1
            GROUP BY status
            "#,
        )
        .bind(job_instance_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("chunk_counts", e))?;

        let mut stats = ChunkStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| ChunkStoreError::Storage(format!("failed to read status: {e}")))?;
            let total: i64 = row
                .try_get("total")
                .map_err(|e| ChunkStoreError::Storage(format!("failed to read count: {e}")))?;
            let status = parse_chunk_status(&status)?;
            stats.add(status, total as usize);
        }
        Ok(stats)
    }

    #[instrument(skip(self, ops), fields(op_count = ops.len()), err)]
    pub async fn apply_atomically_async(&self, ops: &[StoreOp]) -> Result<Vec<u64>, ChunkStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut counts = Vec::with_capacity(ops.len());
        for op in ops {
            let affected = match op {
                StoreOp::UpdateInstance { id, update } => {
                    update_instance_on(&mut *tx, *id, update).await?
                }
                StoreOp::TransitionChunks {
                    filter,
                    to,
                    changes,
                } => transition_chunks_on(&mut *tx, filter, *to, changes).await?,
            };
            counts.push(affected);
            if affected == 0 && matches!(op, StoreOp::UpdateInstance { .. }) {
                debug!("guarded instance update matched no row; batch ends");
                break;
            }
        }
        counts.resize(ops.len(), 0);

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(counts)
    }
}

async fn update_instance_on(
    conn: &mut PgConnection,
    id: JobInstanceId,
    update: &InstanceUpdate,
) -> Result<u64, ChunkStoreError> {
    let expected: Vec<String> = update
        .expected_status
        .iter()
        .map(|s| s.as_str().to_string())
        .collect();
    let gates: Vec<String> = update
        .expected_gated_step
        .iter()
        .map(|s| s.as_str().to_string())
        .collect();
    let c = &update.changes;

    let result = sqlx::query(
        r#"
        UPDATE batch_job_instances SET
            status = COALESCE($2, status),
            current_gated_step_id = COALESCE($3, current_gated_step_id),
            start_time = COALESCE($4::timestamptz, start_time),
            end_time = COALESCE($5::timestamptz, end_time),
            error_message = COALESCE($6, error_message)
        WHERE id = $1
          AND (cardinality($7::text[]) = 0 OR status = ANY($7))
          AND (cardinality($8::text[]) = 0 OR current_gated_step_id = ANY($8))
        "#,
    )
    .bind(id.as_uuid())
    .bind(c.status.map(|s| s.as_str()))
    .bind(c.current_gated_step_id.as_ref().map(|s| s.as_str()))
    .bind(c.start_time)
    .bind(c.end_time)
    .bind(c.error_message.as_deref())
    .bind(expected)
    .bind(gates)
    .execute(conn)
    .await
    .map_err(|e| map_sqlx_error("update_instance", e))?;

    Ok(result.rows_affected())
}

async fn transition_chunks_on(
    conn: &mut PgConnection,
    filter: &ChunkFilter,
    to: WorkChunkStatus,
    changes: &ChunkChanges,
) -> Result<u64, ChunkStoreError> {
    let sql = format!(
        "UPDATE batch_work_chunks SET {CHUNK_SET_CLAUSE} \
         WHERE job_instance_id = $10 \
           AND status = $11 \
           AND ($12::text IS NULL OR step_id = $12) \
           AND ($13::timestamptz IS NULL OR next_poll_time <= $13)"
    );
    let result = bind_changes(sqlx::query(&sql), to, changes)
        .bind(filter.job_instance_id.as_uuid())
        .bind(filter.from.as_str())
        .bind(filter.step_id.as_ref().map(|s| s.as_str()))
        .bind(filter.poll_due_by)
        .execute(conn)
        .await
        .map_err(|e| map_sqlx_error("transition_chunks", e))?;

    Ok(result.rows_affected())
}

/// Bind `$1..$9` of [`CHUNK_SET_CLAUSE`].
fn bind_changes<'q>(
    query: Query<'q, Postgres, PgArguments>,
    to: WorkChunkStatus,
    changes: &'q ChunkChanges,
) -> Query<'q, Postgres, PgArguments> {
    query
        .bind(to.as_str())
        .bind(changes.updated_at)
        .bind(changes.next_poll_time)
        .bind(i32::from(changes.increment_poll_attempts))
        .bind(i32::from(changes.increment_error_count))
        .bind(changes.error_message.as_deref())
        .bind(changes.start_time)
        .bind(changes.end_time)
        .bind(changes.records_processed.map(|r| r as i64))
}

/// Map SQLx errors to ChunkStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> ChunkStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => ChunkStoreError::AlreadyExists(msg),
                Some("23503") => ChunkStoreError::NotFound(msg),
                Some(code) if code.starts_with("08") || code == "57P01" => {
                    ChunkStoreError::Unavailable(msg)
                }
                _ => ChunkStoreError::Storage(msg),
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ChunkStoreError::Unavailable(format!(
            "database unreachable in {}: {}",
            operation, err
        )),
        _ => ChunkStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn parse_chunk_status(value: &str) -> Result<WorkChunkStatus, ChunkStoreError> {
    value
        .parse()
        .map_err(|e| ChunkStoreError::Storage(format!("corrupt chunk status: {e}")))
}

// SQLx row types

#[derive(Debug)]
struct WorkChunkRow {
    id: uuid::Uuid,
    job_instance_id: uuid::Uuid,
    job_definition_id: String,
    step_id: String,
    sequence: i32,
    status: String,
    data: Option<JsonValue>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    next_poll_time: Option<DateTime<Utc>>,
    poll_attempts: i32,
    error_count: i32,
    error_message: Option<String>,
    records_processed: Option<i64>,
}

impl<'r> FromRow<'r, PgRow> for WorkChunkRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(WorkChunkRow {
            id: row.try_get("id")?,
            job_instance_id: row.try_get("job_instance_id")?,
            job_definition_id: row.try_get("job_definition_id")?,
            step_id: row.try_get("step_id")?,
            sequence: row.try_get("sequence")?,
            status: row.try_get("status")?,
            data: row.try_get("data")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            next_poll_time: row.try_get("next_poll_time")?,
            poll_attempts: row.try_get("poll_attempts")?,
            error_count: row.try_get("error_count")?,
            error_message: row.try_get("error_message")?,
            records_processed: row.try_get("records_processed")?,
        })
    }
}

impl TryFrom<WorkChunkRow> for WorkChunk {
    type Error = ChunkStoreError;

    fn try_from(row: WorkChunkRow) -> Result<Self, Self::Error> {
        Ok(WorkChunk {
            id: ChunkId::from_uuid(row.id),
            job_instance_id: JobInstanceId::from_uuid(row.job_instance_id),
            job_definition_id: JobDefinitionId::from(row.job_definition_id),
            step_id: StepId::from(row.step_id),
            sequence: row.sequence as u32,
            status: parse_chunk_status(&row.status)?,
            data: row.data,
            created_at: row.created_at,
            updated_at: row.updated_at,
            start_time: row.start_time,
            end_time: row.end_time,
            next_poll_time: row.next_poll_time,
            poll_attempts: row.poll_attempts as u32,
            error_count: row.error_count as u32,
            error_message: row.error_message,
            records_processed: row.records_processed.map(|r| r as u64),
        })
    }
}

fn decode_chunk(row: &PgRow) -> Result<WorkChunk, ChunkStoreError> {
    WorkChunkRow::from_row(row)
        .map_err(|e| ChunkStoreError::Storage(format!("failed to deserialize chunk row: {e}")))?
        .try_into()
}

#[derive(Debug)]
struct JobInstanceRow {
    id: uuid::Uuid,
    job_definition_id: String,
    job_definition_version: i32,
    status: String,
    current_gated_step_id: Option<String>,
    parameters: JsonValue,
    created_at: DateTime<Utc>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

impl<'r> FromRow<'r, PgRow> for JobInstanceRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobInstanceRow {
            id: row.try_get("id")?,
            job_definition_id: row.try_get("job_definition_id")?,
            job_definition_version: row.try_get("job_definition_version")?,
            status: row.try_get("status")?,
            current_gated_step_id: row.try_get("current_gated_step_id")?,
            parameters: row.try_get("parameters")?,
            created_at: row.try_get("created_at")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            error_message: row.try_get("error_message")?,
        })
    }
}

impl TryFrom<JobInstanceRow> for JobInstance {
    type Error = ChunkStoreError;

    fn try_from(row: JobInstanceRow) -> Result<Self, Self::Error> {
        let status: JobInstanceStatus = row
            .status
            .parse()
            .map_err(|e| ChunkStoreError::Storage(format!("corrupt instance status: {e}")))?;
        Ok(JobInstance {
            id: JobInstanceId::from_uuid(row.id),
            job_definition_id: JobDefinitionId::from(row.job_definition_id),
            job_definition_version: row.job_definition_version as u32,
            status,
            current_gated_step_id: row.current_gated_step_id.map(StepId::from),
            parameters: row.parameters,
            created_at: row.created_at,
            start_time: row.start_time,
            end_time: row.end_time,
            error_message: row.error_message,
        })
    }
}

fn decode_instance(row: &PgRow) -> Result<JobInstance, ChunkStoreError> {
    JobInstanceRow::from_row(row)
        .map_err(|e| ChunkStoreError::Storage(format!("failed to deserialize instance row: {e}")))?
        .try_into()
}

// Implement ChunkStore trait

impl ChunkStore for PostgresChunkStore {
    fn insert_instance(&self, instance: JobInstance) -> Result<(), ChunkStoreError> {
        self.runtime.block_on(self.insert_instance_async(instance))
    }

    fn get_instance(&self, id: JobInstanceId) -> Result<Option<JobInstance>, ChunkStoreError> {
        self.runtime.block_on(self.get_instance_async(id))
    }

    fn update_instance(
        &self,
        id: JobInstanceId,
        update: &InstanceUpdate,
    ) -> Result<u64, ChunkStoreError> {
        self.runtime.block_on(self.update_instance_async(id, update))
    }

    fn list_active_instances(&self) -> Result<Vec<JobInstance>, ChunkStoreError> {
        self.runtime.block_on(self.list_active_instances_async())
    }

    fn insert_chunk(&self, chunk: NewWorkChunk) -> Result<WorkChunk, ChunkStoreError> {
        self.runtime.block_on(self.insert_chunk_async(chunk))
    }

    fn get_chunk(&self, id: ChunkId) -> Result<Option<WorkChunk>, ChunkStoreError> {
        self.runtime.block_on(self.get_chunk_async(id))
    }

    fn conditional_update_status(
        &self,
        id: ChunkId,
        expected_from: WorkChunkStatus,
        to: WorkChunkStatus,
        changes: &ChunkChanges,
    ) -> Result<u64, ChunkStoreError> {
        self.runtime
            .block_on(self.conditional_update_status_async(id, expected_from, to, changes))
    }

    fn claim_chunk(
        &self,
        id: ChunkId,
        expected_from: WorkChunkStatus,
        to: WorkChunkStatus,
        changes: &ChunkChanges,
    ) -> Result<Option<WorkChunk>, ChunkStoreError> {
        self.runtime
            .block_on(self.claim_chunk_async(id, expected_from, to, changes))
    }

    fn transition_chunks(
        &self,
        filter: &ChunkFilter,
        to: WorkChunkStatus,
        changes: &ChunkChanges,
    ) -> Result<u64, ChunkStoreError> {
        self.runtime
            .block_on(self.transition_chunks_async(filter, to, changes))
    }

    fn query_chunks(&self, query: &ChunkQuery) -> Result<Vec<WorkChunk>, ChunkStoreError> {
        self.runtime.block_on(self.query_chunks_async(query))
    }

    fn chunk_counts(&self, job_instance_id: JobInstanceId) -> Result<ChunkStats, ChunkStoreError> {
        self.runtime.block_on(self.chunk_counts_async(job_instance_id))
    }

    fn apply_atomically(&self, ops: &[StoreOp]) -> Result<Vec<u64>, ChunkStoreError> {
        self.runtime.block_on(self.apply_atomically_async(ops))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_failures_map_to_unavailable() {
        assert!(matches!(
            map_sqlx_error("get_chunk", sqlx::Error::PoolTimedOut),
            ChunkStoreError::Unavailable(_)
        ));
        assert!(matches!(
            map_sqlx_error("get_chunk", sqlx::Error::PoolClosed),
            ChunkStoreError::Unavailable(_)
        ));
    }

    #[test]
    fn other_failures_map_to_storage() {
        assert!(matches!(
            map_sqlx_error("get_chunk", sqlx::Error::RowNotFound),
            ChunkStoreError::Storage(_)
        ));
    }

    #[test]
    fn schema_enforces_poll_time_invariant() {
        assert!(SCHEMA.contains("(status = 'POLL_WAITING') = (next_poll_time IS NOT NULL)"));
    }

    #[test]
    fn schema_keeps_one_sequence_counter_per_step() {
        assert!(SCHEMA.contains("CREATE TABLE IF NOT EXISTS batch_step_sequences"));
        assert!(SCHEMA.contains("PRIMARY KEY (job_instance_id, step_id)"));
    }
}
