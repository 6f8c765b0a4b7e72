use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use batchflow_core::{
    ChunkId, JobInstance, JobInstanceId, JobInstanceStatus, NewWorkChunk, StepId, WorkChunk,
    WorkChunkStatus,
};

/// Storage adapter error.
///
/// These are **infrastructure errors**; a chunk not being in the expected status
/// is never an error here, it is a zero row count.
#[derive(Debug, Clone, Error)]
pub enum ChunkStoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The durable store cannot be reached. Callers retry on their next pass.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Any other storage failure (corrupt row, constraint violation, ...).
    #[error("storage error: {0}")]
    Storage(String),
}

/// Column values written alongside a chunk status change.
///
/// `next_poll_time` is always written: it is `Some` only when the target status is
/// POLL_WAITING, which keeps "poll time set iff POLL_WAITING" true after every write.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkChanges {
    pub updated_at: DateTime<Utc>,
    pub next_poll_time: Option<DateTime<Utc>>,
    pub increment_poll_attempts: bool,
    pub increment_error_count: bool,
    pub error_message: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub records_processed: Option<u64>,
}

impl ChunkChanges {
    /// Plain status change at `now` (clears any poll deadline).
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            updated_at: now,
            next_poll_time: None,
            increment_poll_attempts: false,
            increment_error_count: false,
            error_message: None,
            start_time: None,
            end_time: None,
            records_processed: None,
        }
    }

    pub fn poll_at(mut self, next_poll_time: DateTime<Utc>) -> Self {
        self.next_poll_time = Some(next_poll_time);
        self.increment_poll_attempts = true;
        self
    }

    pub fn started(mut self) -> Self {
        self.start_time = Some(self.updated_at);
        self
    }

    pub fn finished(mut self) -> Self {
        self.end_time = Some(self.updated_at);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self.increment_error_count = true;
        self
    }

    pub fn with_records_processed(mut self, records: u64) -> Self {
        self.records_processed = Some(records);
        self
    }

    /// Apply these changes to an in-memory chunk (used by non-SQL stores).
    pub fn apply_to(&self, chunk: &mut WorkChunk, to: WorkChunkStatus) {
        chunk.status = to;
        chunk.updated_at = self.updated_at;
        chunk.next_poll_time = self.next_poll_time;
        if self.increment_poll_attempts {
            chunk.poll_attempts += 1;
        }
        if self.increment_error_count {
            chunk.error_count += 1;
        }
        if let Some(message) = &self.error_message {
            chunk.error_message = Some(message.clone());
        }
        if let Some(start) = self.start_time {
            chunk.start_time = Some(start);
        }
        if let Some(end) = self.end_time {
            chunk.end_time = Some(end);
        }
        if let Some(records) = self.records_processed {
            chunk.records_processed = Some(records);
        }
    }
}

/// Read filter for `query_chunks`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkQuery {
    pub job_instance_id: JobInstanceId,
    pub step_id: Option<StepId>,
    pub status: Option<WorkChunkStatus>,
    pub limit: Option<usize>,
}

impl ChunkQuery {
    pub fn for_instance(job_instance_id: JobInstanceId) -> Self {
        Self {
            job_instance_id,
            step_id: None,
            status: None,
            limit: None,
        }
    }

    pub fn step(mut self, step_id: StepId) -> Self {
        self.step_id = Some(step_id);
        self
    }

    pub fn status(mut self, status: WorkChunkStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, chunk: &WorkChunk) -> bool {
        chunk.job_instance_id == self.job_instance_id
            && self.step_id.as_ref().is_none_or(|s| &chunk.step_id == s)
            && self.status.is_none_or(|s| chunk.status == s)
    }
}

/// Guarded selection for bulk status changes. `from` is mandatory: every write
/// is conditional on the persisted status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFilter {
    pub job_instance_id: JobInstanceId,
    pub step_id: Option<StepId>,
    pub from: WorkChunkStatus,
    /// Only POLL_WAITING chunks whose `next_poll_time <= poll_due_by`.
    pub poll_due_by: Option<DateTime<Utc>>,
}

impl ChunkFilter {
    pub fn matches(&self, chunk: &WorkChunk) -> bool {
        chunk.job_instance_id == self.job_instance_id
            && chunk.status == self.from
            && self.step_id.as_ref().is_none_or(|s| &chunk.step_id == s)
            && self.poll_due_by.is_none_or(|due| chunk.poll_due(due))
    }
}

/// Job instance columns to change. `None` leaves a column untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceChanges {
    pub status: Option<JobInstanceStatus>,
    pub current_gated_step_id: Option<StepId>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Conditional job instance update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceUpdate {
    /// Apply only when the persisted status is one of these (empty = any status).
    pub expected_status: Vec<JobInstanceStatus>,
    /// Apply only when the persisted gate is one of these steps (empty = any gate).
    pub expected_gated_step: Vec<StepId>,
    pub changes: InstanceChanges,
}

impl InstanceUpdate {
    pub fn unconditional(changes: InstanceChanges) -> Self {
        Self {
            expected_status: Vec::new(),
            expected_gated_step: Vec::new(),
            changes,
        }
    }

    pub fn when(expected_status: &[JobInstanceStatus], changes: InstanceChanges) -> Self {
        Self {
            expected_status: expected_status.to_vec(),
            expected_gated_step: Vec::new(),
            changes,
        }
    }

    /// Additionally require the gate to sit on one of `steps`.
    pub fn gate_in(mut self, steps: impl IntoIterator<Item = StepId>) -> Self {
        self.expected_gated_step = steps.into_iter().collect();
        self
    }

    pub fn matches(&self, instance: &JobInstance) -> bool {
        let status_ok =
            self.expected_status.is_empty() || self.expected_status.contains(&instance.status);
        let gate_ok = self.expected_gated_step.is_empty()
            || instance
                .current_gated_step_id
                .as_ref()
                .is_some_and(|gate| self.expected_gated_step.contains(gate));
        status_ok && gate_ok
    }

    pub fn apply_to(&self, instance: &mut JobInstance) {
        let c = &self.changes;
        if let Some(status) = c.status {
            instance.status = status;
        }
        if let Some(step) = &c.current_gated_step_id {
            instance.current_gated_step_id = Some(step.clone());
        }
        if let Some(start) = c.start_time {
            instance.start_time = Some(start);
        }
        if let Some(end) = c.end_time {
            instance.end_time = Some(end);
        }
        if let Some(message) = &c.error_message {
            instance.error_message = Some(message.clone());
        }
    }
}

/// One write inside [`ChunkStore::apply_atomically`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    UpdateInstance {
        id: JobInstanceId,
        update: InstanceUpdate,
    },
    TransitionChunks {
        filter: ChunkFilter,
        to: WorkChunkStatus,
        changes: ChunkChanges,
    },
}

/// Per-status chunk tally for one job instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChunkStats {
    pub ready: usize,
    pub gate_waiting: usize,
    pub queued: usize,
    pub in_progress: usize,
    pub poll_waiting: usize,
    pub errored: usize,
    pub failed: usize,
    pub completed: usize,
}

impl ChunkStats {
    pub fn record(&mut self, status: WorkChunkStatus) {
        self.add(status, 1);
    }

    pub fn add(&mut self, status: WorkChunkStatus, count: usize) {
        let slot = match status {
            WorkChunkStatus::Ready => &mut self.ready,
            WorkChunkStatus::GateWaiting => &mut self.gate_waiting,
            WorkChunkStatus::Queued => &mut self.queued,
            WorkChunkStatus::InProgress => &mut self.in_progress,
            WorkChunkStatus::PollWaiting => &mut self.poll_waiting,
            WorkChunkStatus::Errored => &mut self.errored,
            WorkChunkStatus::Failed => &mut self.failed,
            WorkChunkStatus::Completed => &mut self.completed,
        };
        *slot += count;
    }

    pub fn total(&self) -> usize {
        self.ready
            + self.gate_waiting
            + self.queued
            + self.in_progress
            + self.poll_waiting
            + self.errored
            + self.failed
            + self.completed
    }

    /// Whether any chunk has been picked up by a worker.
    pub fn any_started(&self) -> bool {
        self.in_progress + self.poll_waiting + self.errored + self.failed + self.completed > 0
    }

    pub fn all_completed(&self) -> bool {
        self.completed == self.total()
    }
}

/// Durable, transactional record store for job instances and work chunks.
///
/// ## Contract
///
/// - Every status write is **conditional** on the persisted status and reports the
///   number of rows it changed. A mismatch is `Ok(0)`, never an error.
/// - A single call is atomic. `apply_atomically` extends that to a batch of writes
///   that concurrent readers observe all-or-nothing. An `UpdateInstance` op that
///   matches no row ends the batch: the ops after it are not applied and report 0.
/// - Implementations are shared between worker threads/processes (`Send + Sync`);
///   there is no other coordination between actors.
pub trait ChunkStore: Send + Sync {
    fn insert_instance(&self, instance: JobInstance) -> Result<(), ChunkStoreError>;

    fn get_instance(&self, id: JobInstanceId) -> Result<Option<JobInstance>, ChunkStoreError>;

    /// Conditionally update one instance. Returns rows affected (0 or 1).
    fn update_instance(
        &self,
        id: JobInstanceId,
        update: &InstanceUpdate,
    ) -> Result<u64, ChunkStoreError>;

    /// Instances maintenance should visit (not terminal), oldest first.
    fn list_active_instances(&self) -> Result<Vec<JobInstance>, ChunkStoreError>;

    /// Persist a new chunk, assigning its per-step sequence number.
    fn insert_chunk(&self, chunk: NewWorkChunk) -> Result<WorkChunk, ChunkStoreError>;

    fn get_chunk(&self, id: ChunkId) -> Result<Option<WorkChunk>, ChunkStoreError>;

    /// Move one chunk from `expected_from` to `to`. Returns rows affected (0 or 1).
    fn conditional_update_status(
        &self,
        id: ChunkId,
        expected_from: WorkChunkStatus,
        to: WorkChunkStatus,
        changes: &ChunkChanges,
    ) -> Result<u64, ChunkStoreError>;

    /// Like [`conditional_update_status`](Self::conditional_update_status), but
    /// returns the row exactly as this write left it (`None` when nothing moved).
    fn claim_chunk(
        &self,
        id: ChunkId,
        expected_from: WorkChunkStatus,
        to: WorkChunkStatus,
        changes: &ChunkChanges,
    ) -> Result<Option<WorkChunk>, ChunkStoreError>;

    /// Move every chunk matching `filter` to `to` in one atomic write.
    fn transition_chunks(
        &self,
        filter: &ChunkFilter,
        to: WorkChunkStatus,
        changes: &ChunkChanges,
    ) -> Result<u64, ChunkStoreError>;

    /// Chunks matching `query`, ordered by step creation then sequence.
    fn query_chunks(&self, query: &ChunkQuery) -> Result<Vec<WorkChunk>, ChunkStoreError>;

    fn chunk_counts(&self, job_instance_id: JobInstanceId) -> Result<ChunkStats, ChunkStoreError>;

    /// Apply all `ops` in one transaction; returns rows affected per op.
    fn apply_atomically(&self, ops: &[StoreOp]) -> Result<Vec<u64>, ChunkStoreError>;
}

impl<S> ChunkStore for Arc<S>
where
    S: ChunkStore + ?Sized,
{
    fn insert_instance(&self, instance: JobInstance) -> Result<(), ChunkStoreError> {
        (**self).insert_instance(instance)
    }

    fn get_instance(&self, id: JobInstanceId) -> Result<Option<JobInstance>, ChunkStoreError> {
        (**self).get_instance(id)
    }

    fn update_instance(
        &self,
        id: JobInstanceId,
        update: &InstanceUpdate,
    ) -> Result<u64, ChunkStoreError> {
        (**self).update_instance(id, update)
    }

    fn list_active_instances(&self) -> Result<Vec<JobInstance>, ChunkStoreError> {
        (**self).list_active_instances()
    }

    fn insert_chunk(&self, chunk: NewWorkChunk) -> Result<WorkChunk, ChunkStoreError> {
        (**self).insert_chunk(chunk)
    }

    fn get_chunk(&self, id: ChunkId) -> Result<Option<WorkChunk>, ChunkStoreError> {
        (**self).get_chunk(id)
    }

    fn conditional_update_status(
        &self,
        id: ChunkId,
        expected_from: WorkChunkStatus,
        to: WorkChunkStatus,
        changes: &ChunkChanges,
    ) -> Result<u64, ChunkStoreError> {
        (**self).conditional_update_status(id, expected_from, to, changes)
    }

    fn claim_chunk(
        &self,
        id: ChunkId,
        expected_from: WorkChunkStatus,
        to: WorkChunkStatus,
        changes: &ChunkChanges,
    ) -> Result<Option<WorkChunk>, ChunkStoreError> {
        (**self).claim_chunk(id, expected_from, to, changes)
    }

    fn transition_chunks(
        &self,
        filter: &ChunkFilter,
        to: WorkChunkStatus,
        changes: &ChunkChanges,
    ) -> Result<u64, ChunkStoreError> {
        (**self).transition_chunks(filter, to, changes)
    }

    fn query_chunks(&self, query: &ChunkQuery) -> Result<Vec<WorkChunk>, ChunkStoreError> {
        (**self).query_chunks(query)
    }

    fn chunk_counts(&self, job_instance_id: JobInstanceId) -> Result<ChunkStats, ChunkStoreError> {
        (**self).chunk_counts(job_instance_id)
    }

    fn apply_atomically(&self, ops: &[StoreOp]) -> Result<Vec<u64>, ChunkStoreError> {
        (**self).apply_atomically(ops)
    }
}
