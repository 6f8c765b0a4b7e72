//! Transition engine.
//!
//! Every chunk state change goes through [`TransitionEngine`]: the event is checked
//! against the transition table, then applied as a conditional update on the
//! persisted status. Concurrent actors are coordinated only by those conditional
//! updates; the loser of a race sees zero affected rows.

use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use batchflow_core::{
    ChunkEvent, ChunkId, Clock, JobDefinition, JobInstance, JobInstanceId, JobInstanceStatus,
    NewWorkChunk, StepId, SystemClock, WorkChunk, WorkChunkStatus,
};

use crate::error::{BatchError, BatchResult};
use crate::store::{
    ChunkChanges, ChunkFilter, ChunkStore, InstanceChanges, InstanceUpdate, StoreOp,
};

/// Request to create a chunk of a non-first step.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateChunk {
    pub job_instance_id: JobInstanceId,
    pub step_id: StepId,
    pub data: Option<JsonValue>,
    /// Whether the definition gates this step.
    pub gated_execution: bool,
}

/// Outcome of a gate advance. All zero when the gate was not behind the
/// requested step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GateAdvance {
    /// Whether this call moved the gate.
    pub moved: bool,
    /// GATE_WAITING -> READY
    pub released: u64,
    /// QUEUED -> READY (queue entries that predate the gate)
    pub requeued: u64,
}

impl GateAdvance {
    pub fn total(&self) -> u64 {
        self.released + self.requeued
    }
}

/// Applies chunk and instance state changes against a [`ChunkStore`].
#[derive(Debug)]
pub struct TransitionEngine<S, C = SystemClock> {
    store: S,
    clock: C,
}

impl<S: ChunkStore> TransitionEngine<S, SystemClock> {
    pub fn with_system_clock(store: S) -> Self {
        Self::new(store, SystemClock)
    }
}

impl<S: ChunkStore, C: Clock> TransitionEngine<S, C> {
    pub fn new(store: S, clock: C) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Persist a new QUEUED instance of `definition` together with its first chunk.
    pub fn create_job_instance(
        &self,
        definition: &JobDefinition,
        parameters: JsonValue,
    ) -> BatchResult<(JobInstanceId, ChunkId)> {
        let instance = JobInstance::new(definition, parameters, self.clock.now());
        let instance_id = instance.id;
        self.store.insert_instance(instance)?;
        info!(
            job_instance_id = %instance_id,
            job_definition_id = %definition.id,
            "job instance created"
        );

        let chunk_id = self.create_first_chunk(definition, instance_id)?;
        Ok((instance_id, chunk_id))
    }

    /// Create the chunk that runs the definition's first step. Always READY.
    pub fn create_first_chunk(
        &self,
        definition: &JobDefinition,
        job_instance_id: JobInstanceId,
    ) -> BatchResult<ChunkId> {
        let instance = self.require_instance_for_creation(job_instance_id)?;
        if instance.job_definition_id != definition.id {
            return Err(BatchError::validation(format!(
                "job instance {job_instance_id} belongs to '{}', not '{}'",
                instance.job_definition_id, definition.id
            )));
        }

        let step_id = definition.first_step().id.clone();
        let status = WorkChunkStatus::initial(true, definition.is_gated());
        self.insert_chunk(&instance, step_id, status, None)
    }

    /// Create a chunk of a later step: GATE_WAITING when gated, READY otherwise.
    pub fn create_chunk(&self, request: CreateChunk) -> BatchResult<ChunkId> {
        let instance = self.require_instance_for_creation(request.job_instance_id)?;

        // The gate may already sit on this step (it had no chunks when it advanced).
        let gate_open = instance.current_gated_step_id.as_ref() == Some(&request.step_id);
        let status = WorkChunkStatus::initial(false, request.gated_execution && !gate_open);
        self.insert_chunk(&instance, request.step_id, status, request.data)
    }

    fn require_instance_for_creation(&self, id: JobInstanceId) -> BatchResult<JobInstance> {
        self.store
            .get_instance(id)?
            .ok_or_else(|| BatchError::validation(format!("job instance {id} does not exist")))
    }

    fn insert_chunk(
        &self,
        instance: &JobInstance,
        step_id: StepId,
        status: WorkChunkStatus,
        data: Option<JsonValue>,
    ) -> BatchResult<ChunkId> {
        let chunk = self.store.insert_chunk(NewWorkChunk {
            id: ChunkId::new(),
            job_instance_id: instance.id,
            job_definition_id: instance.job_definition_id.clone(),
            step_id,
            status,
            data,
            created_at: self.clock.now(),
        })?;
        info!(
            chunk_id = %chunk.id,
            job_instance_id = %chunk.job_instance_id,
            step_id = %chunk.step_id,
            sequence = chunk.sequence,
            status = %chunk.status,
            "work chunk created"
        );
        Ok(chunk.id)
    }

    /// READY -> QUEUED. Returns rows affected (0 when the chunk was not READY).
    pub fn mark_chunk_queued(&self, chunk_id: ChunkId) -> BatchResult<u64> {
        self.fire(chunk_id, ChunkEvent::Dispatch, ChunkChanges::at(self.clock.now()))
    }

    /// QUEUED -> READY after a dispatch whose notification could not be sent.
    pub fn abort_dispatch(&self, chunk_id: ChunkId) -> BatchResult<u64> {
        self.fire(
            chunk_id,
            ChunkEvent::DispatchAborted,
            ChunkChanges::at(self.clock.now()),
        )
    }

    /// QUEUED -> IN_PROGRESS. Returns the claimed chunk (payload included), or
    /// `None` when it was not QUEUED (duplicate delivery, lost race).
    pub fn on_work_chunk_dequeue(&self, chunk_id: ChunkId) -> BatchResult<Option<WorkChunk>> {
        let event = ChunkEvent::Dequeue;
        let changes = ChunkChanges::at(self.clock.now()).started();
        for from in event.sources() {
            let to = event.apply(from)?;
            if let Some(claimed) = self.store.claim_chunk(chunk_id, from, to, &changes)? {
                debug!(chunk_id = %chunk_id, ?event, %from, %to, "chunk claimed");
                return Ok(Some(claimed));
            }
        }

        if self.store.get_chunk(chunk_id)?.is_none() {
            return Err(BatchError::not_found(format!("work chunk {chunk_id}")));
        }
        debug!(chunk_id = %chunk_id, ?event, "chunk not QUEUED; claim skipped");
        Ok(None)
    }

    /// IN_PROGRESS -> POLL_WAITING with `next_poll_time`; bumps the poll count.
    pub fn on_work_chunk_poll_delay(
        &self,
        chunk_id: ChunkId,
        next_poll_time: chrono::DateTime<chrono::Utc>,
    ) -> BatchResult<u64> {
        let changes = ChunkChanges::at(self.clock.now()).poll_at(next_poll_time);
        self.fire(chunk_id, ChunkEvent::PollRequested, changes)
    }

    /// Every POLL_WAITING chunk of the instance whose deadline has passed -> READY.
    pub fn update_poll_waiting_chunks_for_job_if_ready(
        &self,
        job_instance_id: JobInstanceId,
    ) -> BatchResult<u64> {
        let now = self.clock.now();
        let from = WorkChunkStatus::PollWaiting;
        let to = ChunkEvent::PollDeadlineExpired.apply(from)?;
        let filter = ChunkFilter {
            job_instance_id,
            step_id: None,
            from,
            poll_due_by: Some(now),
        };

        let expired = self
            .store
            .transition_chunks(&filter, to, &ChunkChanges::at(now))?;
        if expired > 0 {
            debug!(job_instance_id = %job_instance_id, expired, "poll deadlines expired");
        }
        Ok(expired)
    }

    /// Move the gate to `next_step_id` and release that step's GATE_WAITING and
    /// QUEUED chunks to READY, all in one atomic write. The caller has already
    /// verified that the previous step is complete.
    ///
    /// The gate only moves forward: the write is conditional on the stored gate
    /// sitting on a step before `next_step_id`. Otherwise nothing is written and
    /// a zero [`GateAdvance`] is returned.
    pub fn advance_job_step_and_update_chunk_status(
        &self,
        job_instance_id: JobInstanceId,
        definition: &JobDefinition,
        next_step_id: &StepId,
    ) -> BatchResult<GateAdvance> {
        let instance = self
            .store
            .get_instance(job_instance_id)?
            .ok_or_else(|| BatchError::not_found(format!("job instance {job_instance_id}")))?;
        if instance.job_definition_id != definition.id {
            return Err(BatchError::validation(format!(
                "job instance {job_instance_id} belongs to '{}', not '{}'",
                instance.job_definition_id, definition.id
            )));
        }
        let position = match definition.position(next_step_id) {
            Some(position) if position > 0 => position,
            Some(_) => {
                return Err(BatchError::validation(format!(
                    "cannot advance the gate to the first step '{next_step_id}'"
                )));
            }
            None => {
                return Err(BatchError::validation(format!(
                    "job definition '{}' has no step '{next_step_id}'",
                    definition.id
                )));
            }
        };
        let earlier_steps = definition.steps()[..position].iter().map(|s| s.id.clone());

        let now = self.clock.now();
        let event = ChunkEvent::GateAdvanced;
        let sources = event.sources();

        let mut ops = Vec::with_capacity(sources.len() + 1);
        ops.push(StoreOp::UpdateInstance {
            id: job_instance_id,
            update: InstanceUpdate::unconditional(InstanceChanges {
                current_gated_step_id: Some(next_step_id.clone()),
                ..InstanceChanges::default()
            })
            .gate_in(earlier_steps),
        });
        for from in &sources {
            ops.push(StoreOp::TransitionChunks {
                filter: ChunkFilter {
                    job_instance_id,
                    step_id: Some(next_step_id.clone()),
                    from: *from,
                    poll_due_by: None,
                },
                to: event.apply(*from)?,
                changes: ChunkChanges::at(now),
            });
        }

        let counts = self.store.apply_atomically(&ops)?;
        if counts.first().copied().unwrap_or(0) == 0 {
            debug!(
                job_instance_id = %job_instance_id,
                step_id = %next_step_id,
                "gate already at or past step; advance skipped"
            );
            return Ok(GateAdvance::default());
        }

        let mut advance = GateAdvance {
            moved: true,
            ..GateAdvance::default()
        };
        for (from, affected) in sources.iter().zip(counts.iter().skip(1)) {
            match from {
                WorkChunkStatus::GateWaiting => advance.released += affected,
                _ => advance.requeued += affected,
            }
        }

        info!(
            job_instance_id = %job_instance_id,
            step_id = %next_step_id,
            released = advance.released,
            requeued = advance.requeued,
            "gate advanced"
        );
        Ok(advance)
    }

    /// IN_PROGRESS -> COMPLETED.
    pub fn on_work_chunk_completion_success(
        &self,
        chunk_id: ChunkId,
        records_processed: u64,
    ) -> BatchResult<u64> {
        let changes = ChunkChanges::at(self.clock.now())
            .finished()
            .with_records_processed(records_processed);
        self.fire(chunk_id, ChunkEvent::Succeeded, changes)
    }

    /// IN_PROGRESS -> ERRORED; bumps the error count.
    pub fn on_work_chunk_error(&self, chunk_id: ChunkId, message: &str) -> BatchResult<u64> {
        let changes = ChunkChanges::at(self.clock.now()).with_error(message);
        self.fire(chunk_id, ChunkEvent::RecoverableError, changes)
    }

    /// IN_PROGRESS or POLL_WAITING -> FAILED.
    pub fn on_work_chunk_failed(&self, chunk_id: ChunkId, message: &str) -> BatchResult<u64> {
        let mut changes = ChunkChanges::at(self.clock.now()).finished();
        changes.error_message = Some(message.to_string());
        self.fire(chunk_id, ChunkEvent::UnrecoverableError, changes)
    }

    /// Apply `event` from whichever of its source statuses the chunk is in.
    fn fire(&self, chunk_id: ChunkId, event: ChunkEvent, changes: ChunkChanges) -> BatchResult<u64> {
        for from in event.sources() {
            let to = event.apply(from)?;
            let affected = self
                .store
                .conditional_update_status(chunk_id, from, to, &changes)?;
            if affected > 0 {
                debug!(chunk_id = %chunk_id, ?event, %from, %to, "chunk transitioned");
                return Ok(affected);
            }
        }

        if self.store.get_chunk(chunk_id)?.is_none() {
            return Err(BatchError::not_found(format!("work chunk {chunk_id}")));
        }
        debug!(chunk_id = %chunk_id, ?event, "chunk not in a source status; skipped");
        Ok(0)
    }

    /// QUEUED -> IN_PROGRESS for the instance itself, once work has started.
    pub fn start_job_instance(&self, job_instance_id: JobInstanceId) -> BatchResult<u64> {
        let now = self.clock.now();
        self.update_instance(
            job_instance_id,
            InstanceUpdate::when(
                &[JobInstanceStatus::Queued],
                InstanceChanges {
                    status: Some(JobInstanceStatus::InProgress),
                    start_time: Some(now),
                    ..InstanceChanges::default()
                },
            ),
        )
    }

    pub fn complete_job_instance(&self, job_instance_id: JobInstanceId) -> BatchResult<u64> {
        self.finish_job_instance(job_instance_id, JobInstanceStatus::Completed, None)
    }

    pub fn fail_job_instance(
        &self,
        job_instance_id: JobInstanceId,
        message: impl Into<String>,
    ) -> BatchResult<u64> {
        self.finish_job_instance(
            job_instance_id,
            JobInstanceStatus::Failed,
            Some(message.into()),
        )
    }

    pub fn cancel_job_instance(&self, job_instance_id: JobInstanceId) -> BatchResult<u64> {
        self.finish_job_instance(job_instance_id, JobInstanceStatus::Cancelled, None)
    }

    fn finish_job_instance(
        &self,
        job_instance_id: JobInstanceId,
        status: JobInstanceStatus,
        error_message: Option<String>,
    ) -> BatchResult<u64> {
        let affected = self.update_instance(
            job_instance_id,
            InstanceUpdate::when(
                &[JobInstanceStatus::Queued, JobInstanceStatus::InProgress],
                InstanceChanges {
                    status: Some(status),
                    end_time: Some(self.clock.now()),
                    error_message,
                    ..InstanceChanges::default()
                },
            ),
        )?;
        if affected > 0 {
            info!(job_instance_id = %job_instance_id, %status, "job instance finished");
        }
        Ok(affected)
    }

    fn update_instance(&self, id: JobInstanceId, update: InstanceUpdate) -> BatchResult<u64> {
        let affected = self.store.update_instance(id, &update)?;
        if affected == 0 && self.store.get_instance(id)?.is_none() {
            return Err(BatchError::not_found(format!("job instance {id}")));
        }
        Ok(affected)
    }
}
