//! Work chunks: the atomic unit of schedulable work.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::id::{ChunkId, JobDefinitionId, JobInstanceId, StepId};

/// Persisted status of a work chunk.
///
/// Legal movements between statuses are listed in [`crate::transition::TRANSITIONS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkChunkStatus {
    /// Eligible for dispatch.
    Ready,
    /// Waiting for the job's gate to reach this chunk's step.
    GateWaiting,
    /// Dispatched; a "chunk ready" notification has been sent.
    Queued,
    /// Claimed by a worker.
    InProgress,
    /// Suspended until `next_poll_time`.
    PollWaiting,
    /// Recoverable failure; retried only by an external policy.
    Errored,
    /// Unrecoverable failure (terminal).
    Failed,
    /// Finished successfully (terminal).
    Completed,
}

impl WorkChunkStatus {
    pub const ALL: [WorkChunkStatus; 8] = [
        WorkChunkStatus::Ready,
        WorkChunkStatus::GateWaiting,
        WorkChunkStatus::Queued,
        WorkChunkStatus::InProgress,
        WorkChunkStatus::PollWaiting,
        WorkChunkStatus::Errored,
        WorkChunkStatus::Failed,
        WorkChunkStatus::Completed,
    ];

    /// Stable storage representation (matches the serde form).
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkChunkStatus::Ready => "READY",
            WorkChunkStatus::GateWaiting => "GATE_WAITING",
            WorkChunkStatus::Queued => "QUEUED",
            WorkChunkStatus::InProgress => "IN_PROGRESS",
            WorkChunkStatus::PollWaiting => "POLL_WAITING",
            WorkChunkStatus::Errored => "ERRORED",
            WorkChunkStatus::Failed => "FAILED",
            WorkChunkStatus::Completed => "COMPLETED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkChunkStatus::Completed | WorkChunkStatus::Failed)
    }

    /// Status a freshly created chunk starts in.
    ///
    /// The first step never waits on a gate: there is no prior step to gate against.
    pub fn initial(first_step: bool, gated_execution: bool) -> Self {
        if !first_step && gated_execution {
            WorkChunkStatus::GateWaiting
        } else {
            WorkChunkStatus::Ready
        }
    }
}

impl core::fmt::Display for WorkChunkStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkChunkStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkChunkStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown work chunk status '{s}'")))
    }
}

/// A work chunk as persisted by the storage adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkChunk {
    pub id: ChunkId,
    pub job_instance_id: JobInstanceId,
    pub job_definition_id: JobDefinitionId,
    pub step_id: StepId,
    /// Creation order within the owning instance + step (starts at 0).
    pub sequence: u32,
    pub status: WorkChunkStatus,
    /// Payload produced by the previous step.
    pub data: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Set only while `status == PollWaiting`.
    pub next_poll_time: Option<DateTime<Utc>>,
    pub poll_attempts: u32,
    pub error_count: u32,
    pub error_message: Option<String>,
    pub records_processed: Option<u64>,
}

impl WorkChunk {
    /// Materialize a chunk from a creation request (as a store does on insert).
    pub fn from_new(new: NewWorkChunk, sequence: u32) -> Self {
        Self {
            id: new.id,
            job_instance_id: new.job_instance_id,
            job_definition_id: new.job_definition_id,
            step_id: new.step_id,
            sequence,
            status: new.status,
            data: new.data,
            created_at: new.created_at,
            updated_at: new.created_at,
            start_time: None,
            end_time: None,
            next_poll_time: None,
            poll_attempts: 0,
            error_count: 0,
            error_message: None,
            records_processed: None,
        }
    }

    /// Whether the chunk is POLL_WAITING with a deadline at or before `now`.
    pub fn poll_due(&self, now: DateTime<Utc>) -> bool {
        self.status == WorkChunkStatus::PollWaiting
            && self.next_poll_time.is_some_and(|t| t <= now)
    }

    /// `next_poll_time` must be present exactly while the chunk is POLL_WAITING.
    pub fn check_invariants(&self) -> DomainResult<()> {
        let waiting = self.status == WorkChunkStatus::PollWaiting;
        if waiting != self.next_poll_time.is_some() {
            return Err(DomainError::validation(format!(
                "chunk {} is {} but next_poll_time is {:?}",
                self.id, self.status, self.next_poll_time
            )));
        }
        Ok(())
    }
}

/// A chunk creation request handed to the storage adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewWorkChunk {
    pub id: ChunkId,
    pub job_instance_id: JobInstanceId,
    pub job_definition_id: JobDefinitionId,
    pub step_id: StepId,
    pub status: WorkChunkStatus,
    pub data: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_form_round_trips() {
        for status in WorkChunkStatus::ALL {
            assert_eq!(status.as_str().parse::<WorkChunkStatus>().unwrap(), status);
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert!("GATED".parse::<WorkChunkStatus>().is_err());
    }

    #[test]
    fn first_step_is_ready_regardless_of_gating() {
        assert_eq!(WorkChunkStatus::initial(true, true), WorkChunkStatus::Ready);
        assert_eq!(WorkChunkStatus::initial(true, false), WorkChunkStatus::Ready);
    }

    #[test]
    fn later_step_waits_on_gate_only_when_gated() {
        assert_eq!(WorkChunkStatus::initial(false, true), WorkChunkStatus::GateWaiting);
        assert_eq!(WorkChunkStatus::initial(false, false), WorkChunkStatus::Ready);
    }

    #[test]
    fn poll_is_due_only_for_poll_waiting_chunks_past_their_deadline() {
        use chrono::TimeZone;

        let now = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let mut chunk = WorkChunk::from_new(
            NewWorkChunk {
                id: ChunkId::new(),
                job_instance_id: JobInstanceId::new(),
                job_definition_id: JobDefinitionId::from("import"),
                step_id: StepId::from("fetch"),
                status: WorkChunkStatus::PollWaiting,
                data: None,
                created_at: now,
            },
            0,
        );
        chunk.next_poll_time = Some(now);
        assert!(chunk.poll_due(now));
        assert!(!chunk.poll_due(now - chrono::Duration::seconds(1)));

        // A stale deadline on any other status never counts.
        chunk.status = WorkChunkStatus::Ready;
        assert!(!chunk.poll_due(now + chrono::Duration::hours(1)));
    }
}
