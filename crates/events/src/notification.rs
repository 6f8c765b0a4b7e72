use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use batchflow_core::{ChunkId, JobDefinitionId, JobInstanceId, StepId, WorkChunk};

/// "Chunk ready" message, sent once per successful READY -> QUEUED transition.
///
/// Carries enough routing metadata for a worker to pick a step worker without
/// reading storage first; the chunk row remains authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkReadyNotification {
    pub chunk_id: ChunkId,
    pub job_instance_id: JobInstanceId,
    pub job_definition_id: JobDefinitionId,
    pub step_id: StepId,
    pub queued_at: DateTime<Utc>,
}

impl ChunkReadyNotification {
    pub fn for_chunk(chunk: &WorkChunk, queued_at: DateTime<Utc>) -> Self {
        Self {
            chunk_id: chunk.id,
            job_instance_id: chunk.job_instance_id,
            job_definition_id: chunk.job_definition_id.clone(),
            step_id: chunk.step_id.clone(),
            queued_at,
        }
    }
}

impl ChunkReadyNotification {
    /// Wire form used by network transports.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchflow_core::{JobDefinition, JobInstance, NewWorkChunk, WorkChunkStatus};

    #[test]
    fn notification_carries_routing_metadata() {
        let def = JobDefinition::with_gated_execution("export", 1, &["read", "write"], true).unwrap();
        let instance = JobInstance::new(&def, serde_json::json!({}), Utc::now());
        let chunk = WorkChunk::from_new(
            NewWorkChunk {
                id: ChunkId::new(),
                job_instance_id: instance.id,
                job_definition_id: def.id.clone(),
                step_id: StepId::from("write"),
                status: WorkChunkStatus::Queued,
                data: None,
                created_at: Utc::now(),
            },
            3,
        );

        let n = ChunkReadyNotification::for_chunk(&chunk, Utc::now());
        assert_eq!(n.chunk_id, chunk.id);
        assert_eq!(n.step_id.as_str(), "write");

        let decoded = ChunkReadyNotification::from_json(&n.to_json().unwrap()).unwrap();
        assert_eq!(decoded, n);
    }

    #[test]
    fn malformed_payload_is_rejected() {
        assert!(ChunkReadyNotification::from_json("{\"chunk_id\": 1}").is_err());
    }
}
