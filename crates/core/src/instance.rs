//! Job instances: one execution of a job definition.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::definition::JobDefinition;
use crate::error::DomainError;
use crate::id::{JobDefinitionId, JobInstanceId, StepId};

/// Lifecycle of a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobInstanceStatus {
    /// Created; no chunk has started yet.
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl JobInstanceStatus {
    pub const ALL: [JobInstanceStatus; 5] = [
        JobInstanceStatus::Queued,
        JobInstanceStatus::InProgress,
        JobInstanceStatus::Completed,
        JobInstanceStatus::Failed,
        JobInstanceStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobInstanceStatus::Queued => "QUEUED",
            JobInstanceStatus::InProgress => "IN_PROGRESS",
            JobInstanceStatus::Completed => "COMPLETED",
            JobInstanceStatus::Failed => "FAILED",
            JobInstanceStatus::Cancelled => "CANCELLED",
        }
    }

    /// Terminal instances are skipped by maintenance.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobInstanceStatus::Completed | JobInstanceStatus::Failed | JobInstanceStatus::Cancelled
        )
    }
}

impl core::fmt::Display for JobInstanceStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobInstanceStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobInstanceStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job instance status '{s}'")))
    }
}

/// A job instance as persisted by the storage adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: JobInstanceId,
    pub job_definition_id: JobDefinitionId,
    pub job_definition_version: u32,
    pub status: JobInstanceStatus,
    /// Step currently gating chunk release (gated definitions only).
    pub current_gated_step_id: Option<StepId>,
    pub parameters: JsonValue,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl JobInstance {
    /// New QUEUED instance whose gate sits on the definition's first step.
    pub fn new(definition: &JobDefinition, parameters: JsonValue, now: DateTime<Utc>) -> Self {
        Self {
            id: JobInstanceId::new(),
            job_definition_id: definition.id.clone(),
            job_definition_version: definition.version,
            status: JobInstanceStatus::Queued,
            current_gated_step_id: Some(definition.first_step().id.clone()),
            parameters,
            created_at: now,
            start_time: None,
            end_time: None,
            error_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_instance_gates_on_first_step() {
        let def = JobDefinition::with_gated_execution("job", 1, &["a", "b"], true).unwrap();
        let instance = JobInstance::new(&def, serde_json::json!({}), Utc::now());
        assert_eq!(instance.status, JobInstanceStatus::Queued);
        assert_eq!(instance.current_gated_step_id, Some(StepId::from("a")));
    }

    #[test]
    fn terminal_instance_statuses() {
        assert!(!JobInstanceStatus::Queued.is_terminal());
        assert!(!JobInstanceStatus::InProgress.is_terminal());
        assert!(JobInstanceStatus::Cancelled.is_terminal());
        assert_eq!("FAILED".parse::<JobInstanceStatus>().unwrap(), JobInstanceStatus::Failed);
    }
}
