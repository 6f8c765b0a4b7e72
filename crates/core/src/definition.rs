//! Job definitions: the ordered steps a job runs through.
//!
//! Definitions are supplied by the embedding application at registration time;
//! the engine only reads them.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{JobDefinitionId, StepId};

/// One step of a job definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: StepId,
    /// Chunks of a gated step wait until every chunk of the previous step completes.
    pub gated: bool,
}

impl StepDefinition {
    pub fn new(id: impl Into<StepId>) -> Self {
        Self {
            id: id.into(),
            gated: false,
        }
    }

    pub fn gated(id: impl Into<StepId>) -> Self {
        Self {
            id: id.into(),
            gated: true,
        }
    }
}

/// Ordered list of steps for a kind of job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: JobDefinitionId,
    pub version: u32,
    steps: Vec<StepDefinition>,
}

impl JobDefinition {
    /// Build a definition, validating that it has steps and no duplicate step ids.
    pub fn new(
        id: impl Into<JobDefinitionId>,
        version: u32,
        steps: Vec<StepDefinition>,
    ) -> DomainResult<Self> {
        let id = id.into();
        if steps.is_empty() {
            return Err(DomainError::validation(format!(
                "job definition '{id}' must declare at least one step"
            )));
        }
        for (idx, step) in steps.iter().enumerate() {
            if steps[..idx].iter().any(|s| s.id == step.id) {
                return Err(DomainError::validation(format!(
                    "job definition '{id}' declares step '{}' twice",
                    step.id
                )));
            }
        }
        Ok(Self { id, version, steps })
    }

    /// Definition whose later steps are all gated (or none are).
    pub fn with_gated_execution(
        id: impl Into<JobDefinitionId>,
        version: u32,
        step_ids: &[&str],
        gated: bool,
    ) -> DomainResult<Self> {
        let steps = step_ids
            .iter()
            .map(|s| StepDefinition {
                id: StepId::from(*s),
                gated,
            })
            .collect();
        Self::new(id, version, steps)
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn first_step(&self) -> &StepDefinition {
        // `new` guarantees at least one step.
        &self.steps[0]
    }

    pub fn last_step(&self) -> &StepDefinition {
        &self.steps[self.steps.len() - 1]
    }

    pub fn is_first_step(&self, step_id: &StepId) -> bool {
        &self.first_step().id == step_id
    }

    pub fn is_last_step(&self, step_id: &StepId) -> bool {
        &self.last_step().id == step_id
    }

    pub fn step(&self, step_id: &StepId) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| &s.id == step_id)
    }

    pub fn position(&self, step_id: &StepId) -> Option<usize> {
        self.steps.iter().position(|s| &s.id == step_id)
    }

    /// The step following `step_id`, if any.
    pub fn step_after(&self, step_id: &StepId) -> Option<&StepDefinition> {
        self.position(step_id).and_then(|idx| self.steps.get(idx + 1))
    }

    /// Whether any non-first step is gated; such jobs use the gate pointer.
    pub fn is_gated(&self) -> bool {
        self.steps.iter().skip(1).any(|s| s.gated)
    }

    /// Whether new chunks of `step_id` must start in GATE_WAITING.
    pub fn requires_gate(&self, step_id: &StepId) -> DomainResult<bool> {
        let step = self.step(step_id).ok_or_else(|| {
            DomainError::validation(format!(
                "job definition '{}' has no step '{step_id}'",
                self.id
            ))
        })?;
        Ok(step.gated && !self.is_first_step(step_id))
    }
}
