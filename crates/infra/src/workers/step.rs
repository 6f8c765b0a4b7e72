//! Step workers: the user code that processes one chunk of one step.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use batchflow_core::{JobDefinition, JobDefinitionId, JobInstance, StepId, WorkChunk};

/// Everything a step worker may look at while processing a chunk.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub chunk: &'a WorkChunk,
    pub instance: &'a JobInstance,
    pub definition: &'a JobDefinition,
    pub now: DateTime<Utc>,
}

impl<'a> StepContext<'a> {
    /// Payload produced by the previous step (`None` for the first step).
    pub fn data(&self) -> Option<&'a JsonValue> {
        self.chunk.data.as_ref()
    }

    /// Job instance parameters.
    pub fn parameters(&self) -> &'a JsonValue {
        &self.instance.parameters
    }

    pub fn step_id(&self) -> &'a StepId {
        &self.chunk.step_id
    }

    pub fn poll_attempts(&self) -> u32 {
        self.chunk.poll_attempts
    }
}

/// Result of running a step worker on a chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Chunk done. Each output becomes a chunk of the next step.
    Completed {
        outputs: Vec<JsonValue>,
        records_processed: u64,
    },
    /// Recoverable failure (chunk -> ERRORED); retrying is an external decision.
    Errored(String),
    /// Unrecoverable failure (chunk -> FAILED).
    Failed(String),
    /// Not ready yet; poll again after the configured backoff.
    PollAgain,
    /// Not ready yet; poll again at the given time.
    PollAt(DateTime<Utc>),
}

impl StepOutcome {
    /// Completed with no outputs.
    pub fn done(records_processed: u64) -> Self {
        Self::Completed {
            outputs: Vec::new(),
            records_processed,
        }
    }

    /// Completed, fanning out `outputs` to the next step.
    pub fn emit(outputs: Vec<JsonValue>) -> Self {
        let records_processed = outputs.len() as u64;
        Self::Completed {
            outputs,
            records_processed,
        }
    }
}

/// Processes chunks of one step.
pub trait StepWorker: Send + Sync {
    fn run(&self, ctx: &StepContext<'_>) -> StepOutcome;
}

impl<F> StepWorker for F
where
    F: Fn(&StepContext<'_>) -> StepOutcome + Send + Sync,
{
    fn run(&self, ctx: &StepContext<'_>) -> StepOutcome {
        self(ctx)
    }
}

/// Step workers keyed by (job definition, step).
#[derive(Default)]
pub struct StepWorkerRegistry {
    workers: HashMap<(JobDefinitionId, StepId), Arc<dyn StepWorker>>,
}

impl StepWorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker for a step, replacing any previous one.
    pub fn register<W>(
        &mut self,
        definition_id: impl Into<JobDefinitionId>,
        step_id: impl Into<StepId>,
        worker: W,
    ) -> &mut Self
    where
        W: StepWorker + 'static,
    {
        self.workers
            .insert((definition_id.into(), step_id.into()), Arc::new(worker));
        self
    }

    /// Register a closure as a step worker.
    pub fn register_fn<F>(
        &mut self,
        definition_id: impl Into<JobDefinitionId>,
        step_id: impl Into<StepId>,
        worker: F,
    ) -> &mut Self
    where
        F: Fn(&StepContext<'_>) -> StepOutcome + Send + Sync + 'static,
    {
        self.register(definition_id, step_id, worker)
    }

    pub fn get(&self, definition_id: &JobDefinitionId, step_id: &StepId) -> Option<Arc<dyn StepWorker>> {
        self.workers
            .get(&(definition_id.clone(), step_id.clone()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

impl std::fmt::Debug for StepWorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepWorkerRegistry")
            .field("steps", &self.workers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchflow_core::{ChunkId, NewWorkChunk, WorkChunkStatus};
    use serde_json::json;

    struct Doubler;

    impl StepWorker for Doubler {
        fn run(&self, ctx: &StepContext<'_>) -> StepOutcome {
            let n = ctx.data().and_then(|d| d["n"].as_u64()).unwrap_or(0);
            StepOutcome::emit(vec![json!({ "n": n * 2 })])
        }
    }

    #[test]
    fn registry_resolves_by_definition_and_step() {
        let mut registry = StepWorkerRegistry::new();
        registry
            .register("math", "double", Doubler)
            .register_fn("math", "report", |_ctx: &StepContext<'_>| StepOutcome::done(1));

        let def = JobDefinition::with_gated_execution("math", 1, &["double", "report"], false).unwrap();
        let instance = JobInstance::new(&def, json!({}), Utc::now());
        let chunk = WorkChunk::from_new(
            NewWorkChunk {
                id: ChunkId::new(),
                job_instance_id: instance.id,
                job_definition_id: def.id.clone(),
                step_id: StepId::from("double"),
                status: WorkChunkStatus::InProgress,
                data: Some(json!({ "n": 21 })),
                created_at: Utc::now(),
            },
            0,
        );
        let ctx = StepContext {
            chunk: &chunk,
            instance: &instance,
            definition: &def,
            now: Utc::now(),
        };

        let worker = registry.get(&def.id, &StepId::from("double")).unwrap();
        assert_eq!(
            worker.run(&ctx),
            StepOutcome::Completed {
                outputs: vec![json!({ "n": 42 })],
                records_processed: 1
            }
        );
        assert!(registry.get(&def.id, &StepId::from("missing")).is_none());
        assert!(registry.get(&"other".into(), &StepId::from("double")).is_none());
        assert_eq!(registry.len(), 2);
    }
}
