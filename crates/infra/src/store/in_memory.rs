use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use batchflow_core::{
    ChunkId, JobInstance, JobInstanceId, NewWorkChunk, StepId, WorkChunk, WorkChunkStatus,
};

use super::r#trait::{
    ChunkChanges, ChunkFilter, ChunkQuery, ChunkStats, ChunkStore, ChunkStoreError,
    InstanceUpdate, StoreOp,
};

#[derive(Debug, Default)]
struct State {
    instances: HashMap<JobInstanceId, JobInstance>,
    chunks: HashMap<ChunkId, WorkChunk>,
    /// Next sequence number per (instance, step).
    sequences: HashMap<(JobInstanceId, StepId), u32>,
}

/// In-memory chunk store.
///
/// Intended for tests/dev. Every operation takes a single lock over the whole
/// state, so each call (and each `apply_atomically` batch) is trivially atomic.
#[derive(Debug)]
pub struct InMemoryChunkStore {
    state: RwLock<State>,
    available: AtomicBool,
}

impl Default for InMemoryChunkStore {
    fn default() -> Self {
        Self {
            state: RwLock::new(State::default()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while unavailable every call fails with
    /// [`ChunkStoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), ChunkStoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ChunkStoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ))
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, ChunkStoreError> {
        self.check_available()?;
        self.state
            .read()
            .map_err(|_| ChunkStoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, ChunkStoreError> {
        self.check_available()?;
        self.state
            .write()
            .map_err(|_| ChunkStoreError::Storage("lock poisoned".to_string()))
    }

    fn update_instance_locked(state: &mut State, id: JobInstanceId, update: &InstanceUpdate) -> u64 {
        match state.instances.get_mut(&id) {
            Some(instance) if update.matches(instance) => {
                update.apply_to(instance);
                1
            }
            _ => 0,
        }
    }

    fn transition_locked(
        state: &mut State,
        filter: &ChunkFilter,
        to: WorkChunkStatus,
        changes: &ChunkChanges,
    ) -> u64 {
        let mut affected = 0;
        for chunk in state.chunks.values_mut().filter(|c| filter.matches(c)) {
            changes.apply_to(chunk, to);
            affected += 1;
        }
        affected
    }
}

impl ChunkStore for InMemoryChunkStore {
    fn insert_instance(&self, instance: JobInstance) -> Result<(), ChunkStoreError> {
        let mut state = self.write()?;
        if state.instances.contains_key(&instance.id) {
            return Err(ChunkStoreError::AlreadyExists(format!(
                "job instance {}",
                instance.id
            )));
        }
        state.instances.insert(instance.id, instance);
        Ok(())
    }

    fn get_instance(&self, id: JobInstanceId) -> Result<Option<JobInstance>, ChunkStoreError> {
        Ok(self.read()?.instances.get(&id).cloned())
    }

    fn update_instance(
        &self,
        id: JobInstanceId,
        update: &InstanceUpdate,
    ) -> Result<u64, ChunkStoreError> {
        let mut state = self.write()?;
        Ok(Self::update_instance_locked(&mut state, id, update))
    }

    fn list_active_instances(&self) -> Result<Vec<JobInstance>, ChunkStoreError> {
        let state = self.read()?;
        let mut active: Vec<JobInstance> = state
            .instances
            .values()
            .filter(|i| !i.status.is_terminal())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(active)
    }

    fn insert_chunk(&self, chunk: NewWorkChunk) -> Result<WorkChunk, ChunkStoreError> {
        let mut state = self.write()?;
        if state.chunks.contains_key(&chunk.id) {
            return Err(ChunkStoreError::AlreadyExists(format!("work chunk {}", chunk.id)));
        }
        if !state.instances.contains_key(&chunk.job_instance_id) {
            return Err(ChunkStoreError::NotFound(format!(
                "job instance {}",
                chunk.job_instance_id
            )));
        }

        let key = (chunk.job_instance_id, chunk.step_id.clone());
        let next = state.sequences.entry(key).or_insert(0);
        let sequence = *next;
        *next += 1;

        let stored = WorkChunk::from_new(chunk, sequence);
        state.chunks.insert(stored.id, stored.clone());
        Ok(stored)
    }

    fn get_chunk(&self, id: ChunkId) -> Result<Option<WorkChunk>, ChunkStoreError> {
        Ok(self.read()?.chunks.get(&id).cloned())
    }

    fn conditional_update_status(
        &self,
        id: ChunkId,
        expected_from: WorkChunkStatus,
        to: WorkChunkStatus,
        changes: &ChunkChanges,
    ) -> Result<u64, ChunkStoreError> {
        Ok(self.claim_chunk(id, expected_from, to, changes)?.map_or(0, |_| 1))
    }

    fn claim_chunk(
        &self,
        id: ChunkId,
        expected_from: WorkChunkStatus,
        to: WorkChunkStatus,
        changes: &ChunkChanges,
    ) -> Result<Option<WorkChunk>, ChunkStoreError> {
        let mut state = self.write()?;
        match state.chunks.get_mut(&id) {
            Some(chunk) if chunk.status == expected_from => {
                changes.apply_to(chunk, to);
                Ok(Some(chunk.clone()))
            }
            _ => Ok(None),
        }
    }

    fn transition_chunks(
        &self,
        filter: &ChunkFilter,
        to: WorkChunkStatus,
        changes: &ChunkChanges,
    ) -> Result<u64, ChunkStoreError> {
        let mut state = self.write()?;
        Ok(Self::transition_locked(&mut state, filter, to, changes))
    }

    fn query_chunks(&self, query: &ChunkQuery) -> Result<Vec<WorkChunk>, ChunkStoreError> {
        let state = self.read()?;
        let mut chunks: Vec<WorkChunk> = state
            .chunks
            .values()
            .filter(|c| query.matches(c))
            .cloned()
            .collect();
        chunks.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.sequence.cmp(&b.sequence))
                .then(a.id.cmp(&b.id))
        });
        if let Some(limit) = query.limit {
            chunks.truncate(limit);
        }
        Ok(chunks)
    }

    fn chunk_counts(&self, job_instance_id: JobInstanceId) -> Result<ChunkStats, ChunkStoreError> {
        let state = self.read()?;
        let mut stats = ChunkStats::default();
        state
            .chunks
            .values()
            .filter(|c| c.job_instance_id == job_instance_id)
            .for_each(|c| stats.record(c.status));
        Ok(stats)
    }

    fn apply_atomically(&self, ops: &[StoreOp]) -> Result<Vec<u64>, ChunkStoreError> {
        let mut state = self.write()?;
        let mut counts = Vec::with_capacity(ops.len());
        for op in ops {
            let affected = match op {
                StoreOp::UpdateInstance { id, update } => {
                    Self::update_instance_locked(&mut state, *id, update)
                }
                StoreOp::TransitionChunks {
                    filter,
                    to,
                    changes,
                } => Self::transition_locked(&mut state, filter, *to, changes),
            };
            counts.push(affected);
            if affected == 0 && matches!(op, StoreOp::UpdateInstance { .. }) {
                break;
            }
        }
        counts.resize(ops.len(), 0);
        Ok(counts)
    }
}
