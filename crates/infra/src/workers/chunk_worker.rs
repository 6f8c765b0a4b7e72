//! Chunk worker: notification -> dequeue -> step worker -> outcome.

use std::sync::{Arc, Mutex, mpsc};
use std::thread;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use batchflow_core::{ChunkId, Clock, JobDefinition, SystemClock, WorkChunk};
use batchflow_events::{ChunkReadyNotification, EventBus, Subscription};

use crate::backoff::PollBackoff;
use crate::config::WorkerConfig;
use crate::definitions::JobDefinitionRegistry;
use crate::engine::{CreateChunk, TransitionEngine};
use crate::error::{BatchError, BatchResult};
use crate::store::ChunkStore;

use super::step::{StepContext, StepOutcome, StepWorkerRegistry};

/// What happened to one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkRunResult {
    /// The chunk was no longer QUEUED (duplicate delivery or another worker won).
    Skipped,
    Completed { chunks_created: usize },
    Errored,
    Failed,
    PollScheduled(DateTime<Utc>),
}

/// Worker pool statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub notifications: u64,
    pub skipped: u64,
    pub completed: u64,
    pub errored: u64,
    pub failed: u64,
    pub polls_scheduled: u64,
    /// Notifications whose processing returned an error (storage, bus, ...)
    pub processing_errors: u64,
}

impl WorkerStats {
    fn record(&mut self, result: &BatchResult<ChunkRunResult>) {
        self.notifications += 1;
        match result {
            Ok(ChunkRunResult::Skipped) => self.skipped += 1,
            Ok(ChunkRunResult::Completed { .. }) => self.completed += 1,
            Ok(ChunkRunResult::Errored) => self.errored += 1,
            Ok(ChunkRunResult::Failed) => self.failed += 1,
            Ok(ChunkRunResult::PollScheduled(_)) => self.polls_scheduled += 1,
            Err(_) => self.processing_errors += 1,
        }
    }
}

/// Handle to a pool of worker threads.
#[derive(Debug)]
pub struct ChunkWorkerPool {
    workers: Vec<(mpsc::Sender<()>, thread::JoinHandle<()>)>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl ChunkWorkerPool {
    /// Request graceful shutdown and wait for every thread to stop.
    pub fn shutdown(self) {
        for (shutdown, _) in &self.workers {
            let _ = shutdown.send(());
        }
        for (_, join) in self.workers {
            let _ = join.join();
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }
}

/// Processes "chunk ready" notifications.
///
/// Safe under at-least-once delivery and with many competing workers: the
/// conditional QUEUED -> IN_PROGRESS dequeue admits exactly one of them.
pub struct ChunkWorker<S, C = SystemClock> {
    engine: Arc<TransitionEngine<S, C>>,
    definitions: Arc<JobDefinitionRegistry>,
    steps: Arc<StepWorkerRegistry>,
    backoff: PollBackoff,
}

impl<S: ChunkStore, C: Clock> ChunkWorker<S, C> {
    pub fn new(
        engine: Arc<TransitionEngine<S, C>>,
        definitions: Arc<JobDefinitionRegistry>,
        steps: Arc<StepWorkerRegistry>,
    ) -> Self {
        Self {
            engine,
            definitions,
            steps,
            backoff: PollBackoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: PollBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn handle_notification(&self, notification: &ChunkReadyNotification) -> BatchResult<ChunkRunResult> {
        self.process_chunk(notification.chunk_id)
    }

    /// Dequeue `chunk_id`, run its step worker and record the outcome.
    pub fn process_chunk(&self, chunk_id: ChunkId) -> BatchResult<ChunkRunResult> {
        let Some(chunk) = self.engine.on_work_chunk_dequeue(chunk_id)? else {
            debug!(chunk_id = %chunk_id, "chunk not queued; notification ignored");
            return Ok(ChunkRunResult::Skipped);
        };

        let instance = self
            .engine
            .store()
            .get_instance(chunk.job_instance_id)?
            .ok_or_else(|| BatchError::not_found(format!("job instance {}", chunk.job_instance_id)))?;
        if instance.status.is_terminal() {
            return self.fail(&chunk, format!("job instance is {}", instance.status));
        }

        let definition = match self.definitions.get(&chunk.job_definition_id) {
            Ok(definition) => definition,
            Err(err) => return self.fail(&chunk, err.to_string()),
        };
        let Some(worker) = self.steps.get(&chunk.job_definition_id, &chunk.step_id) else {
            return self.fail(
                &chunk,
                format!(
                    "no step worker registered for '{}' step '{}'",
                    chunk.job_definition_id, chunk.step_id
                ),
            );
        };

        let ctx = StepContext {
            chunk: &chunk,
            instance: &instance,
            definition: &definition,
            now: self.engine.clock().now(),
        };
        let outcome = worker.run(&ctx);
        self.apply_outcome(&chunk, &definition, outcome)
            .or_else(|err| self.record_outcome_failure(&chunk, err))
    }

    /// The step ran but its outcome could not be stored. Move the chunk to
    /// ERRORED so it does not stay IN_PROGRESS; if even that fails, the
    /// original error is returned.
    fn record_outcome_failure(&self, chunk: &WorkChunk, err: BatchError) -> BatchResult<ChunkRunResult> {
        warn!(chunk_id = %chunk.id, step_id = %chunk.step_id, error = %err, "failed to record step outcome");
        let message = format!("failed to record step outcome: {err}");
        match self.engine.on_work_chunk_error(chunk.id, &message) {
            Ok(affected) if affected > 0 => Ok(ChunkRunResult::Errored),
            Ok(_) => Err(err),
            Err(second) => {
                warn!(chunk_id = %chunk.id, error = %second, "failed to mark chunk errored");
                Err(err)
            }
        }
    }

    fn apply_outcome(
        &self,
        chunk: &WorkChunk,
        definition: &JobDefinition,
        outcome: StepOutcome,
    ) -> BatchResult<ChunkRunResult> {
        match outcome {
            StepOutcome::Completed {
                outputs,
                records_processed,
            } => {
                // Children first: a COMPLETED parent implies its children exist.
                let chunks_created = self.create_next_step_chunks(chunk, definition, outputs)?;
                self.engine
                    .on_work_chunk_completion_success(chunk.id, records_processed)?;
                Ok(ChunkRunResult::Completed { chunks_created })
            }
            StepOutcome::Errored(message) => {
                warn!(chunk_id = %chunk.id, step_id = %chunk.step_id, error = %message, "step worker reported an error");
                self.engine.on_work_chunk_error(chunk.id, &message)?;
                Ok(ChunkRunResult::Errored)
            }
            StepOutcome::Failed(message) => self.fail(chunk, message),
            StepOutcome::PollAgain => {
                let now = self.engine.clock().now();
                match self.backoff.next_poll_time(now, chunk.poll_attempts) {
                    Some(at) => self.schedule_poll(chunk, at),
                    None => self.poll_attempts_exhausted(chunk),
                }
            }
            StepOutcome::PollAt(at) => {
                if self.backoff.allows_another_poll(chunk.poll_attempts) {
                    self.schedule_poll(chunk, at)
                } else {
                    self.poll_attempts_exhausted(chunk)
                }
            }
        }
    }

    fn create_next_step_chunks(
        &self,
        chunk: &WorkChunk,
        definition: &JobDefinition,
        outputs: Vec<serde_json::Value>,
    ) -> BatchResult<usize> {
        let Some(next) = definition.step_after(&chunk.step_id) else {
            if !outputs.is_empty() {
                warn!(
                    chunk_id = %chunk.id,
                    step_id = %chunk.step_id,
                    discarded = outputs.len(),
                    "last step produced outputs; discarded"
                );
            }
            return Ok(0);
        };

        let gated_execution = definition.requires_gate(&next.id)?;
        let count = outputs.len();
        for data in outputs {
            self.engine.create_chunk(CreateChunk {
                job_instance_id: chunk.job_instance_id,
                step_id: next.id.clone(),
                data: Some(data),
                gated_execution,
            })?;
        }
        Ok(count)
    }

    fn schedule_poll(&self, chunk: &WorkChunk, at: DateTime<Utc>) -> BatchResult<ChunkRunResult> {
        self.engine.on_work_chunk_poll_delay(chunk.id, at)?;
        Ok(ChunkRunResult::PollScheduled(at))
    }

    fn poll_attempts_exhausted(&self, chunk: &WorkChunk) -> BatchResult<ChunkRunResult> {
        self.fail(
            chunk,
            format!(
                "poll attempts exhausted after {} polls",
                chunk.poll_attempts
            ),
        )
    }

    fn fail(&self, chunk: &WorkChunk, message: String) -> BatchResult<ChunkRunResult> {
        warn!(chunk_id = %chunk.id, step_id = %chunk.step_id, error = %message, "work chunk failed");
        self.engine.on_work_chunk_failed(chunk.id, &message)?;
        Ok(ChunkRunResult::Failed)
    }
}

impl<S, C> ChunkWorker<S, C>
where
    S: ChunkStore + 'static,
    C: Clock + 'static,
{
    /// Spawn `config.threads` worker threads, each with its own subscription.
    ///
    /// Every thread sees every notification; the conditional dequeue decides which
    /// one runs the chunk.
    pub fn spawn<B>(self, bus: &B, config: WorkerConfig) -> ChunkWorkerPool
    where
        B: EventBus<ChunkReadyNotification>,
    {
        let worker = Arc::new(self);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));

        let workers = (0..config.threads.max(1))
            .map(|index| {
                let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
                let sub = bus.subscribe();
                let worker = worker.clone();
                let stats = stats.clone();
                let config = config.clone();
                let name = format!("{}-{}", config.name, index);

                let join = thread::Builder::new()
                    .name(name.clone())
                    .spawn(move || worker_loop(&name, &worker, sub, shutdown_rx, &config, &stats))
                    .expect("failed to spawn chunk worker thread");
                (shutdown_tx, join)
            })
            .collect();

        ChunkWorkerPool { workers, stats }
    }
}

fn worker_loop<S, C>(
    name: &str,
    worker: &ChunkWorker<S, C>,
    sub: Subscription<ChunkReadyNotification>,
    shutdown_rx: mpsc::Receiver<()>,
    config: &WorkerConfig,
    stats: &Mutex<WorkerStats>,
) where
    S: ChunkStore,
    C: Clock,
{
    info!(worker = name, "chunk worker started");

    loop {
        // Shutdown check (non-blocking)
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match sub.recv_timeout(config.recv_timeout) {
            Ok(notification) => {
                let result = worker.handle_notification(&notification);
                if let Err(err) = &result {
                    warn!(
                        worker = name,
                        chunk_id = %notification.chunk_id,
                        error = %err,
                        "chunk processing failed"
                    );
                }
                if let Ok(mut s) = stats.lock() {
                    s.record(&result);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(worker = name, "chunk worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use batchflow_core::{JobInstanceId, ManualClock, StepId, WorkChunkStatus};
    use batchflow_events::InMemoryEventBus;
    use chrono::TimeZone;
    use serde_json::json;

    use std::sync::atomic::{AtomicBool, Ordering};

    use batchflow_core::{JobInstance, NewWorkChunk};

    use crate::dispatcher::Dispatcher;
    use crate::store::{
        ChunkChanges, ChunkFilter, ChunkQuery, ChunkStats, ChunkStoreError, InMemoryChunkStore,
        InstanceUpdate, StoreOp,
    };

    type Engine = TransitionEngine<Arc<InMemoryChunkStore>, Arc<ManualClock>>;

    struct Fixture {
        engine: Arc<Engine>,
        dispatcher: Dispatcher<Arc<InMemoryChunkStore>, Arc<InMemoryEventBus<ChunkReadyNotification>>, Arc<ManualClock>>,
        definitions: Arc<JobDefinitionRegistry>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()));
        let engine = Arc::new(TransitionEngine::new(Arc::new(InMemoryChunkStore::new()), clock.clone()));
        let definitions = Arc::new(JobDefinitionRegistry::new());
        definitions.register(definition()).unwrap();
        Fixture {
            dispatcher: Dispatcher::new(engine.clone(), Arc::new(InMemoryEventBus::new())),
            engine,
            definitions,
            clock,
        }
    }

    fn definition() -> JobDefinition {
        JobDefinition::with_gated_execution("ingest", 1, &["split", "index"], true).unwrap()
    }

    fn worker(f: &Fixture, steps: StepWorkerRegistry) -> ChunkWorker<Arc<InMemoryChunkStore>, Arc<ManualClock>> {
        ChunkWorker::new(f.engine.clone(), f.definitions.clone(), Arc::new(steps))
            .with_backoff(PollBackoff::fixed(2, Duration::from_secs(60)))
    }

    /// Create an instance and dispatch its first chunk.
    fn queued_first_chunk(f: &Fixture) -> (JobInstanceId, ChunkId) {
        let (instance, chunk) = f.engine.create_job_instance(&definition(), json!({"source": "s3"})).unwrap();
        f.dispatcher.enqueue_work_chunk_for_processing(chunk, |_| {}).unwrap();
        (instance, chunk)
    }

    fn stored(f: &Fixture, id: ChunkId) -> WorkChunk {
        f.engine.store().get_chunk(id).unwrap().unwrap()
    }

    #[test]
    fn completed_chunk_fans_out_to_gated_next_step() {
        let f = fixture();
        let mut steps = StepWorkerRegistry::new();
        steps.register_fn("ingest", "split", |ctx: &StepContext<'_>| {
            assert_eq!(ctx.parameters()["source"], "s3");
            StepOutcome::emit(vec![json!({"part": 1}), json!({"part": 2})])
        });
        let worker = worker(&f, steps);
        let (instance, chunk) = queued_first_chunk(&f);

        let result = worker.process_chunk(chunk).unwrap();
        assert_eq!(result, ChunkRunResult::Completed { chunks_created: 2 });
        assert_eq!(stored(&f, chunk).status, WorkChunkStatus::Completed);

        let children = f
            .engine
            .store()
            .query_chunks(&ChunkQuery::for_instance(instance).step(StepId::from("index")))
            .unwrap();
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|c| c.status == WorkChunkStatus::GateWaiting));
        assert_eq!(children[1].data, Some(json!({"part": 2})));
    }

    #[test]
    fn duplicate_notification_is_skipped() {
        let f = fixture();
        let mut steps = StepWorkerRegistry::new();
        steps.register_fn("ingest", "split", |_: &StepContext<'_>| StepOutcome::done(1));
        let worker = worker(&f, steps);
        let (_, chunk) = queued_first_chunk(&f);

        assert!(matches!(worker.process_chunk(chunk).unwrap(), ChunkRunResult::Completed { .. }));
        assert_eq!(worker.process_chunk(chunk).unwrap(), ChunkRunResult::Skipped);
    }

    #[test]
    fn missing_step_worker_fails_the_chunk() {
        let f = fixture();
        let worker = worker(&f, StepWorkerRegistry::new());
        let (_, chunk) = queued_first_chunk(&f);

        assert_eq!(worker.process_chunk(chunk).unwrap(), ChunkRunResult::Failed);
        let failed = stored(&f, chunk);
        assert_eq!(failed.status, WorkChunkStatus::Failed);
        assert!(failed.error_message.unwrap().contains("no step worker"));
    }

    #[test]
    fn errored_outcome_marks_chunk_errored() {
        let f = fixture();
        let mut steps = StepWorkerRegistry::new();
        steps.register_fn("ingest", "split", |_: &StepContext<'_>| {
            StepOutcome::Errored("connection reset".to_string())
        });
        let worker = worker(&f, steps);
        let (_, chunk) = queued_first_chunk(&f);

        assert_eq!(worker.process_chunk(chunk).unwrap(), ChunkRunResult::Errored);
        let errored = stored(&f, chunk);
        assert_eq!(errored.status, WorkChunkStatus::Errored);
        assert_eq!(errored.error_count, 1);
    }

    #[test]
    fn polling_stops_after_max_attempts() {
        let f = fixture();
        let mut steps = StepWorkerRegistry::new();
        steps.register_fn("ingest", "split", |_: &StepContext<'_>| StepOutcome::PollAgain);
        let worker = worker(&f, steps);
        let (instance, chunk) = queued_first_chunk(&f);

        for attempt in 1..=2 {
            let expected = f.clock.now() + chrono::Duration::seconds(60);
            assert_eq!(worker.process_chunk(chunk).unwrap(), ChunkRunResult::PollScheduled(expected));
            assert_eq!(stored(&f, chunk).poll_attempts, attempt);

            f.clock.advance(chrono::Duration::seconds(61));
            assert_eq!(f.engine.update_poll_waiting_chunks_for_job_if_ready(instance).unwrap(), 1);
            f.dispatcher.enqueue_work_chunk_for_processing(chunk, |_| {}).unwrap();
        }

        assert_eq!(worker.process_chunk(chunk).unwrap(), ChunkRunResult::Failed);
        let failed = stored(&f, chunk);
        assert_eq!(failed.status, WorkChunkStatus::Failed);
        assert_eq!(failed.next_poll_time, None);
    }

    #[test]
    fn cancelled_instance_fails_its_chunks() {
        let f = fixture();
        let mut steps = StepWorkerRegistry::new();
        steps.register_fn("ingest", "split", |_: &StepContext<'_>| StepOutcome::done(1));
        let worker = worker(&f, steps);
        let (instance, chunk) = queued_first_chunk(&f);
        f.engine.cancel_job_instance(instance).unwrap();

        assert_eq!(worker.process_chunk(chunk).unwrap(), ChunkRunResult::Failed);
    }

    #[test]
    fn spawned_pool_processes_published_chunks() {
        let f = fixture();
        let mut steps = StepWorkerRegistry::new();
        steps.register_fn("ingest", "split", |_: &StepContext<'_>| StepOutcome::done(7));
        let pool = worker(&f, steps).spawn(
            f.dispatcher.bus(),
            WorkerConfig::default().with_threads(3),
        );
        assert_eq!(pool.size(), 3);

        let (_, chunk) = queued_first_chunk(&f);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while stored(&f, chunk).status != WorkChunkStatus::Completed {
            assert!(std::time::Instant::now() < deadline, "chunk never completed");
            thread::sleep(Duration::from_millis(5));
        }
        while pool.stats().notifications < 3 {
            assert!(std::time::Instant::now() < deadline, "not every worker saw the notification");
            thread::sleep(Duration::from_millis(5));
        }

        let stats = pool.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.skipped, 2);
        pool.shutdown();
        assert_eq!(stored(&f, chunk).records_processed, Some(7));
    }

    /// In-memory store whose next chunk insert fails with `Unavailable`.
    struct InsertOutage {
        inner: InMemoryChunkStore,
        fail_next_insert: AtomicBool,
    }

    impl ChunkStore for InsertOutage {
        fn insert_instance(&self, instance: JobInstance) -> Result<(), ChunkStoreError> {
            self.inner.insert_instance(instance)
        }

        fn get_instance(&self, id: JobInstanceId) -> Result<Option<JobInstance>, ChunkStoreError> {
            self.inner.get_instance(id)
        }

        fn update_instance(&self, id: JobInstanceId, update: &InstanceUpdate) -> Result<u64, ChunkStoreError> {
            self.inner.update_instance(id, update)
        }

        fn list_active_instances(&self) -> Result<Vec<JobInstance>, ChunkStoreError> {
            self.inner.list_active_instances()
        }

        fn insert_chunk(&self, chunk: NewWorkChunk) -> Result<WorkChunk, ChunkStoreError> {
            if self.fail_next_insert.swap(false, Ordering::SeqCst) {
                return Err(ChunkStoreError::Unavailable("connection dropped".to_string()));
            }
            self.inner.insert_chunk(chunk)
        }

        fn get_chunk(&self, id: ChunkId) -> Result<Option<WorkChunk>, ChunkStoreError> {
            self.inner.get_chunk(id)
        }

        fn conditional_update_status(
            &self,
            id: ChunkId,
            expected_from: WorkChunkStatus,
            to: WorkChunkStatus,
            changes: &ChunkChanges,
        ) -> Result<u64, ChunkStoreError> {
            self.inner.conditional_update_status(id, expected_from, to, changes)
        }

        fn claim_chunk(
            &self,
            id: ChunkId,
            expected_from: WorkChunkStatus,
            to: WorkChunkStatus,
            changes: &ChunkChanges,
        ) -> Result<Option<WorkChunk>, ChunkStoreError> {
            self.inner.claim_chunk(id, expected_from, to, changes)
        }

        fn transition_chunks(
            &self,
            filter: &ChunkFilter,
            to: WorkChunkStatus,
            changes: &ChunkChanges,
        ) -> Result<u64, ChunkStoreError> {
            self.inner.transition_chunks(filter, to, changes)
        }

        fn query_chunks(&self, query: &ChunkQuery) -> Result<Vec<WorkChunk>, ChunkStoreError> {
            self.inner.query_chunks(query)
        }

        fn chunk_counts(&self, job_instance_id: JobInstanceId) -> Result<ChunkStats, ChunkStoreError> {
            self.inner.chunk_counts(job_instance_id)
        }

        fn apply_atomically(&self, ops: &[StoreOp]) -> Result<Vec<u64>, ChunkStoreError> {
            self.inner.apply_atomically(ops)
        }
    }

    #[test]
    fn unrecorded_outcome_leaves_chunk_errored_not_in_progress() {
        let store = Arc::new(InsertOutage {
            inner: InMemoryChunkStore::new(),
            fail_next_insert: AtomicBool::new(false),
        });
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()));
        let engine = Arc::new(TransitionEngine::new(store.clone(), clock));
        let definitions = Arc::new(JobDefinitionRegistry::new());
        definitions.register(definition()).unwrap();
        let dispatcher = Dispatcher::new(engine.clone(), InMemoryEventBus::<ChunkReadyNotification>::new());

        let mut steps = StepWorkerRegistry::new();
        steps.register_fn("ingest", "split", |_: &StepContext<'_>| {
            StepOutcome::emit(vec![json!({"part": 1})])
        });
        let worker = ChunkWorker::new(engine.clone(), definitions, Arc::new(steps));

        let (_, chunk) = engine.create_job_instance(&definition(), json!({})).unwrap();
        dispatcher.enqueue_work_chunk_for_processing(chunk, |_| {}).unwrap();
        store.fail_next_insert.store(true, Ordering::SeqCst);

        assert_eq!(worker.process_chunk(chunk).unwrap(), ChunkRunResult::Errored);
        let errored = engine.store().get_chunk(chunk).unwrap().unwrap();
        assert_eq!(errored.status, WorkChunkStatus::Errored);
        assert_eq!(errored.error_count, 1);
        assert!(errored.error_message.unwrap().contains("failed to record step outcome"));
    }

    #[test]
    fn outcome_failure_is_returned_when_chunk_cannot_be_marked_errored() {
        let f = fixture();
        let mut steps = StepWorkerRegistry::new();
        let store = f.engine.store().clone();
        steps.register_fn("ingest", "split", move |_: &StepContext<'_>| {
            store.set_available(false);
            StepOutcome::done(1)
        });
        let worker = worker(&f, steps);
        let (_, chunk) = queued_first_chunk(&f);

        let err = worker.process_chunk(chunk).unwrap_err();
        assert!(err.is_storage_unavailable());

        f.engine.store().set_available(true);
        assert_eq!(stored(&f, chunk).status, WorkChunkStatus::InProgress);
    }
}
