//! Dispatcher: READY -> QUEUED plus exactly one "chunk ready" notification.

use std::sync::Arc;

use tracing::{debug, warn};

use batchflow_core::{ChunkId, Clock, JobInstanceId, SystemClock, WorkChunkStatus};
use batchflow_events::{ChunkReadyNotification, EventBus};

use crate::engine::TransitionEngine;
use crate::error::{BatchError, BatchResult};
use crate::store::{ChunkQuery, ChunkStore};

/// Hands READY chunks to workers through the notification bus.
pub struct Dispatcher<S, B, C = SystemClock> {
    engine: Arc<TransitionEngine<S, C>>,
    bus: B,
}

impl<S, B, C> Dispatcher<S, B, C>
where
    S: ChunkStore,
    B: EventBus<ChunkReadyNotification>,
    C: Clock,
{
    pub fn new(engine: Arc<TransitionEngine<S, C>>, bus: B) -> Self {
        Self { engine, bus }
    }

    pub fn engine(&self) -> &Arc<TransitionEngine<S, C>> {
        &self.engine
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Move `chunk_id` from READY to QUEUED and announce it.
    ///
    /// `on_result` receives the number of chunks actually dispatched: 1 after the
    /// notification was published, 0 when the chunk was not READY or the publish
    /// failed (the chunk is then returned to READY and `BatchError::Notify` is
    /// returned).
    pub fn enqueue_work_chunk_for_processing<F>(&self, chunk_id: ChunkId, on_result: F) -> BatchResult<()>
    where
        F: FnOnce(u64),
    {
        let queued = self.engine.mark_chunk_queued(chunk_id)?;
        if queued == 0 {
            on_result(0);
            return Ok(());
        }

        let chunk = self
            .engine
            .store()
            .get_chunk(chunk_id)?
            .ok_or_else(|| BatchError::not_found(format!("work chunk {chunk_id}")))?;
        let notification = ChunkReadyNotification::for_chunk(&chunk, chunk.updated_at);

        match self.bus.publish(notification) {
            Ok(()) => {
                debug!(
                    chunk_id = %chunk_id,
                    job_instance_id = %chunk.job_instance_id,
                    step_id = %chunk.step_id,
                    "work chunk dispatched"
                );
                on_result(1);
                Ok(())
            }
            Err(err) => {
                warn!(chunk_id = %chunk_id, error = ?err, "failed to publish chunk notification");
                self.engine.abort_dispatch(chunk_id)?;
                on_result(0);
                Err(BatchError::Notify(format!("{err:?}")))
            }
        }
    }

    /// Dispatch up to `limit` READY chunks of one instance. Returns how many were
    /// dispatched. A publish failure stops the batch.
    pub fn dispatch_ready_chunks(&self, job_instance_id: JobInstanceId, limit: usize) -> BatchResult<u64> {
        let ready = self.engine.store().query_chunks(
            &ChunkQuery::for_instance(job_instance_id)
                .status(WorkChunkStatus::Ready)
                .limit(limit),
        )?;

        let mut dispatched = 0;
        for chunk in ready {
            self.enqueue_work_chunk_for_processing(chunk.id, |n| dispatched += n)?;
        }
        Ok(dispatched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use batchflow_core::{JobDefinition, ManualClock, StepId};
    use batchflow_events::{InMemoryEventBus, Subscription};
    use serde_json::json;

    use crate::engine::CreateChunk;
    use crate::store::InMemoryChunkStore;

    type TestDispatcher<B> = Dispatcher<Arc<InMemoryChunkStore>, B, ManualClock>;

    fn dispatcher<B>(bus: B) -> TestDispatcher<B>
    where
        B: EventBus<ChunkReadyNotification>,
    {
        let engine = TransitionEngine::new(Arc::new(InMemoryChunkStore::new()), ManualClock::default());
        Dispatcher::new(Arc::new(engine), bus)
    }

    fn definition() -> JobDefinition {
        JobDefinition::with_gated_execution("report", 1, &["collect", "render"], true).unwrap()
    }

    struct ClosedBus;

    impl EventBus<ChunkReadyNotification> for ClosedBus {
        type Error = &'static str;

        fn publish(&self, _message: ChunkReadyNotification) -> Result<(), Self::Error> {
            Err("bus closed")
        }

        fn subscribe(&self) -> Subscription<ChunkReadyNotification> {
            let (_tx, rx) = std::sync::mpsc::channel();
            Subscription::new(rx)
        }
    }

    #[test]
    fn ready_chunk_is_queued_and_announced_once() {
        let bus = Arc::new(InMemoryEventBus::new());
        let sub = bus.subscribe();
        let dispatcher = dispatcher(bus.clone());
        let (_, chunk_id) = dispatcher
            .engine()
            .create_job_instance(&definition(), json!({}))
            .unwrap();

        let mut result = None;
        dispatcher
            .enqueue_work_chunk_for_processing(chunk_id, |n| result = Some(n))
            .unwrap();
        assert_eq!(result, Some(1));

        let notification = sub.try_recv().unwrap();
        assert_eq!(notification.chunk_id, chunk_id);
        assert_eq!(notification.step_id, StepId::from("collect"));
        let stored = dispatcher.engine().store().get_chunk(chunk_id).unwrap().unwrap();
        assert_eq!(stored.status, WorkChunkStatus::Queued);

        // Second attempt: no longer READY, nothing published.
        let mut result = None;
        dispatcher
            .enqueue_work_chunk_for_processing(chunk_id, |n| result = Some(n))
            .unwrap();
        assert_eq!(result, Some(0));
        assert_eq!(bus.published_count(), 1);
    }

    #[test]
    fn non_ready_chunks_are_skipped_silently() {
        let bus = Arc::new(InMemoryEventBus::new());
        let dispatcher = dispatcher(bus.clone());
        let (instance, _) = dispatcher
            .engine()
            .create_job_instance(&definition(), json!({}))
            .unwrap();
        let gated = dispatcher
            .engine()
            .create_chunk(CreateChunk {
                job_instance_id: instance,
                step_id: StepId::from("render"),
                data: None,
                gated_execution: true,
            })
            .unwrap();

        let mut result = None;
        dispatcher
            .enqueue_work_chunk_for_processing(gated, |n| result = Some(n))
            .unwrap();
        assert_eq!(result, Some(0));
        assert_eq!(bus.published_count(), 0);
    }

    /// Drive a fresh "render" chunk into `status` through the engine.
    fn chunk_in<B>(dispatcher: &TestDispatcher<B>, instance: JobInstanceId, status: WorkChunkStatus) -> ChunkId
    where
        B: EventBus<ChunkReadyNotification>,
    {
        let engine = dispatcher.engine();
        let id = engine
            .create_chunk(CreateChunk {
                job_instance_id: instance,
                step_id: StepId::from("render"),
                data: None,
                gated_execution: status == WorkChunkStatus::GateWaiting,
            })
            .unwrap();
        if matches!(status, WorkChunkStatus::GateWaiting | WorkChunkStatus::Ready) {
            return id;
        }

        engine.mark_chunk_queued(id).unwrap();
        if status == WorkChunkStatus::Queued {
            return id;
        }
        engine.on_work_chunk_dequeue(id).unwrap().unwrap();
        let now = engine.clock().now();
        match status {
            WorkChunkStatus::PollWaiting => {
                engine
                    .on_work_chunk_poll_delay(id, now + chrono::Duration::minutes(1))
                    .unwrap();
            }
            WorkChunkStatus::Errored => {
                engine.on_work_chunk_error(id, "timeout").unwrap();
            }
            WorkChunkStatus::Failed => {
                engine.on_work_chunk_failed(id, "fatal").unwrap();
            }
            WorkChunkStatus::Completed => {
                engine.on_work_chunk_completion_success(id, 1).unwrap();
            }
            _ => {}
        }
        id
    }

    #[test]
    fn only_ready_chunks_are_dispatched() {
        let bus = Arc::new(InMemoryEventBus::new());
        let dispatcher = dispatcher(bus.clone());
        let (instance, _) = dispatcher
            .engine()
            .create_job_instance(&definition(), json!({}))
            .unwrap();

        let statuses = [
            WorkChunkStatus::GateWaiting,
            WorkChunkStatus::Ready,
            WorkChunkStatus::Queued,
            WorkChunkStatus::InProgress,
            WorkChunkStatus::PollWaiting,
            WorkChunkStatus::Errored,
            WorkChunkStatus::Failed,
            WorkChunkStatus::Completed,
        ];
        for status in statuses {
            let id = chunk_in(&dispatcher, instance, status);
            assert_eq!(dispatcher.engine().store().get_chunk(id).unwrap().unwrap().status, status);
            let published_before = bus.published_count();

            let mut result = None;
            dispatcher
                .enqueue_work_chunk_for_processing(id, |n| result = Some(n))
                .unwrap();

            let after = dispatcher.engine().store().get_chunk(id).unwrap().unwrap();
            if status == WorkChunkStatus::Ready {
                assert_eq!(result, Some(1));
                assert_eq!(bus.published_count(), published_before + 1);
                assert_eq!(after.status, WorkChunkStatus::Queued);
            } else {
                assert_eq!(result, Some(0), "{status}");
                assert_eq!(bus.published_count(), published_before, "{status}");
                assert_eq!(after.status, status);
            }
        }
    }

    #[test]
    fn publish_failure_returns_chunk_to_ready() {
        let dispatcher = dispatcher(ClosedBus);
        let (_, chunk_id) = dispatcher
            .engine()
            .create_job_instance(&definition(), json!({}))
            .unwrap();

        let mut result = None;
        let err = dispatcher
            .enqueue_work_chunk_for_processing(chunk_id, |n| result = Some(n))
            .unwrap_err();
        assert!(matches!(err, BatchError::Notify(_)));
        assert_eq!(result, Some(0));

        let stored = dispatcher.engine().store().get_chunk(chunk_id).unwrap().unwrap();
        assert_eq!(stored.status, WorkChunkStatus::Ready);
    }

    #[test]
    fn batch_dispatch_honours_limit() {
        let bus = Arc::new(InMemoryEventBus::new());
        let dispatcher = dispatcher(bus.clone());
        let (instance, _) = dispatcher
            .engine()
            .create_job_instance(&definition(), json!({}))
            .unwrap();
        for page in 0..4 {
            dispatcher
                .engine()
                .create_chunk(CreateChunk {
                    job_instance_id: instance,
                    step_id: StepId::from("render"),
                    data: Some(json!({ "page": page })),
                    gated_execution: false,
                })
                .unwrap();
        }

        assert_eq!(dispatcher.dispatch_ready_chunks(instance, 3).unwrap(), 3);
        assert_eq!(dispatcher.dispatch_ready_chunks(instance, 3).unwrap(), 2);
        assert_eq!(dispatcher.dispatch_ready_chunks(instance, 3).unwrap(), 0);
        assert_eq!(bus.published_count(), 5);
    }
}
