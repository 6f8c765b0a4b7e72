//! Maintenance runner.
//!
//! A periodic pass over every active job instance:
//!
//! 1. expire poll deadlines (POLL_WAITING -> READY),
//! 2. fail the instance if any chunk FAILED (fail-fast),
//! 3. mark the instance IN_PROGRESS once work has started,
//! 4. advance the gate when the current gated step is fully COMPLETED, or mark
//!    the instance COMPLETED when nothing is left,
//! 5. dispatch READY chunks.
//!
//! Each instance is handled independently: an error on one is logged and counted,
//! and the pass moves on. Only a storage outage ends the pass early; the next
//! tick retries.

use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use batchflow_core::{
    Clock, JobDefinition, JobInstance, JobInstanceStatus, StepId, SystemClock, WorkChunkStatus,
};
use batchflow_events::{ChunkReadyNotification, EventBus};

use crate::config::MaintenanceConfig;
use crate::definitions::JobDefinitionRegistry;
use crate::dispatcher::Dispatcher;
use crate::error::BatchResult;
use crate::store::{ChunkQuery, ChunkStats, ChunkStore};

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenancePassReport {
    pub instances_visited: usize,
    pub polls_expired: u64,
    pub gates_advanced: usize,
    /// Chunks released to READY by gate advances
    pub chunks_released: u64,
    pub chunks_dispatched: u64,
    pub instances_started: usize,
    pub instances_completed: usize,
    pub instances_failed: usize,
    /// Instances whose maintenance raised an error (skipped this pass)
    pub instances_errored: usize,
}

/// Runner statistics, readable through [`MaintenanceHandle::stats`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceStats {
    pub passes_completed: u64,
    pub passes_aborted: u64,
    pub chunks_dispatched: u64,
    pub last_report: Option<MaintenancePassReport>,
    pub uptime_secs: u64,
}

/// Handle to a running maintenance thread (shutdown + trigger hook).
#[derive(Debug)]
pub struct MaintenanceHandle {
    shutdown: mpsc::Sender<()>,
    trigger: mpsc::SyncSender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<MaintenanceStats>>,
}

impl MaintenanceHandle {
    /// Ask for a pass as soon as possible. Triggers are coalesced.
    pub fn trigger(&self) {
        let _ = self.trigger.try_send(());
    }

    /// Gracefully stop the runner thread.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> MaintenanceStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Drives chunks forward for every active job instance.
pub struct MaintenanceRunner<S, B, C = SystemClock> {
    dispatcher: Arc<Dispatcher<S, B, C>>,
    definitions: Arc<JobDefinitionRegistry>,
    dispatch_batch_size: usize,
}

impl<S, B, C> MaintenanceRunner<S, B, C>
where
    S: ChunkStore,
    B: EventBus<ChunkReadyNotification>,
    C: Clock,
{
    pub fn new(
        dispatcher: Arc<Dispatcher<S, B, C>>,
        definitions: Arc<JobDefinitionRegistry>,
    ) -> Self {
        Self {
            dispatcher,
            definitions,
            dispatch_batch_size: MaintenanceConfig::default().dispatch_batch_size,
        }
    }

    pub fn with_dispatch_batch_size(mut self, size: usize) -> Self {
        self.dispatch_batch_size = size.max(1);
        self
    }

    /// Run one pass over all active instances.
    ///
    /// Returns `Err` only for a storage outage; every other per-instance failure
    /// is counted in `instances_errored`.
    pub fn run_maintenance_pass(&self) -> BatchResult<MaintenancePassReport> {
        let store = self.dispatcher.engine().store();
        let instances = store.list_active_instances()?;

        let mut report = MaintenancePassReport::default();
        for instance in instances {
            report.instances_visited += 1;
            match self.maintain_instance(&instance, &mut report) {
                Ok(()) => {}
                Err(err) if err.is_storage_unavailable() => {
                    error!(
                        job_instance_id = %instance.id,
                        error = %err,
                        "storage unavailable; maintenance pass aborted"
                    );
                    return Err(err);
                }
                Err(err) => {
                    report.instances_errored += 1;
                    warn!(
                        job_instance_id = %instance.id,
                        job_definition_id = %instance.job_definition_id,
                        error = %err,
                        "maintenance failed for job instance"
                    );
                }
            }
        }

        debug!(?report, "maintenance pass finished");
        Ok(report)
    }

    fn maintain_instance(
        &self,
        instance: &JobInstance,
        report: &mut MaintenancePassReport,
    ) -> BatchResult<()> {
        let definition = self.definitions.get(&instance.job_definition_id)?;
        let engine = self.dispatcher.engine();
        let id = instance.id;

        report.polls_expired += engine.update_poll_waiting_chunks_for_job_if_ready(id)?;

        let stats = engine.store().chunk_counts(id)?;
        if stats.failed > 0 {
            let message = self.failure_message(instance)?;
            if engine.fail_job_instance(id, message)? > 0 {
                report.instances_failed += 1;
            }
            return Ok(());
        }

        if instance.status == JobInstanceStatus::Queued
            && stats.any_started()
            && engine.start_job_instance(id)? > 0
        {
            report.instances_started += 1;
        }

        if self.is_finished(instance, &definition, &stats)? {
            if engine.complete_job_instance(id)? > 0 {
                report.instances_completed += 1;
            }
            return Ok(());
        }

        if definition.is_gated() {
            let current = current_gated_step(instance, &definition);
            if let Some(next) = definition.step_after(&current) {
                if self.step_completed(instance, &current)? {
                    let advance =
                        engine.advance_job_step_and_update_chunk_status(id, &definition, &next.id)?;
                    if advance.moved {
                        report.gates_advanced += 1;
                        report.chunks_released += advance.total();
                    }
                }
            }
        }

        report.chunks_dispatched += self
            .dispatcher
            .dispatch_ready_chunks(id, self.dispatch_batch_size)?;
        Ok(())
    }

    /// All chunks COMPLETED and no later step can still receive work.
    fn is_finished(
        &self,
        instance: &JobInstance,
        definition: &JobDefinition,
        stats: &ChunkStats,
    ) -> BatchResult<bool> {
        if stats.total() == 0 || !stats.all_completed() {
            return Ok(false);
        }
        if !definition.is_gated() {
            // Chunks of the next step are created before their parent completes.
            return Ok(true);
        }
        let current = current_gated_step(instance, definition);
        Ok(definition.is_last_step(&current))
    }

    fn step_completed(&self, instance: &JobInstance, step_id: &StepId) -> BatchResult<bool> {
        let chunks = self
            .dispatcher
            .engine()
            .store()
            .query_chunks(&ChunkQuery::for_instance(instance.id).step(step_id.clone()))?;
        Ok(chunks.iter().all(|c| c.status == WorkChunkStatus::Completed))
    }

    fn failure_message(&self, instance: &JobInstance) -> BatchResult<String> {
        let failed = self.dispatcher.engine().store().query_chunks(
            &ChunkQuery::for_instance(instance.id)
                .status(WorkChunkStatus::Failed)
                .limit(1),
        )?;
        Ok(match failed.first() {
            Some(chunk) => format!(
                "chunk {} of step '{}' failed: {}",
                chunk.id,
                chunk.step_id,
                chunk.error_message.as_deref().unwrap_or("no error message")
            ),
            None => "a work chunk failed".to_string(),
        })
    }
}

fn current_gated_step(instance: &JobInstance, definition: &JobDefinition) -> StepId {
    instance
        .current_gated_step_id
        .clone()
        .unwrap_or_else(|| definition.first_step().id.clone())
}

impl<S, B, C> MaintenanceRunner<S, B, C>
where
    S: ChunkStore + 'static,
    B: EventBus<ChunkReadyNotification> + 'static,
    C: Clock + 'static,
{
    /// Spawn the runner on a background thread.
    ///
    /// - Schedule: a pass every `config.interval` (and once on startup)
    /// - Event-trigger: `handle.trigger()` requests an immediate pass
    /// - Failures: logged; the next tick retries
    pub fn spawn(self, config: MaintenanceConfig) -> MaintenanceHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let (trigger_tx, trigger_rx) = mpsc::sync_channel::<()>(1);
        let stats = Arc::new(Mutex::new(MaintenanceStats::default()));
        let stats_clone = stats.clone();

        let runner = self.with_dispatch_batch_size(config.dispatch_batch_size);
        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || maintenance_loop(runner, config, shutdown_rx, trigger_rx, stats_clone))
            .expect("failed to spawn maintenance runner thread");

        MaintenanceHandle {
            shutdown: shutdown_tx,
            trigger: trigger_tx,
            join: Some(join),
            stats,
        }
    }
}

fn maintenance_loop<S, B, C>(
    runner: MaintenanceRunner<S, B, C>,
    config: MaintenanceConfig,
    shutdown_rx: mpsc::Receiver<()>,
    trigger_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<MaintenanceStats>>,
) where
    S: ChunkStore,
    B: EventBus<ChunkReadyNotification>,
    C: Clock,
{
    info!(runner = %config.name, interval_ms = config.interval.as_millis() as u64, "maintenance runner started");
    let start_time = Instant::now();

    let mut next_tick = Instant::now() + config.interval;
    let mut pending = true; // run once on startup

    loop {
        // Shutdown has priority.
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        let now = Instant::now();
        if now >= next_tick {
            pending = true;
            while next_tick <= now {
                next_tick += config.interval.max(Duration::from_millis(1));
            }
        }

        while trigger_rx.try_recv().is_ok() {
            pending = true;
        }

        if !pending {
            let sleep_for = next_tick
                .saturating_duration_since(Instant::now())
                .min(Duration::from_millis(50));
            thread::sleep(sleep_for);
            continue;
        }
        pending = false;

        let result = runner.run_maintenance_pass();

        if let Ok(mut s) = stats.lock() {
            s.uptime_secs = start_time.elapsed().as_secs();
            match result {
                Ok(report) => {
                    s.passes_completed += 1;
                    s.chunks_dispatched += report.chunks_dispatched;
                    s.last_report = Some(report);
                }
                Err(_) => s.passes_aborted += 1,
            }
        }
    }

    info!(runner = %config.name, "maintenance runner stopped");
}
