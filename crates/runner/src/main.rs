//! Runs a demo two-step gated job end to end.
//!
//! Storage is in-memory unless `DATABASE_URL` is set. With the `redis` feature
//! and `REDIS_URL` set, notifications go through Redis pub/sub.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use serde_json::json;
use tracing::{info, warn};

use batchflow_core::{JobDefinition, JobInstanceStatus};
use batchflow_events::{ChunkReadyNotification, EventBus, InMemoryEventBus};
use batchflow_infra::{
    BatchConfig, ChunkStore, ChunkWorker, Dispatcher, InMemoryChunkStore, JobDefinitionRegistry,
    MaintenanceRunner, PostgresChunkStore, StepContext, StepOutcome, StepWorkerRegistry,
    TransitionEngine,
};

const DEMO_JOB: &str = "demo-word-count";
const RUN_TIMEOUT: Duration = Duration::from_secs(60);

fn main() -> anyhow::Result<()> {
    batchflow_observability::tracing::init(batchflow_observability::LogFormat::from_env_or(
        batchflow_observability::LogFormat::Json,
    ));

    let config = BatchConfig::from_env().context("invalid batch configuration")?;
    info!(
        interval_ms = config.maintenance.interval.as_millis() as u64,
        worker_threads = config.worker.threads,
        postgres = config.database_url.is_some(),
        "batchflow runner starting"
    );

    match config.database_url.clone() {
        Some(url) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to build tokio runtime")?;
            let pool = runtime
                .block_on(sqlx::postgres::PgPoolOptions::new().max_connections(8).connect(&url))
                .context("failed to connect to postgres")?;
            let store = PostgresChunkStore::new(pool, runtime.handle().clone());
            runtime
                .block_on(store.ensure_schema())
                .context("failed to create batch schema")?;
            with_bus(store, &config)
        }
        None => with_bus(InMemoryChunkStore::new(), &config),
    }
}

#[cfg(feature = "redis")]
fn with_bus<S: ChunkStore + 'static>(store: S, config: &BatchConfig) -> anyhow::Result<()> {
    match &config.redis_url {
        Some(url) => {
            let bus = batchflow_infra::event_bus::RedisPubSubNotifier::new(url, "batchflow:chunks")
                .context("failed to open redis client")?;
            run_demo(store, Arc::new(bus), config)
        }
        None => run_demo(store, Arc::new(InMemoryEventBus::new()), config),
    }
}

#[cfg(not(feature = "redis"))]
fn with_bus<S: ChunkStore + 'static>(store: S, config: &BatchConfig) -> anyhow::Result<()> {
    if config.redis_url.is_some() {
        warn!("REDIS_URL is set but the runner was built without the `redis` feature");
    }
    run_demo(store, Arc::new(InMemoryEventBus::new()), config)
}

fn demo_definition() -> anyhow::Result<JobDefinition> {
    Ok(JobDefinition::with_gated_execution(
        DEMO_JOB,
        1,
        &["split", "count"],
        true,
    )?)
}

fn demo_steps() -> StepWorkerRegistry {
    let mut steps = StepWorkerRegistry::new();
    steps
        .register_fn(DEMO_JOB, "split", |ctx: &StepContext<'_>| {
            let lines: Vec<_> = ctx.parameters()["text"]
                .as_str()
                .unwrap_or_default()
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(|l| json!({ "line": l }))
                .collect();
            StepOutcome::emit(lines)
        })
        .register_fn(DEMO_JOB, "count", |ctx: &StepContext<'_>| {
            let words = ctx
                .data()
                .and_then(|d| d["line"].as_str())
                .map(|l| l.split_whitespace().count())
                .unwrap_or(0);
            StepOutcome::done(words as u64)
        });
    steps
}

fn run_demo<S, B>(store: S, bus: Arc<B>, config: &BatchConfig) -> anyhow::Result<()>
where
    S: ChunkStore + 'static,
    B: EventBus<ChunkReadyNotification> + 'static,
{
    let definition = demo_definition()?;
    let definitions = Arc::new(JobDefinitionRegistry::new());
    definitions.register(definition.clone())?;

    let engine = Arc::new(TransitionEngine::with_system_clock(store));
    let dispatcher = Arc::new(Dispatcher::new(engine.clone(), bus.clone()));

    let workers = ChunkWorker::new(engine.clone(), definitions.clone(), Arc::new(demo_steps()))
        .with_backoff(config.poll_backoff.clone())
        .spawn(&bus, config.worker.clone());
    let maintenance =
        MaintenanceRunner::new(dispatcher, definitions).spawn(config.maintenance.clone());

    let (instance, _) = engine.create_job_instance(
        &definition,
        json!({ "text": "the quick brown fox\njumps over\n\nthe lazy dog" }),
    )?;
    info!(job_instance_id = %instance, "demo job submitted");
    maintenance.trigger();

    let started = Instant::now();
    let outcome = loop {
        let current = engine
            .store()
            .get_instance(instance)?
            .context("demo job instance disappeared")?;
        if current.status.is_terminal() {
            break current;
        }
        if started.elapsed() > RUN_TIMEOUT {
            warn!(job_instance_id = %instance, status = %current.status, "demo job timed out");
            maintenance.shutdown();
            workers.shutdown();
            bail!("demo job did not finish within {RUN_TIMEOUT:?}");
        }
        thread::sleep(Duration::from_millis(50));
    };

    let counts = engine.store().chunk_counts(instance)?;
    let words: u64 = engine
        .store()
        .query_chunks(&batchflow_infra::store::ChunkQuery::for_instance(instance))?
        .iter()
        .filter(|c| c.step_id.as_str() == "count")
        .filter_map(|c| c.records_processed)
        .sum();

    info!(
        job_instance_id = %instance,
        status = %outcome.status,
        chunks = counts.total(),
        completed = counts.completed,
        words,
        stats = %serde_json::to_string(&counts).unwrap_or_default(),
        "demo job finished"
    );
    info!(maintenance = ?maintenance.stats(), workers = ?workers.stats(), "runner statistics");

    maintenance.shutdown();
    workers.shutdown();

    if outcome.status != JobInstanceStatus::Completed {
        bail!(
            "demo job ended {}: {}",
            outcome.status,
            outcome.error_message.unwrap_or_default()
        );
    }
    Ok(())
}
