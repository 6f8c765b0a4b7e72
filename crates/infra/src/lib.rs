//! Batch infrastructure: chunk storage, the transition engine, dispatch,
//! maintenance and chunk workers.

pub mod backoff;
pub mod config;
pub mod definitions;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod event_bus;
pub mod maintenance;
pub mod store;
pub mod workers;

pub use backoff::{BackoffStrategy, PollBackoff};
pub use config::{BatchConfig, ConfigError, MaintenanceConfig, WorkerConfig};
pub use definitions::JobDefinitionRegistry;
pub use dispatcher::Dispatcher;
pub use engine::{CreateChunk, GateAdvance, TransitionEngine};
pub use error::{BatchError, BatchResult};
pub use maintenance::{MaintenanceHandle, MaintenancePassReport, MaintenanceRunner, MaintenanceStats};
pub use store::{ChunkStore, ChunkStoreError, InMemoryChunkStore, PostgresChunkStore};
pub use workers::{ChunkRunResult, ChunkWorker, ChunkWorkerPool, StepContext, StepOutcome, StepWorker, StepWorkerRegistry};
