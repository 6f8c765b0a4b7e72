//! Background workers.

pub mod chunk_worker;
pub mod step;

pub use chunk_worker::{ChunkRunResult, ChunkWorker, ChunkWorkerPool, WorkerStats};
pub use step::{StepContext, StepOutcome, StepWorker, StepWorkerRegistry};
