//! `batchflow-core`: domain model of the batch engine.
//!
//! Work chunks, job instances, job definitions and the chunk state machine.
//! This crate is **pure domain**: it never touches storage or transports.

pub mod chunk;
pub mod definition;
pub mod error;
pub mod id;
pub mod instance;
pub mod time;
pub mod transition;

pub use chunk::{NewWorkChunk, WorkChunk, WorkChunkStatus};
pub use definition::{JobDefinition, StepDefinition};
pub use error::{DomainError, DomainResult};
pub use id::{ChunkId, JobDefinitionId, JobInstanceId, StepId};
pub use instance::{JobInstance, JobInstanceStatus};
pub use time::{Clock, ManualClock, SystemClock};
pub use transition::{ChunkEvent, Transition, TRANSITIONS};
