//! Storage adapter for job instances and work chunks.
//!
//! - `r#trait`: the `ChunkStore` contract (conditional writes, atomic batches)
//! - `in_memory`: single-lock implementation for tests/dev
//! - `postgres`: sqlx implementation with conditional `UPDATE ... WHERE status = $n`

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryChunkStore;
pub use postgres::PostgresChunkStore;
pub use r#trait::{
    ChunkChanges, ChunkFilter, ChunkQuery, ChunkStats, ChunkStore, ChunkStoreError,
    InstanceChanges, InstanceUpdate, StoreOp,
};
