//! Batch Engine - size/time bounded work accumulation
//!
//! Accepts individual work items without blocking the caller and hands them
//! to a processing function in groups:
//! - A batch is flushed when it reaches `max_batch_size`
//! - Or when `flush_timeout` elapses since the previous flush
//! - Per-item results go back over an optional, never-blocking result channel

pub mod engine;
pub mod error;

pub use engine::{
    BatchConfig, BatchEngine, BatchItem, BatchProcessor, BatchResult, BatchStats, ItemOutcome,
};
pub use error::{BatchError, EngineResult};

/// Default maximum items per batch
pub const MAX_BATCH_SIZE: usize = 64;

/// Default idle flush interval in milliseconds
pub const FLUSH_TIMEOUT_MS: u64 = 100;

/// Default submission queue capacity
pub const QUEUE_CAPACITY: usize = 1024;
