//! Background executors.

pub mod pool;

pub use pool::{JobRunner, PoolError, PoolStats, WorkerPool};
