//! Batch job execution.
//!
//! ## Components
//!
//! - `JobRepository`: persistence for jobs and item results (in-memory impl included)
//! - `ProcessorRegistry`: per-item business logic selected by job type
//! - `BatchOrchestrator`: runs one job item by item with deadline and progress tracking
//! - `JobIntake`: hands a job to execution (`PoolIntake` feeds the worker pool)

pub mod intake;
pub mod orchestrator;
pub mod processor;
pub mod store;

pub use intake::{IntakeError, JobIntake, PoolIntake};
pub use orchestrator::{BatchOrchestrator, OrchestratorError};
pub use processor::{
    FnProcessor, ItemProcessor, ItemSource, ItemSourceError, MetadataItemSource, ProcessorRegistry,
    SkipItem,
};
pub use store::{InMemoryJobRepository, JobFilter, JobRepository, JobStats, RepositoryError};
