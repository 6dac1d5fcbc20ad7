//! Job execution and recovery engine.
//!
//! - `workers`: fixed-size pool draining a bounded job queue
//! - `jobs`: batch orchestration, processors, repository and intake
//! - `scheduler`: one-shot and recurring promotion loops
//! - `retry`: failure classification, backoff and delayed re-enqueue
//! - `engine`: `BatchEngine`, wiring all of the above from one `EngineConfig`

pub mod config;
pub mod engine;
pub mod jobs;
pub mod retry;
pub mod scheduler;
pub mod workers;

pub use config::{ConfigError, EngineConfig, OrchestratorConfig, PoolConfig, SchedulerConfig};
pub use engine::{BatchEngine, EngineDeps, EngineError, EngineStats};
