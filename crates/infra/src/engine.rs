//! `BatchEngine`: one handle over the pool, orchestrator, schedulers and retry engine.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use forgebatch_core::{DomainError, JobId, RecurringId, TenantId};
use forgebatch_jobs::{ItemResult, Job, RecurringEntry, ScheduledEntry};

use crate::config::{ConfigError, EngineConfig};
use crate::jobs::{
    BatchOrchestrator, IntakeError, ItemSource, JobIntake, JobRepository, PoolIntake,
    ProcessorRegistry, RepositoryError,
};
use crate::retry::{RetryEngine, RetryError, RetryOutcome, RetryStats, Task, TaskQueue};
use crate::scheduler::{
    OneShotScheduler, RecurringEntryDraft, RecurringScheduler, RecurringStats, SchedulerError,
    SchedulerStats,
};
use crate::workers::{PoolError, PoolStats, WorkerPool};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine has been shut down")]
    ShutDown,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Intake(#[from] IntakeError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Retry(#[from] RetryError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Collaborators the engine is wired to.
pub struct EngineDeps {
    pub repository: Arc<dyn JobRepository>,
    pub processors: ProcessorRegistry,
    pub task_queue: Arc<dyn TaskQueue>,
    /// Defaults to reading the `items` metadata array.
    pub item_source: Option<Arc<dyn ItemSource>>,
}

impl EngineDeps {
    pub fn new(
        repository: Arc<dyn JobRepository>,
        processors: ProcessorRegistry,
        task_queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            repository,
            processors,
            task_queue,
            item_source: None,
        }
    }

    pub fn with_item_source(mut self, source: Arc<dyn ItemSource>) -> Self {
        self.item_source = Some(source);
        self
    }
}

/// Point-in-time view of every component.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub pool: PoolStats,
    pub retry: RetryStats,
    pub scheduled: SchedulerStats,
    pub recurring: RecurringStats,
}

pub struct BatchEngine {
    config: EngineConfig,
    repository: Arc<dyn JobRepository>,
    pool: Arc<WorkerPool>,
    intake: Arc<dyn JobIntake>,
    one_shot: Arc<OneShotScheduler>,
    recurring: Arc<RecurringScheduler>,
    retry: Arc<RetryEngine>,
    root: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl BatchEngine {
    pub fn new(config: EngineConfig, deps: EngineDeps) -> Result<Self, EngineError> {
        config.validate()?;

        let mut orchestrator = BatchOrchestrator::new(
            Arc::clone(&deps.repository),
            deps.processors,
            config.orchestrator.clone(),
        );
        if let Some(source) = deps.item_source {
            orchestrator = orchestrator.with_item_source(source);
        }

        let root = CancellationToken::new();
        let pool = Arc::new(WorkerPool::new(config.pool.workers, Arc::new(orchestrator)));
        let intake: Arc<dyn JobIntake> = Arc::new(PoolIntake::new(
            Arc::clone(&deps.repository),
            Arc::clone(&pool),
            root.clone(),
        ));
        let one_shot = Arc::new(OneShotScheduler::new(
            Arc::clone(&deps.repository),
            Arc::clone(&intake),
            config.scheduler.clone(),
        ));
        let recurring = Arc::new(RecurringScheduler::new(
            Arc::clone(&deps.repository),
            Arc::clone(&intake),
            config.scheduler.clone(),
        ));
        let retry = Arc::new(RetryEngine::new(config.retry.clone(), deps.task_queue));

        Ok(Self {
            config,
            repository: deps.repository,
            pool,
            intake,
            one_shot,
            recurring,
            retry,
            root,
            loops: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start the pool and both scheduler loops.
    pub async fn start(&self) -> Result<(), EngineError> {
        if self.root.is_cancelled() {
            return Err(EngineError::ShutDown);
        }
        self.pool.start(&self.root).await?;

        let one_shot = Arc::clone(&self.one_shot);
        let one_shot_ctx = self.root.child_token();
        let recurring = Arc::clone(&self.recurring);
        let recurring_ctx = self.root.child_token();

        let mut loops = self.loops.lock().await;
        loops.push(tokio::spawn(async move { one_shot.run(one_shot_ctx).await }));
        loops.push(tokio::spawn(async move { recurring.run(recurring_ctx).await }));

        info!(workers = self.config.pool.workers, "batch engine started");
        Ok(())
    }

    /// Persist and queue a job for immediate execution.
    pub async fn submit(&self, job: Job) -> Result<Job, EngineError> {
        if self.root.is_cancelled() {
            return Err(EngineError::ShutDown);
        }
        Ok(self.intake.submit(job).await?)
    }

    /// Resubmit a failed job (`failed -> pending`, bumping `retry_count`).
    pub async fn retry_job(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job, EngineError> {
        let mut job = self.repository.get(tenant_id, job_id).await?;
        job.reset_for_retry()?;
        info!(%job_id, retry_count = job.retry_count, "resubmitting failed job");
        self.submit(job).await
    }

    pub async fn schedule(&self, job: Job, execute_at: DateTime<Utc>) -> Result<ScheduledEntry, EngineError> {
        Ok(self.one_shot.schedule(job, execute_at).await?)
    }

    pub async fn cancel_scheduled(&self, tenant_id: TenantId, job_id: JobId) -> Result<ScheduledEntry, EngineError> {
        Ok(self.one_shot.cancel(tenant_id, job_id).await?)
    }

    pub async fn register_recurring(&self, draft: RecurringEntryDraft) -> Result<RecurringEntry, EngineError> {
        Ok(self.recurring.register(draft).await?)
    }

    pub async fn set_recurring_active(&self, id: RecurringId, active: bool) -> Result<RecurringEntry, EngineError> {
        Ok(self.recurring.set_active(id, active).await?)
    }

    pub async fn remove_recurring(&self, id: RecurringId) -> Result<RecurringEntry, EngineError> {
        Ok(self.recurring.remove(id).await?)
    }

    /// Hand a failed task to the retry engine under the engine's lifetime.
    pub async fn retry_task(&self, task: Task, error: &str) -> Result<RetryOutcome, EngineError> {
        Ok(self.retry.retry(&self.root, task, error).await?)
    }

    pub async fn job(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job, EngineError> {
        Ok(self.repository.get(tenant_id, job_id).await?)
    }

    pub async fn results(&self, tenant_id: TenantId, job_id: JobId) -> Result<Vec<ItemResult>, EngineError> {
        Ok(self.repository.list_results(tenant_id, job_id).await?)
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn one_shot(&self) -> &OneShotScheduler {
        &self.one_shot
    }

    pub fn recurring(&self) -> &RecurringScheduler {
        &self.recurring
    }

    pub fn retry_engine(&self) -> &RetryEngine {
        &self.retry
    }

    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            pool: self.pool.stats().await,
            retry: self.retry.stats().await,
            scheduled: self.one_shot.stats().await,
            recurring: self.recurring.stats().await,
        }
    }

    /// Cancel everything and wait for loops, workers and retry timers to exit.
    pub async fn shutdown(&self) {
        self.root.cancel();

        let loops: Vec<_> = self.loops.lock().await.drain(..).collect();
        for handle in loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "scheduler loop ended abnormally");
            }
        }

        match self.pool.stop().await {
            Ok(()) | Err(PoolError::NotStarted) => {}
            Err(e) => warn!(error = %e, "failed to stop worker pool"),
        }
        self.retry.shutdown().await;
        info!("batch engine stopped");
    }
}
