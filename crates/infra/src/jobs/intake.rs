//! Entry point through which scheduled jobs reach execution.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use forgebatch_jobs::Job;

use super::store::{JobRepository, RepositoryError};
use crate::workers::{PoolError, WorkerPool};

#[derive(Debug, Clone, thiserror::Error)]
pub enum IntakeError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Accepts a job for execution.
#[async_trait::async_trait]
pub trait JobIntake: Send + Sync {
    /// Persist and dispatch `job`, returning it as accepted.
    async fn submit(&self, job: Job) -> Result<Job, IntakeError>;
}

/// Saves the job, then queues it on the worker pool.
///
/// A job rejected by the pool stays persisted as `pending`.
pub struct PoolIntake {
    repository: Arc<dyn JobRepository>,
    pool: Arc<WorkerPool>,
    ctx: CancellationToken,
}

impl PoolIntake {
    pub fn new(repository: Arc<dyn JobRepository>, pool: Arc<WorkerPool>, ctx: CancellationToken) -> Self {
        Self { repository, pool, ctx }
    }
}

#[async_trait::async_trait]
impl JobIntake for PoolIntake {
    async fn submit(&self, job: Job) -> Result<Job, IntakeError> {
        self.repository.save(&job).await?;
        self.pool.submit(&self.ctx, job.clone()).await?;
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::OrchestratorError;
    use crate::jobs::store::InMemoryJobRepository;
    use crate::workers::JobRunner;
    use forgebatch_core::{TenantId, UserId};
    use forgebatch_jobs::JobStatus;

    struct Noop;

    #[async_trait::async_trait]
    impl JobRunner for Noop {
        async fn run(&self, _ctx: &CancellationToken, job: Job) -> Result<Job, OrchestratorError> {
            Ok(job)
        }
    }

    #[tokio::test]
    async fn saves_before_dispatch() {
        let repo = Arc::new(InMemoryJobRepository::new());
        let pool = Arc::new(WorkerPool::new(1, Arc::new(Noop)));
        let ctx = CancellationToken::new();
        let intake = PoolIntake::new(repo.clone(), pool.clone(), ctx.clone());
        let job = Job::new(TenantId::new(), "a", 0, UserId::new());

        // pool not started: rejected but persisted
        let err = intake.submit(job.clone()).await.unwrap_err();
        assert!(matches!(err, IntakeError::Pool(PoolError::NotStarted)));
        let stored = repo.get(job.tenant_id, job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Pending);

        pool.start(&ctx).await.unwrap();
        let accepted = intake.submit(job.clone()).await.unwrap();
        assert_eq!(accepted.id, job.id);
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn repository_failure_skips_dispatch() {
        let repo = Arc::new(InMemoryJobRepository::new());
        repo.set_fail_writes(true);
        let pool = Arc::new(WorkerPool::new(1, Arc::new(Noop)));
        let ctx = CancellationToken::new();
        pool.start(&ctx).await.unwrap();
        let intake = PoolIntake::new(repo, pool.clone(), ctx);

        let err = intake
            .submit(Job::new(TenantId::new(), "a", 0, UserId::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::Repository(_)));
        assert_eq!(pool.stats().await.queued, 0);
        pool.stop().await.unwrap();
    }
}
