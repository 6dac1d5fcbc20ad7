//! Drives one batch job from `pending` to a terminal status.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use forgebatch_core::DomainError;
use forgebatch_jobs::{ItemResult, Job, JobStatus};

use super::processor::{ItemProcessor, ItemSource, MetadataItemSource, ProcessorRegistry, SkipItem};
use super::store::{JobRepository, RepositoryError};
use crate::config::OrchestratorConfig;
use crate::workers::JobRunner;

/// Job-level failure. Item failures are recorded as results instead.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("no processor registered for job type `{0}`")]
    UnknownJobType(String),
    #[error(transparent)]
    ItemResolution(#[from] super::processor::ItemSourceError),
    #[error("job timed out after {0:?}")]
    Timeout(Duration),
    #[error("job cancelled")]
    Cancelled,
    #[error("persistence error: {0}")]
    Persistence(#[from] RepositoryError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Executes jobs item by item against registered processors.
pub struct BatchOrchestrator {
    repository: Arc<dyn JobRepository>,
    processors: ProcessorRegistry,
    items: Arc<dyn ItemSource>,
    config: OrchestratorConfig,
}

impl BatchOrchestrator {
    pub fn new(
        repository: Arc<dyn JobRepository>,
        processors: ProcessorRegistry,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            repository,
            processors,
            items: Arc::new(MetadataItemSource),
            config,
        }
    }

    pub fn with_item_source(mut self, items: Arc<dyn ItemSource>) -> Self {
        self.items = items;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run `job` to completion.
    ///
    /// Returns the completed job. On any early exit the job is persisted as
    /// `failed` before the error is returned; results recorded so far are kept.
    #[instrument(
        skip(self, ctx, job),
        fields(job_id = %job.id, tenant_id = %job.tenant_id, job_type = %job.job_type)
    )]
    pub async fn run(&self, ctx: &CancellationToken, mut job: Job) -> Result<Job, OrchestratorError> {
        // Cancelled, or already picked up, while queued
        if let Ok(stored) = self.repository.get(job.tenant_id, job.id).await {
            if stored.status != JobStatus::Pending {
                debug!(status = ?stored.status, "job no longer pending, skipping");
                return Ok(stored);
            }
        }

        let Some(processor) = self.processors.get(&job.job_type) else {
            let err = OrchestratorError::UnknownJobType(job.job_type.clone());
            job.start()?;
            job.fail(err.to_string())?;
            self.repository.save(&job).await?;
            warn!("no processor for job type");
            return Err(err);
        };

        job.start()?;
        self.repository.save(&job).await?;
        info!(total_items = job.total_items, "job started");

        let timeout = self.config.job_timeout;
        let deadline = Instant::now() + timeout;

        let items = match self.items.resolve(&job).await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "item resolution failed");
                return self.finish_failed(job, e.into()).await;
            }
        };

        match self.process_items(ctx, &mut job, processor.as_ref(), &items, deadline).await {
            Ok(()) => {
                job.complete()?;
                if let Err(e) = self.repository.save(&job).await {
                    error!(error = %e, "failed to persist completed job");
                    return Err(e.into());
                }
                info!(
                    completed = job.completed_count,
                    failed = job.failed_count,
                    "job completed"
                );
                Ok(job)
            }
            Err(e) => self.finish_failed(job, e).await,
        }
    }

    async fn process_items(
        &self,
        ctx: &CancellationToken,
        job: &mut Job,
        processor: &dyn ItemProcessor,
        items: &[Value],
        deadline: Instant,
    ) -> Result<(), OrchestratorError> {
        let total = job.total_items;
        let persist_every = self.config.progress_persist_interval.max(1);

        for index in 0..total {
            if ctx.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(OrchestratorError::Timeout(self.config.job_timeout));
            }

            let result = match items.get(index) {
                Some(item) => self.process_one(ctx, job, processor, index, item, deadline).await?,
                None => ItemResult::unresolved(job.id, index),
            };

            if result.is_failure() {
                debug!(item_index = index, error = ?result.error, "item failed");
            }
            if let Err(e) = self.repository.save_result(&result).await {
                warn!(item_index = index, error = %e, "failed to persist item result");
            }
            job.record_result(result)?;

            let processed = index + 1;
            if processed % persist_every == 0 || processed == total {
                if let Err(e) = self.repository.save(job).await {
                    warn!(error = %e, progress = job.progress, "failed to persist progress");
                }
            }
        }

        Ok(())
    }

    /// Process one item within the job's deadline.
    ///
    /// `Err` aborts the whole job; processor errors become failed results.
    async fn process_one(
        &self,
        ctx: &CancellationToken,
        job: &Job,
        processor: &dyn ItemProcessor,
        index: usize,
        item: &Value,
        deadline: Instant,
    ) -> Result<ItemResult, OrchestratorError> {
        let started = Instant::now();

        let outcome = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(OrchestratorError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(OrchestratorError::Timeout(self.config.job_timeout));
            }
            outcome = processor.process(ctx, item) => outcome,
        };

        let elapsed = started.elapsed();
        Ok(match outcome {
            Ok(output) => ItemResult::success(job.id, index, item.clone(), output, elapsed),
            Err(e) => match e.downcast_ref::<SkipItem>() {
                Some(SkipItem(reason)) => ItemResult::skipped(job.id, index, item.clone(), reason.clone()),
                None => ItemResult::failure(job.id, index, item.clone(), format!("{e:#}"), elapsed),
            },
        })
    }

    async fn finish_failed(&self, mut job: Job, err: OrchestratorError) -> Result<Job, OrchestratorError> {
        job.fail(err.to_string())?;
        if let Err(e) = self.repository.save(&job).await {
            error!(error = %e, "failed to persist failed job");
            return Err(e.into());
        }
        warn!(
            error = %err,
            processed = job.processed_count(),
            total_items = job.total_items,
            "job failed"
        );
        Err(err)
    }
}

#[async_trait::async_trait]
impl JobRunner for BatchOrchestrator {
    async fn run(&self, ctx: &CancellationToken, job: Job) -> Result<Job, OrchestratorError> {
        BatchOrchestrator::run(self, ctx, job).await
    }
}
