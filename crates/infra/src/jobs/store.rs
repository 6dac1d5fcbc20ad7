//! Job and item-result storage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::RwLock;

use forgebatch_core::{JobId, TenantId, TenantScoped};
use forgebatch_jobs::{ItemResult, Job, JobStatus};

/// Job repository abstraction.
#[async_trait::async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert or replace a job.
    async fn save(&self, job: &Job) -> Result<(), RepositoryError>;

    /// Get a job by ID.
    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job, RepositoryError>;

    /// List jobs matching the filter, oldest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, RepositoryError>;

    /// Upsert one item result, keyed by `(job_id, item_index)`.
    async fn save_result(&self, result: &ItemResult) -> Result<(), RepositoryError>;

    /// Results for a job in item order.
    async fn list_results(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
    ) -> Result<Vec<ItemResult>, RepositoryError>;

    /// Get job statistics.
    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, RepositoryError>;
}

/// Repository error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("tenant isolation violation")]
    TenantIsolation,
    #[error("storage error: {0}")]
    Storage(String),
}

/// Query over stored jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub tenant_id: Option<TenantId>,
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, job: &Job) -> bool {
        self.tenant_id.is_none_or(|t| job.belongs_to(t))
            && self.status.is_none_or(|s| s == job.status)
            && self.job_type.as_deref().is_none_or(|t| t == job.job_type)
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub paused: usize,
    pub items_completed: usize,
    pub items_failed: usize,
}

/// In-memory job repository for tests/dev.
///
/// Results live in their own table; the copy embedded in a saved `Job` is
/// whatever the caller last saved.
#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    jobs: RwLock<HashMap<JobId, Job>>,
    results: RwLock<HashMap<JobId, Vec<ItemResult>>>,
    writes: AtomicU64,
    fail_writes: AtomicBool,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `save` calls.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every subsequent write fail with a storage error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), RepositoryError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RepositoryError::Storage("writes disabled".to_string()));
        }
        Ok(())
    }
}

fn ensure_tenant<T: TenantScoped>(record: &T, tenant_id: TenantId) -> Result<(), RepositoryError> {
    if record.belongs_to(tenant_id) {
        Ok(())
    } else {
        Err(RepositoryError::TenantIsolation)
    }
}

#[async_trait::async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn save(&self, job: &Job) -> Result<(), RepositoryError> {
        self.check_writable()?;
        let mut jobs = self.jobs.write().await;
        if let Some(existing) = jobs.get(&job.id) {
            ensure_tenant(existing, job.tenant_id)?;
        }
        jobs.insert(job.id, job.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job, RepositoryError> {
        let jobs = self.jobs.read().await;
        let job = jobs.get(&job_id).ok_or(RepositoryError::NotFound(job_id))?;
        ensure_tenant(job, tenant_id)?;
        Ok(job.clone())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, RepositoryError> {
        let jobs = self.jobs.read().await;
        let mut result: Vec<_> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();

        result.sort_by_key(|j| (j.created_at, j.id));
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn save_result(&self, result: &ItemResult) -> Result<(), RepositoryError> {
        self.check_writable()?;
        let mut results = self.results.write().await;
        let rows = results.entry(result.job_id).or_default();

        match rows.binary_search_by_key(&result.item_index, |r| r.item_index) {
            Ok(pos) => rows[pos].overwrite_with(result.clone()),
            Err(pos) => rows.insert(pos, result.clone()),
        }
        Ok(())
    }

    async fn list_results(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
    ) -> Result<Vec<ItemResult>, RepositoryError> {
        // tenant check goes through the owning job
        self.get(tenant_id, job_id).await?;
        Ok(self
            .results
            .read()
            .await
            .get(&job_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, RepositoryError> {
        let jobs = self.jobs.read().await;
        let mut stats = JobStats::default();

        for job in jobs.values().filter(|j| j.belongs_to(tenant_id)) {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
                JobStatus::Paused => stats.paused += 1,
            }
            stats.items_completed += job.completed_count;
            stats.items_failed += job.failed_count;
        }

        Ok(stats)
    }
}
