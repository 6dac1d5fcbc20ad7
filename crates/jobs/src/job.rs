//! Batch jobs and their lifecycle.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use forgebatch_core::{DomainError, DomainResult, JobId, TenantId, TenantScoped, UserId};

use crate::result::ItemResult;

/// Free-form job metadata. Key order carries no meaning.
pub type Metadata = HashMap<String, serde_json::Value>;

/// Metadata key holding the job's input items as a JSON array.
pub const ITEMS_METADATA_KEY: &str = "items";

/// Job execution status.
///
/// ```text
/// pending ──> processing ──> completed | failed | cancelled
///    │            │  ^
///    │            v  │
///    │          paused        (administrative only)
///    └──> cancelled
/// failed ──> pending           (retry, bumps retry_count)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Processing, Paused)
                | (Paused, Processing)
                | (Paused, Cancelled)
                | (Failed, Pending)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Paused => "paused",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of batch work containing many items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    /// Selects the item processor.
    pub job_type: String,
    pub status: JobStatus,
    pub total_items: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    /// Percentage in `[0, 100]`, derived from the counters.
    pub progress: f64,
    /// Higher is more urgent. Informational: the worker pool does not reorder by it.
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_updated_at: DateTime<Utc>,
    pub created_by: UserId,
    pub metadata: Metadata,
    /// Sorted by `item_index`, one entry per index.
    pub results: Vec<ItemResult>,
    /// Last terminal error.
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl Job {
    pub fn new(
        tenant_id: TenantId,
        job_type: impl Into<String>,
        total_items: usize,
        created_by: UserId,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            tenant_id,
            job_type: job_type.into(),
            status: JobStatus::Pending,
            total_items,
            completed_count: 0,
            failed_count: 0,
            progress: 0.0,
            priority: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            last_updated_at: now,
            created_by,
            metadata: Metadata::new(),
            results: Vec::new(),
            error: None,
            retry_count: 0,
            max_retries: 3,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Store the input items in metadata and size the job to match.
    pub fn with_items(mut self, items: Vec<serde_json::Value>) -> Self {
        self.total_items = items.len();
        self.metadata
            .insert(ITEMS_METADATA_KEY.to_string(), serde_json::Value::Array(items));
        self
    }

    /// Input items stored in metadata, if any.
    pub fn items(&self) -> Option<&Vec<serde_json::Value>> {
        self.metadata
            .get(ITEMS_METADATA_KEY)
            .and_then(|v| v.as_array())
    }

    /// Number of items with a recorded outcome.
    pub fn processed_count(&self) -> usize {
        self.completed_count + self.failed_count
    }

    /// Progress implied by the counters.
    pub fn compute_progress(&self) -> f64 {
        if self.total_items == 0 {
            return 0.0;
        }
        (self.processed_count() as f64 / self.total_items as f64) * 100.0
    }

    /// True once every item has an outcome.
    pub fn all_items_processed(&self) -> bool {
        self.processed_count() == self.total_items
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn result(&self, item_index: usize) -> Option<&ItemResult> {
        self.results
            .binary_search_by_key(&item_index, |r| r.item_index)
            .ok()
            .map(|pos| &self.results[pos])
    }

    fn transition(&mut self, next: JobStatus) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invalid_transition(self.status, next));
        }
        self.status = next;
        self.last_updated_at = Utc::now();
        Ok(())
    }

    /// `pending -> processing`.
    pub fn start(&mut self) -> DomainResult<()> {
        self.transition(JobStatus::Processing)?;
        self.started_at = Some(self.last_updated_at);
        self.error = None;
        Ok(())
    }

    /// `processing -> completed`, progress forced to 100.
    pub fn complete(&mut self) -> DomainResult<()> {
        self.transition(JobStatus::Completed)?;
        self.progress = 100.0;
        self.completed_at = Some(self.last_updated_at);
        Ok(())
    }

    /// `processing -> failed`, recording the terminal error.
    pub fn fail(&mut self, error: impl Into<String>) -> DomainResult<()> {
        self.transition(JobStatus::Failed)?;
        self.error = Some(error.into());
        self.completed_at = Some(self.last_updated_at);
        Ok(())
    }

    pub fn cancel(&mut self) -> DomainResult<()> {
        self.transition(JobStatus::Cancelled)?;
        self.completed_at = Some(self.last_updated_at);
        Ok(())
    }

    /// Administrative pause of a running job.
    pub fn pause(&mut self) -> DomainResult<()> {
        self.transition(JobStatus::Paused)
    }

    pub fn resume(&mut self) -> DomainResult<()> {
        self.transition(JobStatus::Processing)
    }

    /// Confirm the job is waiting to run (used when a job is handed to a scheduler).
    pub fn ensure_pending(&mut self) -> DomainResult<()> {
        if self.status != JobStatus::Pending {
            return Err(DomainError::invalid_transition(self.status, JobStatus::Pending));
        }
        self.last_updated_at = Utc::now();
        Ok(())
    }

    /// `failed -> pending` for a job-level resubmission.
    ///
    /// Results recorded so far are kept; reprocessing upserts them by index.
    pub fn reset_for_retry(&mut self) -> DomainResult<()> {
        if self.retry_count >= self.max_retries {
            return Err(DomainError::RetriesExhausted {
                attempts: self.retry_count,
            });
        }
        self.transition(JobStatus::Pending)?;
        self.retry_count += 1;
        self.error = None;
        self.started_at = None;
        self.completed_at = None;
        Ok(())
    }

    /// Upsert the outcome for one item and refresh the counters.
    pub fn record_result(&mut self, result: ItemResult) -> DomainResult<()> {
        if result.job_id != self.id {
            return Err(DomainError::validation(format!(
                "result for job {} recorded on job {}",
                result.job_id, self.id
            )));
        }
        if result.item_index >= self.total_items {
            return Err(DomainError::validation(format!(
                "item index {} out of range (total_items = {})",
                result.item_index, self.total_items
            )));
        }

        match self
            .results
            .binary_search_by_key(&result.item_index, |r| r.item_index)
        {
            Ok(pos) => {
                let existing = &mut self.results[pos];
                let was_failure = existing.is_failure();
                existing.overwrite_with(result);
                match (was_failure, existing.is_failure()) {
                    (true, false) => {
                        self.failed_count -= 1;
                        self.completed_count += 1;
                    }
                    (false, true) => {
                        self.completed_count -= 1;
                        self.failed_count += 1;
                    }
                    _ => {}
                }
            }
            Err(pos) => {
                if result.is_failure() {
                    self.failed_count += 1;
                } else {
                    self.completed_count += 1;
                }
                self.results.insert(pos, result);
            }
        }

        self.progress = self.compute_progress();
        self.last_updated_at = Utc::now();
        Ok(())
    }
}

impl TenantScoped for Job {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}
