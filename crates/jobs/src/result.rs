//! Per-item outcomes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use forgebatch_core::JobId;

/// Outcome of processing one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Success,
    Failed,
    Skipped,
}

impl ItemStatus {
    /// Whether this outcome counts against the job's `failed_count`.
    ///
    /// `Skipped` items count as completed: they were visited and did not fail.
    pub fn is_failure(self) -> bool {
        matches!(self, ItemStatus::Failed)
    }
}

/// Recorded outcome of one item within a job.
///
/// Keyed by `(job_id, item_index)`; at most one result exists per key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    /// Derived from the job id and item index (`"{job_id}:{item_index}"`).
    pub id: String,
    pub job_id: JobId,
    /// 0-based, stable within a job.
    pub item_index: usize,
    pub status: ItemStatus,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub processed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ItemResult {
    /// Result identifier for a `(job, index)` pair.
    pub fn key(job_id: JobId, item_index: usize) -> String {
        format!("{job_id}:{item_index}")
    }

    fn new(
        job_id: JobId,
        item_index: usize,
        status: ItemStatus,
        input: serde_json::Value,
        duration: Duration,
    ) -> Self {
        Self {
            id: Self::key(job_id, item_index),
            job_id,
            item_index,
            status,
            input,
            output: None,
            error: None,
            processed_at: Utc::now(),
            duration_ms: duration.as_millis().min(u64::MAX as u128) as u64,
        }
    }

    pub fn success(
        job_id: JobId,
        item_index: usize,
        input: serde_json::Value,
        output: serde_json::Value,
        duration: Duration,
    ) -> Self {
        let mut result = Self::new(job_id, item_index, ItemStatus::Success, input, duration);
        result.output = Some(output);
        result
    }

    pub fn failure(
        job_id: JobId,
        item_index: usize,
        input: serde_json::Value,
        error: impl Into<String>,
        duration: Duration,
    ) -> Self {
        let mut result = Self::new(job_id, item_index, ItemStatus::Failed, input, duration);
        result.error = Some(error.into());
        result
    }

    pub fn skipped(
        job_id: JobId,
        item_index: usize,
        input: serde_json::Value,
        reason: impl Into<String>,
    ) -> Self {
        let mut result = Self::new(job_id, item_index, ItemStatus::Skipped, input, Duration::ZERO);
        result.error = Some(reason.into());
        result
    }

    /// Placeholder for an index the item source could not produce.
    pub fn unresolved(job_id: JobId, item_index: usize) -> Self {
        Self::failure(
            job_id,
            item_index,
            serde_json::Value::Null,
            format!("item {item_index} could not be resolved"),
            Duration::ZERO,
        )
    }

    pub fn is_failure(&self) -> bool {
        self.status.is_failure()
    }

    /// Apply a newer write for the same key.
    ///
    /// Status, output, error, duration and timestamp are replaced; the input
    /// recorded by the first write is kept.
    pub fn overwrite_with(&mut self, newer: ItemResult) {
        self.status = newer.status;
        self.output = newer.output;
        self.error = newer.error;
        self.duration_ms = newer.duration_ms;
        self.processed_at = newer.processed_at;
    }
}
