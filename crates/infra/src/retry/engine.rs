//! Retry engine: classify failures, persist the retry, and re-enqueue after backoff.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use super::policy::RetryPolicy;
use super::queue::{QueueError, Task, TaskQueue};

/// Why a failure will not be retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotRetryableReason {
    Exhausted { retry_count: u32, max_retries: u32 },
    /// The error matched none of the policy's retryable substrings.
    NonRetryableError,
}

/// Outcome of classifying a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retryable { delay: Duration },
    NotRetryable { reason: NotRetryableReason },
}

impl RetryDecision {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RetryDecision::Retryable { .. })
    }
}

/// What `retry` did with the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Persisted as retrying; re-enqueue fires after `delay`.
    Scheduled { delay: Duration, retry_count: u32 },
    /// Terminally failed.
    Failed { reason: NotRetryableReason },
}

/// Retry engine error.
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("retry engine is shut down")]
    ShutDown,
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Retry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryStats {
    pub classified: u64,
    pub scheduled: u64,
    pub requeued: u64,
    pub exhausted: u64,
    /// Delayed re-enqueues dropped by cancellation.
    pub abandoned: u64,
    pub requeue_failures: u64,
}

pub struct RetryEngine {
    policy: RetryPolicy,
    queue: Arc<dyn TaskQueue>,
    stats: Arc<RwLock<RetryStats>>,
    timers: TaskTracker,
}

impl RetryEngine {
    pub fn new(policy: RetryPolicy, queue: Arc<dyn TaskQueue>) -> Self {
        Self {
            policy,
            queue,
            stats: Arc::new(RwLock::new(RetryStats::default())),
            timers: TaskTracker::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Decide whether `task` may be retried after failing with `error`.
    ///
    /// Exhaustion is checked before the error text.
    pub async fn classify(&self, task: &Task, error: &str) -> RetryDecision {
        self.stats.write().await.classified += 1;

        if !self.policy.should_retry(task.retry_count) {
            return RetryDecision::NotRetryable {
                reason: NotRetryableReason::Exhausted {
                    retry_count: task.retry_count,
                    max_retries: self.policy.max_retries,
                },
            };
        }
        if !self.policy.is_retryable_error(error) {
            return RetryDecision::NotRetryable {
                reason: NotRetryableReason::NonRetryableError,
            };
        }
        RetryDecision::Retryable {
            delay: self.policy.delay_for(task.retry_count),
        }
    }

    /// Handle a failed task.
    ///
    /// Retryable failures are persisted as `Retrying` before a delayed
    /// re-enqueue is scheduled; the delay is dropped when `ctx` is cancelled.
    pub async fn retry(
        &self,
        ctx: &CancellationToken,
        mut task: Task,
        error: &str,
    ) -> Result<RetryOutcome, RetryError> {
        if ctx.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        if self.timers.is_closed() {
            return Err(RetryError::ShutDown);
        }

        let delay = match self.classify(&task, error).await {
            RetryDecision::Retryable { delay } => delay,
            RetryDecision::NotRetryable { reason } => {
                let message = match &reason {
                    NotRetryableReason::Exhausted { retry_count, .. } => {
                        format!("retries exhausted after {retry_count} attempts: {error}")
                    }
                    NotRetryableReason::NonRetryableError => error.to_string(),
                };
                self.queue.mark_failed(task.id, &message).await?;
                self.stats.write().await.exhausted += 1;
                tracing::warn!(
                    task_id = %task.id,
                    job_id = ?task.job_id,
                    retry_count = task.retry_count,
                    reason = ?reason,
                    "task failed permanently"
                );
                return Ok(RetryOutcome::Failed { reason });
            }
        };

        task.prepare_retry();
        self.queue.save(&task).await?;
        self.stats.write().await.scheduled += 1;

        let retry_count = task.retry_count;
        tracing::info!(
            task_id = %task.id,
            job_id = ?task.job_id,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            error,
            "scheduling task retry"
        );

        let span = tracing::info_span!("retry_timer", task_id = %task.id, retry_count);
        self.timers.spawn(
            requeue_after(
                ctx.clone(),
                delay,
                task,
                Arc::clone(&self.queue),
                Arc::clone(&self.stats),
            )
            .instrument(span),
        );

        Ok(RetryOutcome::Scheduled { delay, retry_count })
    }

    pub async fn stats(&self) -> RetryStats {
        *self.stats.read().await
    }

    /// Re-enqueue timers that have not fired yet.
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Refuse new retries and wait for outstanding timers.
    ///
    /// Timers only finish early if their context is cancelled.
    pub async fn shutdown(&self) {
        self.timers.close();
        self.timers.wait().await;
    }
}

async fn requeue_after(
    ctx: CancellationToken,
    delay: Duration,
    task: Task,
    queue: Arc<dyn TaskQueue>,
    stats: Arc<RwLock<RetryStats>>,
) {
    tokio::select! {
        biased;
        _ = ctx.cancelled() => {
            stats.write().await.abandoned += 1;
            tracing::debug!("retry timer cancelled");
            return;
        }
        _ = tokio::time::sleep(delay) => {}
    }

    let task_id = task.id;
    match queue.enqueue(task).await {
        Ok(()) => {
            stats.write().await.requeued += 1;
            tracing::debug!("task re-enqueued");
        }
        Err(e) => {
            stats.write().await.requeue_failures += 1;
            tracing::error!(error = %e, "failed to re-enqueue task");
            let reason = format!("re-enqueue failed: {e}");
            if let Err(e) = queue.mark_failed(task_id, &reason).await {
                tracing::error!(error = %e, "failed to mark task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::queue::{InMemoryTaskQueue, TaskStatus};
    use forgebatch_core::{TaskId, TenantId};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
            .with_max_retries(2)
            .with_delays(Duration::from_millis(100), Duration::from_secs(5))
            .without_jitter()
    }

    fn task() -> Task {
        Task::new(TenantId::new(), "sync.push", json!({}))
    }

    async fn engine_with_queue() -> (RetryEngine, Arc<InMemoryTaskQueue>, Task) {
        let queue = Arc::new(InMemoryTaskQueue::new());
        let t = task();
        queue.enqueue(t.clone()).await.unwrap();
        queue.dequeue().await.unwrap();
        (RetryEngine::new(policy(), queue.clone()), queue, t)
    }

    #[tokio::test]
    async fn classify_checks_exhaustion_before_error_text() {
        let (engine, _, mut t) = engine_with_queue().await;

        assert_eq!(
            engine.classify(&t, "connection refused").await,
            RetryDecision::Retryable { delay: Duration::from_millis(100) }
        );
        assert_eq!(
            engine.classify(&t, "invalid payload").await,
            RetryDecision::NotRetryable { reason: NotRetryableReason::NonRetryableError }
        );

        t.retry_count = 2;
        assert_eq!(
            engine.classify(&t, "connection refused").await,
            RetryDecision::NotRetryable {
                reason: NotRetryableReason::Exhausted { retry_count: 2, max_retries: 2 }
            }
        );
        assert_eq!(engine.stats().await.classified, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failure_is_persisted_then_requeued_after_delay() {
        let (engine, queue, t) = engine_with_queue().await;
        let ctx = CancellationToken::new();

        let outcome = engine.retry(&ctx, t.clone(), "request timed out").await.unwrap();
        assert_eq!(
            outcome,
            RetryOutcome::Scheduled { delay: Duration::from_millis(100), retry_count: 1 }
        );

        let stored = queue.get(t.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Retrying);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(queue.ready_len().await, 0);
        assert_eq!(engine.pending_timers(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;

        let requeued = queue.dequeue().await.unwrap();
        assert_eq!(requeued.id, t.id);
        assert_eq!(requeued.retry_count, 1);
        let stats = engine.stats().await;
        assert_eq!(stats.scheduled, 1);
        assert_eq!(stats.requeued, 1);
        assert_eq!(engine.pending_timers(), 0);
    }

    #[tokio::test]
    async fn non_retryable_error_marks_failed() {
        let (engine, queue, t) = engine_with_queue().await;
        let ctx = CancellationToken::new();

        let outcome = engine.retry(&ctx, t.clone(), "schema mismatch").await.unwrap();
        assert_eq!(
            outcome,
            RetryOutcome::Failed { reason: NotRetryableReason::NonRetryableError }
        );

        let stored = queue.get(t.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("schema mismatch"));
        assert_eq!(engine.stats().await.exhausted, 1);
        assert_eq!(engine.pending_timers(), 0);
    }

    #[tokio::test]
    async fn exhausted_task_is_dead_lettered() {
        let (engine, queue, mut t) = engine_with_queue().await;
        t.retry_count = 2;

        engine
            .retry(&CancellationToken::new(), t.clone(), "timeout")
            .await
            .unwrap();

        let dls = queue.dead_letters().await;
        assert_eq!(dls.len(), 1);
        assert!(dls[0].reason.contains("retries exhausted after 2 attempts"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_drops_pending_requeue() {
        let (engine, queue, t) = engine_with_queue().await;
        let ctx = CancellationToken::new();

        engine.retry(&ctx, t.clone(), "timeout").await.unwrap();
        ctx.cancel();
        engine.shutdown().await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(queue.dequeue().await.is_none());
        assert_eq!(
            queue.get(t.id).await.unwrap().unwrap().status,
            TaskStatus::Retrying
        );
        let stats = engine.stats().await;
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.requeued, 0);
    }

    #[tokio::test]
    async fn retry_refused_after_shutdown_or_cancel() {
        let (engine, _, t) = engine_with_queue().await;

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        assert!(matches!(
            engine.retry(&cancelled, t.clone(), "timeout").await,
            Err(RetryError::Cancelled)
        ));

        engine.shutdown().await;
        assert!(matches!(
            engine.retry(&CancellationToken::new(), t, "timeout").await,
            Err(RetryError::ShutDown)
        ));
    }

    /// Queue that refuses every enqueue.
    #[derive(Default)]
    struct RejectingQueue {
        inner: InMemoryTaskQueue,
        reject: AtomicBool,
    }

    #[async_trait::async_trait]
    impl TaskQueue for RejectingQueue {
        async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
            if self.reject.load(Ordering::SeqCst) {
                return Err(QueueError::Backend("broker down".into()));
            }
            self.inner.enqueue(task).await
        }
        async fn save(&self, task: &Task) -> Result<(), QueueError> {
            self.inner.save(task).await
        }
        async fn get(&self, task_id: TaskId) -> Result<Option<Task>, QueueError> {
            self.inner.get(task_id).await
        }
        async fn mark_failed(&self, task_id: TaskId, reason: &str) -> Result<(), QueueError> {
            self.inner.mark_failed(task_id, reason).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_failure_marks_task_failed() {
        let queue = Arc::new(RejectingQueue::default());
        let t = task();
        queue.enqueue(t.clone()).await.unwrap();
        queue.reject.store(true, Ordering::SeqCst);
        let engine = RetryEngine::new(policy(), queue.clone());

        engine
            .retry(&CancellationToken::new(), t.clone(), "timeout")
            .await
            .unwrap();
        engine.shutdown().await;

        let stored = queue.get(t.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.error.unwrap().contains("broker down"));
        assert_eq!(engine.stats().await.requeue_failures, 1);
    }
}
