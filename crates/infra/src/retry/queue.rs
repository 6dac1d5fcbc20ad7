//! Retryable tasks and the durable queue boundary.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use forgebatch_core::{JobId, TaskId, TenantId, TenantScoped};

/// Task lifecycle as seen by the retry engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Ready to be picked up.
    Pending,
    Processing,
    /// Waiting out a backoff delay before re-enqueue.
    Retrying,
    Completed,
    /// Terminal: retries exhausted or not retryable.
    Failed,
}

/// A unit of work owned by the durable queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub tenant_id: TenantId,
    /// Set when the task drives a batch job.
    pub job_id: Option<JobId>,
    pub kind: String,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(tenant_id: TenantId, kind: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            tenant_id,
            job_id: None,
            kind: kind.into(),
            payload,
            status: TaskStatus::Pending,
            retry_count: 0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn for_job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    /// Bump the attempt counter and park the task until its delay elapses.
    pub fn prepare_retry(&mut self) {
        self.retry_count += 1;
        self.status = TaskStatus::Retrying;
        self.error = None;
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.error = Some(reason.into());
        self.updated_at = Utc::now();
    }
}

impl TenantScoped for Task {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

/// Task queue error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("queue closed")]
    Closed,
    #[error("queue error: {0}")]
    Backend(String),
}

/// Durable queue used by the retry engine.
///
/// Ordering and durability guarantees belong to the implementation.
#[async_trait::async_trait]
pub trait TaskQueue: Send + Sync {
    /// Make the task available for processing.
    async fn enqueue(&self, task: Task) -> Result<(), QueueError>;

    /// Persist the task's current state without making it ready.
    async fn save(&self, task: &Task) -> Result<(), QueueError>;

    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, QueueError>;

    /// Move the task to its terminal failed state.
    async fn mark_failed(&self, task_id: TaskId, reason: &str) -> Result<(), QueueError>;
}

/// Entry in the dead-letter list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub task: Task,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

/// In-memory task queue for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTaskQueue {
    tasks: RwLock<HashMap<TaskId, Task>>,
    ready: Mutex<VecDeque<TaskId>>,
    dead_letters: RwLock<Vec<DeadLetterEntry>>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pop the oldest ready task and mark it processing.
    pub async fn dequeue(&self) -> Option<Task> {
        let mut ready = self.ready.lock().await;
        let mut tasks = self.tasks.write().await;

        while let Some(task_id) = ready.pop_front() {
            if let Some(task) = tasks.get_mut(&task_id) {
                if task.status != TaskStatus::Pending {
                    continue;
                }
                task.status = TaskStatus::Processing;
                task.updated_at = Utc::now();
                return Some(task.clone());
            }
        }
        None
    }

    pub async fn ready_len(&self) -> usize {
        self.ready.lock().await.len()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.dead_letters.read().await.clone()
    }
}

#[async_trait::async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, mut task: Task) -> Result<(), QueueError> {
        let mut ready = self.ready.lock().await;
        let mut tasks = self.tasks.write().await;

        task.status = TaskStatus::Pending;
        task.updated_at = Utc::now();
        ready.push_back(task.id);
        tasks.insert(task.id, task);
        Ok(())
    }

    async fn save(&self, task: &Task) -> Result<(), QueueError> {
        self.tasks.write().await.insert(task.id, task.clone());
        Ok(())
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, QueueError> {
        Ok(self.tasks.read().await.get(&task_id).cloned())
    }

    async fn mark_failed(&self, task_id: TaskId, reason: &str) -> Result<(), QueueError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&task_id).ok_or(QueueError::NotFound(task_id))?;
        task.mark_failed(reason);

        self.dead_letters.write().await.push(DeadLetterEntry {
            task: task.clone(),
            dead_lettered_at: Utc::now(),
            reason: reason.to_string(),
        });
        Ok(())
    }
}
