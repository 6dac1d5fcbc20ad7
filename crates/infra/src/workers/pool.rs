//! Fixed-size pool of async executors draining a bounded job queue.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use forgebatch_core::JobId;
use forgebatch_jobs::Job;

use crate::jobs::OrchestratorError;

/// Executes one job on behalf of a pool worker.
#[async_trait::async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, ctx: &CancellationToken, job: Job) -> Result<Job, OrchestratorError>;
}

/// Pool lifecycle and intake error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool already started")]
    AlreadyStarted,
    #[error("worker pool not started")]
    NotStarted,
    #[error("worker pool queue is full, job {job_id} rejected")]
    PoolFull { job_id: JobId },
    #[error("submission cancelled")]
    Cancelled,
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub current_running: usize,
    pub queued: usize,
}

struct PoolRuntime {
    sender: mpsc::Sender<Job>,
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Worker pool.
///
/// `workers` executors share one queue bounded to `2 * workers`. Submission
/// never waits for capacity.
pub struct WorkerPool {
    workers: usize,
    runner: Arc<dyn JobRunner>,
    state: RwLock<Option<PoolRuntime>>,
    stats: Arc<Mutex<PoolStats>>,
}

impl WorkerPool {
    pub fn new(workers: usize, runner: Arc<dyn JobRunner>) -> Self {
        Self {
            workers: workers.max(1),
            runner,
            state: RwLock::new(None),
            stats: Arc::new(Mutex::new(PoolStats::default())),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Queue capacity.
    pub fn capacity(&self) -> usize {
        self.workers * 2
    }

    /// Spawn the executors under a child of `ctx` and return immediately.
    pub async fn start(&self, ctx: &CancellationToken) -> Result<(), PoolError> {
        let mut state = self.state.write().await;
        if state.is_some() {
            return Err(PoolError::AlreadyStarted);
        }

        let (sender, receiver) = mpsc::channel(self.capacity());
        let receiver = Arc::new(Mutex::new(receiver));
        let token = ctx.child_token();

        let handles = (0..self.workers)
            .map(|worker| {
                let span = tracing::info_span!("pool_worker", worker);
                tokio::spawn(
                    worker_loop(
                        token.clone(),
                        Arc::clone(&receiver),
                        Arc::clone(&self.runner),
                        Arc::clone(&self.stats),
                    )
                    .instrument(span),
                )
            })
            .collect();

        *state = Some(PoolRuntime {
            sender,
            token,
            handles,
        });
        info!(workers = self.workers, capacity = self.capacity(), "worker pool started");
        Ok(())
    }

    /// Cancel the executors, close the queue and wait for every executor to exit.
    ///
    /// Jobs still queued are dropped.
    pub async fn stop(&self) -> Result<(), PoolError> {
        let runtime = self.state.write().await.take().ok_or(PoolError::NotStarted)?;

        runtime.token.cancel();
        let dropped = runtime.sender.max_capacity() - runtime.sender.capacity();
        drop(runtime.sender);

        for handle in runtime.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task ended abnormally");
            }
        }

        self.stats.lock().await.current_running = 0;
        info!(dropped, "worker pool stopped");
        Ok(())
    }

    /// Enqueue a job without waiting for capacity.
    pub async fn submit(&self, ctx: &CancellationToken, job: Job) -> Result<(), PoolError> {
        if ctx.is_cancelled() {
            return Err(PoolError::Cancelled);
        }

        let state = self.state.read().await;
        let runtime = state.as_ref().ok_or(PoolError::NotStarted)?;
        if runtime.token.is_cancelled() {
            return Err(PoolError::NotStarted);
        }

        let job_id = job.id;
        match runtime.sender.try_send(job) {
            Ok(()) => {
                debug!(%job_id, "job queued");
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                warn!(%job_id, "worker pool queue full");
                Err(PoolError::PoolFull { job_id })
            }
            Err(TrySendError::Closed(_)) => Err(PoolError::NotStarted),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.state
            .read()
            .await
            .as_ref()
            .is_some_and(|rt| !rt.token.is_cancelled())
    }

    pub async fn stats(&self) -> PoolStats {
        let queued = self
            .state
            .read()
            .await
            .as_ref()
            .map_or(0, |rt| rt.sender.max_capacity() - rt.sender.capacity());

        let mut stats = self.stats.lock().await.clone();
        stats.queued = queued;
        stats
    }
}

async fn worker_loop(
    token: CancellationToken,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    runner: Arc<dyn JobRunner>,
    stats: Arc<Mutex<PoolStats>>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = async { receiver.lock().await.recv().await } => next,
        };
        // Queue closed
        let Some(job) = next else { break };

        let job_id = job.id;
        stats.lock().await.current_running += 1;
        let outcome = runner.run(&token, job).await;

        let mut s = stats.lock().await;
        s.current_running = s.current_running.saturating_sub(1);
        s.jobs_processed += 1;
        match outcome {
            Ok(_) => s.jobs_succeeded += 1,
            Err(e) => {
                s.jobs_failed += 1;
                warn!(%job_id, error = %e, "job run failed");
            }
        }
    }
    debug!("worker exiting");
}
