//! Time-triggered job promotion.
//!
//! - `OneShotScheduler`: run an existing job once at a fixed instant
//! - `RecurringScheduler`: instantiate a job from a template on every cadence occurrence
//!
//! Both keep their entries in memory and promote due entries through
//! [`JobIntake`](crate::jobs::JobIntake) from an independent tick loop.

pub mod one_shot;
pub mod recurring;

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use forgebatch_core::{DomainError, JobId, RecurringId};
use forgebatch_jobs::CadenceError;

use crate::jobs::RepositoryError;

pub use one_shot::{OneShotScheduler, SchedulerStats};
pub use recurring::{RecurringEntryDraft, RecurringScheduler, RecurringStats};

/// Scheduler error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerError {
    #[error("execute_at {execute_at} is in the past")]
    InvalidTime { execute_at: DateTime<Utc> },
    #[error("no scheduled entry for job {0}")]
    NotFound(JobId),
    #[error("recurring entry not found: {0}")]
    RecurringNotFound(RecurringId),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error(transparent)]
    InvalidCadence(#[from] CadenceError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Outcome of one `process_due` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Entries handed to intake.
    pub promoted: usize,
    /// Entries whose promotion failed.
    pub failed: usize,
    /// Entries that changed state between scan and promotion.
    pub skipped: usize,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.promoted == 0 && self.failed == 0 && self.skipped == 0
    }
}

/// Call `tick` every `every` until `ctx` is cancelled.
async fn tick_loop<F, Fut>(name: &'static str, ctx: CancellationToken, every: Duration, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TickReport>,
{
    tracing::info!(scheduler = name, tick_secs = every.as_secs_f64(), "scheduler loop started");

    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                tracing::info!(scheduler = name, "scheduler loop stopped");
                break;
            }
            _ = interval.tick() => {
                let report = tick().await;
                if !report.is_empty() {
                    tracing::info!(
                        scheduler = name,
                        promoted = report.promoted,
                        failed = report.failed,
                        skipped = report.skipped,
                        "scheduler tick"
                    );
                }
            }
        }
    }
}
