//! Recurring scheduling: spawn a fresh job from a template on every cadence tick.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use forgebatch_core::{JobId, RecurringId, TenantId, TenantScoped, UserId};
use forgebatch_jobs::{Cadence, Metadata, RecurringEntry, RecurringTemplate};

use super::{SchedulerError, TickReport, tick_loop};
use crate::config::SchedulerConfig;
use crate::jobs::{JobIntake, JobRepository};

type SharedEntry = Arc<RwLock<RecurringEntry>>;

/// Input for [`RecurringScheduler::register`].
#[derive(Debug, Clone)]
pub struct RecurringEntryDraft {
    pub tenant_id: TenantId,
    pub name: String,
    /// Cadence expression, e.g. `@every 15m` or `0 3 * * 1-5`.
    pub schedule: String,
    pub template: RecurringTemplate,
    pub created_by: UserId,
    pub metadata: Metadata,
}

impl RecurringEntryDraft {
    pub fn new(
        tenant_id: TenantId,
        name: impl Into<String>,
        schedule: impl Into<String>,
        template: RecurringTemplate,
        created_by: UserId,
    ) -> Self {
        Self {
            tenant_id,
            name: name.into(),
            schedule: schedule.into(),
            template,
            created_by,
            metadata: Metadata::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecurringStats {
    pub active: usize,
    pub inactive: usize,
    pub total_runs: u64,
    /// Entries whose most recent run failed.
    pub failing: usize,
}

pub struct RecurringScheduler {
    repository: Arc<dyn JobRepository>,
    intake: Arc<dyn JobIntake>,
    config: SchedulerConfig,
    entries: RwLock<HashMap<RecurringId, SharedEntry>>,
}

impl RecurringScheduler {
    pub fn new(
        repository: Arc<dyn JobRepository>,
        intake: Arc<dyn JobIntake>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            repository,
            intake,
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Parse the cadence and add an active entry whose first run is its next occurrence.
    pub async fn register(&self, draft: RecurringEntryDraft) -> Result<RecurringEntry, SchedulerError> {
        let cadence = Cadence::parse(&draft.schedule)?;
        let mut entry = RecurringEntry::new(
            draft.tenant_id,
            draft.name,
            cadence,
            draft.template,
            draft.created_by,
            Utc::now(),
        )?;
        entry.metadata = draft.metadata;

        self.entries
            .write()
            .await
            .insert(entry.id, Arc::new(RwLock::new(entry.clone())));

        info!(
            recurring_id = %entry.id,
            name = %entry.name,
            schedule = %entry.schedule,
            next_run = %entry.next_run,
            "recurring job registered"
        );
        Ok(entry)
    }

    /// Activate or deactivate an entry.
    pub async fn set_active(&self, id: RecurringId, active: bool) -> Result<RecurringEntry, SchedulerError> {
        let shared = self.shared(id).await?;
        let mut entry = shared.write().await;
        entry.set_active(active, Utc::now())?;
        info!(recurring_id = %id, active, "recurring job toggled");
        Ok(entry.clone())
    }

    pub async fn remove(&self, id: RecurringId) -> Result<RecurringEntry, SchedulerError> {
        let shared = self
            .entries
            .write()
            .await
            .remove(&id)
            .ok_or(SchedulerError::RecurringNotFound(id))?;
        let entry = shared.read().await.clone();
        info!(recurring_id = %id, "recurring job removed");
        Ok(entry)
    }

    pub async fn get(&self, id: RecurringId) -> Option<RecurringEntry> {
        let shared = self.shared(id).await.ok()?;
        let entry = shared.read().await.clone();
        Some(entry)
    }

    /// Entries for `tenant_id` (all tenants when `None`), by next run.
    pub async fn list(&self, tenant_id: Option<TenantId>) -> Vec<RecurringEntry> {
        let entries = self.entries.read().await;
        let mut out = Vec::new();
        for shared in entries.values() {
            let entry = shared.read().await;
            if tenant_id.is_none_or(|t| entry.belongs_to(t)) {
                out.push(entry.clone());
            }
        }
        out.sort_by_key(|e| e.next_run);
        out
    }

    pub async fn stats(&self) -> RecurringStats {
        let entries = self.entries.read().await;
        let mut stats = RecurringStats::default();
        for shared in entries.values() {
            let entry = shared.read().await;
            if entry.is_active {
                stats.active += 1;
            } else {
                stats.inactive += 1;
            }
            stats.total_runs += entry.run_count;
            if entry.last_error.is_some() {
                stats.failing += 1;
            }
        }
        stats
    }

    async fn shared(&self, id: RecurringId) -> Result<SharedEntry, SchedulerError> {
        self.entries
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(SchedulerError::RecurringNotFound(id))
    }

    /// Run every active entry whose `next_run` is at or before `now`.
    ///
    /// Failed runs still advance `next_run`; missed occurrences are not replayed.
    pub async fn process_due(&self, now: DateTime<Utc>) -> TickReport {
        let due = self.scan_due(now).await;
        let mut report = TickReport::default();

        for shared in due {
            let mut entry = shared.write().await;
            // deactivated or already run since the scan
            if !entry.is_due(now) {
                report.skipped += 1;
                continue;
            }

            let outcome = self.launch(&entry).await;
            match &outcome {
                Ok(job_id) => {
                    report.promoted += 1;
                    info!(recurring_id = %entry.id, %job_id, "recurring job launched");
                }
                Err(reason) => {
                    report.failed += 1;
                    warn!(recurring_id = %entry.id, error = %reason, "recurring job launch failed");
                }
            }
            entry.record_run(now, outcome);
            if !entry.is_active {
                info!(recurring_id = %entry.id, "cadence exhausted, entry deactivated");
            }
        }

        report
    }

    async fn scan_due(&self, now: DateTime<Utc>) -> Vec<SharedEntry> {
        let entries = self.entries.read().await;
        let mut due = Vec::new();
        for shared in entries.values() {
            let entry = shared.read().await;
            if entry.is_due(now) {
                due.push((entry.next_run, Arc::clone(shared)));
            }
        }
        due.sort_by_key(|(at, _)| *at);
        due.into_iter().map(|(_, e)| e).collect()
    }

    async fn launch(&self, entry: &RecurringEntry) -> Result<JobId, String> {
        let job = entry.instantiate();
        self.repository.save(&job).await.map_err(|e| e.to_string())?;
        let job = self.intake.submit(job).await.map_err(|e| e.to_string())?;
        Ok(job.id)
    }

    /// Poll for due entries until `ctx` is cancelled.
    pub async fn run(&self, ctx: CancellationToken) {
        tick_loop("recurring", ctx, self.config.tick_interval, || {
            self.process_due(Utc::now())
        })
        .await;
    }
}
