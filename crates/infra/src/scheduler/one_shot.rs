//! One-shot scheduling: run an existing job at a fixed instant.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use forgebatch_core::{JobId, ScheduleId, TenantId, TenantScoped};
use forgebatch_jobs::{Job, JobStatus, ScheduleStatus, ScheduledEntry};

use super::{SchedulerError, TickReport, tick_loop};
use crate::config::SchedulerConfig;
use crate::jobs::{JobIntake, JobRepository};

type SharedEntry = Arc<RwLock<ScheduledEntry>>;

#[derive(Default)]
struct Entries {
    by_id: HashMap<ScheduleId, SharedEntry>,
    by_job: HashMap<JobId, ScheduleId>,
}

impl Entries {
    fn insert(&mut self, entry: ScheduledEntry) {
        self.by_job.insert(entry.job_id, entry.id);
        self.by_id.insert(entry.id, Arc::new(RwLock::new(entry)));
    }

    fn remove(&mut self, id: ScheduleId) -> Option<SharedEntry> {
        let entry = self.by_id.remove(&id)?;
        self.by_job.retain(|_, sid| *sid != id);
        Some(entry)
    }

    fn for_job(&self, job_id: JobId) -> Option<SharedEntry> {
        let id = self.by_job.get(&job_id)?;
        self.by_id.get(id).cloned()
    }
}

/// Counts of entries by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub pending: usize,
    pub executing: usize,
    pub completed: usize,
    pub cancelled: usize,
    pub failed: usize,
}

/// Holds pending one-shot entries and promotes them when due.
pub struct OneShotScheduler {
    repository: Arc<dyn JobRepository>,
    intake: Arc<dyn JobIntake>,
    config: SchedulerConfig,
    entries: RwLock<Entries>,
}

impl OneShotScheduler {
    pub fn new(
        repository: Arc<dyn JobRepository>,
        intake: Arc<dyn JobIntake>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            repository,
            intake,
            config,
            entries: RwLock::new(Entries::default()),
        }
    }

    /// Defer `job` until `execute_at`.
    ///
    /// The entry is rolled back if the job cannot be saved.
    pub async fn schedule(
        &self,
        mut job: Job,
        execute_at: DateTime<Utc>,
    ) -> Result<ScheduledEntry, SchedulerError> {
        if execute_at < Utc::now() {
            return Err(SchedulerError::InvalidTime { execute_at });
        }
        job.ensure_pending()
            .map_err(|e| SchedulerError::InvalidState(e.to_string()))?;

        let entry = ScheduledEntry::new(&job, execute_at);
        {
            let mut entries = self.entries.write().await;
            if let Some(existing) = entries.for_job(job.id) {
                if existing.read().await.status == ScheduleStatus::Pending {
                    return Err(SchedulerError::InvalidState(format!(
                        "job {} is already scheduled",
                        job.id
                    )));
                }
            }
            entries.insert(entry.clone());
        }

        if let Err(e) = self.repository.save(&job).await {
            self.entries.write().await.remove(entry.id);
            warn!(job_id = %job.id, error = %e, "failed to save scheduled job, entry rolled back");
            return Err(e.into());
        }

        info!(
            job_id = %job.id,
            schedule_id = %entry.id,
            execute_at = %execute_at,
            "job scheduled"
        );
        Ok(entry)
    }

    /// Cancel the pending entry for `job_id` and the job with it.
    pub async fn cancel(&self, tenant_id: TenantId, job_id: JobId) -> Result<ScheduledEntry, SchedulerError> {
        let shared = self
            .entries
            .read()
            .await
            .for_job(job_id)
            .ok_or(SchedulerError::NotFound(job_id))?;

        // Holding the entry lock serializes against promotion.
        let mut entry = shared.write().await;
        if !entry.belongs_to(tenant_id) {
            return Err(SchedulerError::NotFound(job_id));
        }
        if entry.status != ScheduleStatus::Pending {
            return Err(SchedulerError::InvalidState(format!(
                "scheduled entry for job {job_id} is {:?}",
                entry.status
            )));
        }

        let mut job = self.repository.get(tenant_id, job_id).await?;
        if !job.is_terminal() {
            job.cancel()?;
            self.repository.save(&job).await?;
        }
        entry.cancel()?;

        info!(%job_id, schedule_id = %entry.id, "scheduled job cancelled");
        Ok(entry.clone())
    }

    /// Promote every pending entry due at `now`.
    pub async fn process_due(&self, now: DateTime<Utc>) -> TickReport {
        let due = self.scan_due(now).await;
        self.promote_due(due, now).await
    }

    /// Entries are locked one at a time, so each is re-checked under its lock.
    async fn promote_due(&self, due: Vec<SharedEntry>, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        for shared in due {
            let mut entry = shared.write().await;
            // cancelled or promoted since the scan
            if !entry.is_due(now) {
                report.skipped += 1;
                continue;
            }
            if let Err(e) = entry.begin_execution() {
                warn!(schedule_id = %entry.id, error = %e, "cannot begin execution");
                report.skipped += 1;
                continue;
            }

            match self.promote(&entry).await {
                Ok(()) => {
                    // executing -> completed cannot fail
                    let _ = entry.complete();
                    report.promoted += 1;
                    info!(job_id = %entry.job_id, schedule_id = %entry.id, "scheduled job promoted");
                }
                Err(reason) => {
                    let _ = entry.fail(reason.clone());
                    report.failed += 1;
                    warn!(job_id = %entry.job_id, schedule_id = %entry.id, error = %reason, "scheduled job promotion failed");
                }
            }
        }

        report
    }

    async fn scan_due(&self, now: DateTime<Utc>) -> Vec<SharedEntry> {
        let entries = self.entries.read().await;
        let mut due = Vec::new();
        for shared in entries.by_id.values() {
            let entry = shared.read().await;
            if entry.is_due(now) {
                due.push((entry.execute_at, Arc::clone(shared)));
            }
        }
        due.sort_by_key(|(at, _)| *at);
        due.into_iter().map(|(_, e)| e).collect()
    }

    async fn promote(&self, entry: &ScheduledEntry) -> Result<(), String> {
        let job = self
            .repository
            .get(entry.tenant_id, entry.job_id)
            .await
            .map_err(|e| e.to_string())?;
        if job.status != JobStatus::Pending {
            return Err(format!("job is {}, not pending", job.status));
        }
        self.intake.submit(job).await.map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Poll for due entries until `ctx` is cancelled.
    pub async fn run(&self, ctx: CancellationToken) {
        tick_loop("one_shot", ctx, self.config.tick_interval, || {
            self.process_due(Utc::now())
        })
        .await;
    }

    pub async fn get(&self, id: ScheduleId) -> Option<ScheduledEntry> {
        let shared = self.entries.read().await.by_id.get(&id).cloned()?;
        let entry = shared.read().await.clone();
        Some(entry)
    }

    pub async fn get_for_job(&self, job_id: JobId) -> Option<ScheduledEntry> {
        let shared = self.entries.read().await.for_job(job_id)?;
        let entry = shared.read().await.clone();
        Some(entry)
    }

    /// Entries for `tenant_id`, soonest first.
    pub async fn list(&self, tenant_id: TenantId, status: Option<ScheduleStatus>) -> Vec<ScheduledEntry> {
        let entries = self.entries.read().await;
        let mut out = Vec::new();
        for shared in entries.by_id.values() {
            let entry = shared.read().await;
            if entry.belongs_to(tenant_id) && status.is_none_or(|s| s == entry.status) {
                out.push(entry.clone());
            }
        }
        out.sort_by_key(|e| e.execute_at);
        out
    }

    pub async fn stats(&self) -> SchedulerStats {
        let entries = self.entries.read().await;
        let mut stats = SchedulerStats::default();
        for shared in entries.by_id.values() {
            match shared.read().await.status {
                ScheduleStatus::Pending => stats.pending += 1,
                ScheduleStatus::Executing => stats.executing += 1,
                ScheduleStatus::Completed => stats.completed += 1,
                ScheduleStatus::Cancelled => stats.cancelled += 1,
                ScheduleStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Drop terminal entries last updated before `older_than`.
    pub async fn purge_finished(&self, older_than: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write().await;
        let mut stale = Vec::new();
        for (id, shared) in &entries.by_id {
            let entry = shared.read().await;
            if entry.status.is_terminal() && entry.updated_at < older_than {
                stale.push(*id);
            }
        }
        for id in &stale {
            entries.remove(*id);
        }
        debug!(purged = stale.len(), "purged finished schedule entries");
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::InMemoryJobRepository;
    use crate::scheduler::test_support::RecordingIntake;
    use chrono::TimeDelta;
    use forgebatch_core::UserId;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Fixture {
        repo: Arc<InMemoryJobRepository>,
        intake: Arc<RecordingIntake>,
        scheduler: OneShotScheduler,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(InMemoryJobRepository::new());
        let intake = Arc::new(RecordingIntake::default());
        let scheduler = OneShotScheduler::new(repo.clone(), intake.clone(), SchedulerConfig::default());
        Fixture { repo, intake, scheduler }
    }

    fn job() -> Job {
        Job::new(TenantId::new(), "report", 1, UserId::new())
    }

    fn in_secs(secs: i64) -> DateTime<Utc> {
        Utc::now() + TimeDelta::seconds(secs)
    }

    #[tokio::test]
    async fn past_execute_at_is_rejected() {
        let f = fixture();
        let at = in_secs(-5);
        let err = f.scheduler.schedule(job(), at).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTime { execute_at } if execute_at == at));
        assert_eq!(f.scheduler.stats().await, SchedulerStats::default());
    }

    #[tokio::test]
    async fn schedule_persists_pending_job() {
        let f = fixture();
        let j = job();
        let entry = f.scheduler.schedule(j.clone(), in_secs(60)).await.unwrap();

        assert_eq!(entry.status, ScheduleStatus::Pending);
        assert_eq!(entry.job_id, j.id);
        assert_eq!(f.repo.get(j.tenant_id, j.id).await.unwrap().status, JobStatus::Pending);
        assert_eq!(f.scheduler.get(entry.id).await.unwrap().id, entry.id);

        let dup = f.scheduler.schedule(j, in_secs(120)).await.unwrap_err();
        assert!(matches!(dup, SchedulerError::InvalidState(_)));
    }

    #[tokio::test]
    async fn schedule_rolls_back_on_repository_failure() {
        let f = fixture();
        f.repo.set_fail_writes(true);
        let j = job();

        let err = f.scheduler.schedule(j.clone(), in_secs(60)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Repository(_)));
        assert!(f.scheduler.get_for_job(j.id).await.is_none());
    }

    #[tokio::test]
    async fn non_pending_job_cannot_be_scheduled() {
        let f = fixture();
        let mut j = job();
        j.start().unwrap();
        let err = f.scheduler.schedule(j, in_secs(60)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidState(_)));
    }

    #[tokio::test]
    async fn due_entries_are_promoted_once() {
        let f = fixture();
        let early = job();
        let later = job();
        f.scheduler.schedule(early.clone(), in_secs(1)).await.unwrap();
        f.scheduler.schedule(later.clone(), in_secs(3600)).await.unwrap();

        let report = f.scheduler.process_due(in_secs(2)).await;
        assert_eq!(report, TickReport { promoted: 1, failed: 0, skipped: 0 });
        assert_eq!(f.intake.count().await, 1);
        assert_eq!(f.intake.submitted.lock().await[0].id, early.id);

        let entry = f.scheduler.get_for_job(early.id).await.unwrap();
        assert_eq!(entry.status, ScheduleStatus::Completed);
        assert!(entry.executed_at.is_some());

        // already promoted
        let report = f.scheduler.process_due(in_secs(2)).await;
        assert!(report.is_empty());
        assert_eq!(f.scheduler.get_for_job(later.id).await.unwrap().status, ScheduleStatus::Pending);
    }

    #[tokio::test]
    async fn entry_cancelled_after_scan_is_skipped() {
        let f = fixture();
        let j = job();
        f.scheduler.schedule(j.clone(), in_secs(1)).await.unwrap();

        let now = in_secs(2);
        let due = f.scheduler.scan_due(now).await;
        assert_eq!(due.len(), 1);
        f.scheduler.cancel(j.tenant_id, j.id).await.unwrap();

        let report = f.scheduler.promote_due(due, now).await;
        assert_eq!(report, TickReport { promoted: 0, failed: 0, skipped: 1 });
        assert_eq!(f.intake.count().await, 0);
        assert_eq!(
            f.scheduler.get_for_job(j.id).await.unwrap().status,
            ScheduleStatus::Cancelled
        );
        assert_eq!(f.repo.get(j.tenant_id, j.id).await.unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn intake_rejection_fails_entry_without_retry() {
        let f = fixture();
        f.intake.reject.store(true, Ordering::SeqCst);
        let j = job();
        f.scheduler.schedule(j.clone(), in_secs(1)).await.unwrap();

        let report = f.scheduler.process_due(in_secs(2)).await;
        assert_eq!(report.failed, 1);

        let entry = f.scheduler.get_for_job(j.id).await.unwrap();
        assert_eq!(entry.status, ScheduleStatus::Failed);
        assert!(entry.error.unwrap().contains("full"));

        f.intake.reject.store(false, Ordering::SeqCst);
        assert!(f.scheduler.process_due(in_secs(5)).await.is_empty());
    }

    #[tokio::test]
    async fn job_changed_behind_scheduler_fails_promotion() {
        let f = fixture();
        let j = job();
        f.scheduler.schedule(j.clone(), in_secs(1)).await.unwrap();

        let mut stored = f.repo.get(j.tenant_id, j.id).await.unwrap();
        stored.cancel().unwrap();
        f.repo.save(&stored).await.unwrap();

        let report = f.scheduler.process_due(in_secs(2)).await;
        assert_eq!(report.failed, 1);
        assert_eq!(f.intake.count().await, 0);
    }

    #[tokio::test]
    async fn cancel_pending_entry() {
        let f = fixture();
        let j = job();
        f.scheduler.schedule(j.clone(), in_secs(60)).await.unwrap();

        let entry = f.scheduler.cancel(j.tenant_id, j.id).await.unwrap();
        assert_eq!(entry.status, ScheduleStatus::Cancelled);
        assert_eq!(f.repo.get(j.tenant_id, j.id).await.unwrap().status, JobStatus::Cancelled);

        // cancelled entries are never promoted
        assert!(f.scheduler.process_due(in_secs(120)).await.is_empty());
        assert_eq!(f.intake.count().await, 0);

        let again = f.scheduler.cancel(j.tenant_id, j.id).await.unwrap_err();
        assert!(matches!(again, SchedulerError::InvalidState(_)));
    }

    #[tokio::test]
    async fn cancel_unknown_or_foreign_job() {
        let f = fixture();
        let missing = JobId::new();
        assert!(matches!(
            f.scheduler.cancel(TenantId::new(), missing).await,
            Err(SchedulerError::NotFound(id)) if id == missing
        ));

        let j = job();
        f.scheduler.schedule(j.clone(), in_secs(60)).await.unwrap();
        assert!(matches!(
            f.scheduler.cancel(TenantId::new(), j.id).await,
            Err(SchedulerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancel_after_promotion_is_invalid_state() {
        let f = fixture();
        let j = job();
        f.scheduler.schedule(j.clone(), in_secs(1)).await.unwrap();
        f.scheduler.process_due(in_secs(2)).await;

        let err = f.scheduler.cancel(j.tenant_id, j.id).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidState(_)));
    }

    #[tokio::test]
    async fn list_stats_and_purge() {
        let f = fixture();
        let a = job();
        let b = Job::new(a.tenant_id, "report", 1, UserId::new());
        f.scheduler.schedule(a.clone(), in_secs(1)).await.unwrap();
        f.scheduler.schedule(b.clone(), in_secs(60)).await.unwrap();
        f.scheduler.process_due(in_secs(2)).await;

        let all = f.scheduler.list(a.tenant_id, None).await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].job_id, a.id);
        let pending = f.scheduler.list(a.tenant_id, Some(ScheduleStatus::Pending)).await;
        assert_eq!(pending.len(), 1);
        assert!(f.scheduler.list(TenantId::new(), None).await.is_empty());

        let stats = f.scheduler.stats().await;
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 1);

        assert_eq!(f.scheduler.purge_finished(in_secs(10)).await, 1);
        assert!(f.scheduler.get_for_job(a.id).await.is_none());
        assert!(f.scheduler.get_for_job(b.id).await.is_some());
    }

    #[tokio::test]
    async fn run_loop_promotes_until_cancelled() {
        let repo = Arc::new(InMemoryJobRepository::new());
        let intake = Arc::new(RecordingIntake::default());
        let scheduler = Arc::new(OneShotScheduler::new(
            repo,
            intake.clone(),
            SchedulerConfig {
                tick_interval: Duration::from_millis(10),
            },
        ));
        let ctx = CancellationToken::new();
        let handle = tokio::spawn({
            let scheduler = scheduler.clone();
            let ctx = ctx.clone();
            async move { scheduler.run(ctx).await }
        });

        let j = job();
        scheduler
            .schedule(j.clone(), Utc::now() + TimeDelta::milliseconds(30))
            .await
            .unwrap();

        for _ in 0..200 {
            if intake.count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(intake.count().await, 1);

        ctx.cancel();
        handle.await.unwrap();
    }
}
