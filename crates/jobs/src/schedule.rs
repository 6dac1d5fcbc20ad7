//! Time-triggered entries: one-shot and recurring.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use forgebatch_core::{
    DomainError, DomainResult, JobId, RecurringId, ScheduleId, TenantId, TenantScoped, UserId,
};

use crate::cadence::{Cadence, CadenceError};
use crate::job::{Job, Metadata};

/// Metadata key linking an instantiated job back to its recurring entry.
pub const RECURRING_ID_METADATA_KEY: &str = "recurring_id";

/// Status of a one-shot scheduled entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Pending,
    Executing,
    Completed,
    Cancelled,
    Failed,
}

impl ScheduleStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScheduleStatus::Completed | ScheduleStatus::Cancelled | ScheduleStatus::Failed
        )
    }

    pub fn can_transition_to(self, next: ScheduleStatus) -> bool {
        use ScheduleStatus::*;

        matches!(
            (self, next),
            (Pending, Executing) | (Pending, Cancelled) | (Executing, Completed) | (Executing, Failed)
        )
    }
}

/// Binds a job to a single future execution instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEntry {
    pub id: ScheduleId,
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub execute_at: DateTime<Utc>,
    pub status: ScheduleStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub metadata: Metadata,
}

impl ScheduledEntry {
    pub fn new(job: &Job, execute_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: ScheduleId::new(),
            job_id: job.id,
            tenant_id: job.tenant_id,
            execute_at,
            status: ScheduleStatus::Pending,
            created_at: now,
            updated_at: now,
            executed_at: None,
            error: None,
            metadata: Metadata::new(),
        }
    }

    /// Eligible for promotion at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ScheduleStatus::Pending && self.execute_at <= now
    }

    fn transition(&mut self, next: ScheduleStatus) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invalid_transition(self.status, next));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn begin_execution(&mut self) -> DomainResult<()> {
        self.transition(ScheduleStatus::Executing)?;
        self.executed_at = Some(self.updated_at);
        Ok(())
    }

    pub fn complete(&mut self) -> DomainResult<()> {
        self.transition(ScheduleStatus::Completed)
    }

    pub fn fail(&mut self, error: impl Into<String>) -> DomainResult<()> {
        self.transition(ScheduleStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    pub fn cancel(&mut self) -> DomainResult<()> {
        self.transition(ScheduleStatus::Cancelled)
    }
}

impl TenantScoped for ScheduledEntry {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

/// Shape of the jobs a recurring entry produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringTemplate {
    pub job_type: String,
    pub priority: i32,
    /// Used when `metadata` carries no `items` array.
    pub total_items: usize,
    pub max_retries: u32,
    pub metadata: Metadata,
}

impl RecurringTemplate {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            priority: 0,
            total_items: 0,
            max_retries: 3,
            metadata: Metadata::new(),
        }
    }

    pub fn with_items(mut self, items: Vec<serde_json::Value>) -> Self {
        self.total_items = items.len();
        self.metadata.insert(
            crate::job::ITEMS_METADATA_KEY.to_string(),
            serde_json::Value::Array(items),
        );
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Binds a job template to a repeating cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringEntry {
    pub id: RecurringId,
    pub tenant_id: TenantId,
    pub name: String,
    pub schedule: Cadence,
    pub template: RecurringTemplate,
    pub is_active: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: DateTime<Utc>,
    pub run_count: u64,
    pub last_job_id: Option<JobId>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: UserId,
    pub metadata: Metadata,
}

impl RecurringEntry {
    /// Create an active entry whose first run is the first occurrence after `now`.
    pub fn new(
        tenant_id: TenantId,
        name: impl Into<String>,
        schedule: Cadence,
        template: RecurringTemplate,
        created_by: UserId,
        now: DateTime<Utc>,
    ) -> Result<Self, CadenceError> {
        let next_run = schedule
            .next_after(now)
            .ok_or_else(|| CadenceError::NeverFires(schedule.expression().to_string()))?;

        Ok(Self {
            id: RecurringId::new(),
            tenant_id,
            name: name.into(),
            schedule,
            template,
            is_active: true,
            last_run: None,
            next_run,
            run_count: 0,
            last_job_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            created_by,
            metadata: Metadata::new(),
        })
    }

    pub fn job_type(&self) -> &str {
        &self.template.job_type
    }

    /// Inactive entries are never due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.next_run <= now
    }

    /// Build a fresh pending job from the template.
    pub fn instantiate(&self) -> Job {
        let mut job = Job::new(
            self.tenant_id,
            self.template.job_type.clone(),
            self.template.total_items,
            self.created_by,
        )
        .with_priority(self.template.priority)
        .with_max_retries(self.template.max_retries);

        job.metadata = self.template.metadata.clone();
        if let Some(count) = job.items().map(Vec::len) {
            job.total_items = count;
        }
        job.metadata.insert(
            RECURRING_ID_METADATA_KEY.to_string(),
            serde_json::Value::String(self.id.to_string()),
        );
        job
    }

    /// Record one promotion at `now` and advance `next_run` past it.
    ///
    /// An expression with no further occurrence deactivates the entry.
    pub fn record_run(&mut self, now: DateTime<Utc>, outcome: Result<JobId, String>) {
        self.last_run = Some(now);
        self.run_count += 1;
        match outcome {
            Ok(job_id) => {
                self.last_job_id = Some(job_id);
                self.last_error = None;
            }
            Err(error) => self.last_error = Some(error),
        }

        match self.schedule.next_after(now) {
            Some(next) => self.next_run = next,
            None => self.is_active = false,
        }
        self.updated_at = Utc::now();
    }

    /// Toggle the entry. Reactivation skips occurrences missed while inactive.
    pub fn set_active(&mut self, active: bool, now: DateTime<Utc>) -> DomainResult<()> {
        if active && !self.is_active {
            self.next_run = self.schedule.next_after(now).ok_or_else(|| {
                DomainError::validation(format!(
                    "schedule `{}` has no future occurrence",
                    self.schedule
                ))
            })?;
        }
        self.is_active = active;
        self.updated_at = Utc::now();
        Ok(())
    }
}

impl TenantScoped for RecurringEntry {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}
