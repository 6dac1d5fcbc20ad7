//! Batch job domain model.
//!
//! This crate describes jobs, their per-item results and the entries that
//! bind jobs to time (one-shot and recurring schedules). It is deterministic
//! domain logic only: no IO, no runtime, no storage.

pub mod cadence;
pub mod job;
pub mod result;
pub mod schedule;

pub use cadence::{Cadence, CadenceError};
pub use job::{ITEMS_METADATA_KEY, Job, JobStatus, Metadata};
pub use result::{ItemResult, ItemStatus};
pub use schedule::{RecurringEntry, RecurringTemplate, ScheduleStatus, ScheduledEntry};
