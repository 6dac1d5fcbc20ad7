//! `forgebatch-core`: foundation building blocks shared by every crate.
//!
//! This crate contains **pure** primitives (no IO, no runtime): identifiers,
//! the domain error model and the tenant-scoping trait.

pub mod error;
pub mod id;
pub mod tenant;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, RecurringId, ScheduleId, TaskId, TenantId, UserId};
pub use tenant::TenantScoped;
