//! Durable, constraint-driven job registry for Dormant.
//!
//! This crate provides a registry of background jobs that:
//! - Tracks which preconditions each job requires and which currently hold
//! - Decides readiness, with an expired deadline overriding unmet constraints
//! - Retries failed runs with linear or exponential backoff
//! - Re-arms periodic jobs after every run
//! - Persists jobs through a coalescing write-behind worker and restores them
//!   across process restarts and device reboots

pub mod backoff;
mod backend;
mod clock;
pub mod codec;
mod config;
mod constraints;
mod dispatch;
mod error;
pub mod expiry;
mod job;
mod record;
mod registry;
pub mod reschedule;
mod store;
mod types;
mod writer;

pub use backend::{BackendCapabilities, ScheduleOutcome, WakeBackend, select_backend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DEFAULT_MAX_JOBS, RegistryConfig};
pub use constraints::{Constraint, ConstraintSet};
pub use dispatch::Dispatcher;
pub use error::RegistryError;
pub use job::{Execution, JobSpec, JobSpecBuilder, MAX_EXTRAS_DEPTH, MIN_FLEX, MIN_PERIOD};
pub use record::{
    ContentChanges, JobRecord, MAX_TRACKED_CONTENT_CHANGES, NO_EARLIEST_RUNTIME, NO_LATEST_RUNTIME,
};
pub use registry::JobRegistry;
pub use store::{FileStore, MemoryStore, SnapshotStore};
pub use types::{
    Backoff, BackoffPolicy, BackendTag, ContentTriggers, ExtraValue, Extras, HandlerRef, JobId,
    NetworkType, TriggerContentUri,
};
pub use writer::{SnapshotSource, WriteBehind, WriteStats};
