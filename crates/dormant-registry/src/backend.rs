//! Wake-up backends and the choice between them.
//!
//! Each backend is described by a [`BackendCapabilities`] value rather than a
//! type hierarchy; [`select_backend`] is a pure function over those
//! descriptors.

use async_trait::async_trait;

use crate::constraints::{Constraint, ConstraintSet};
use crate::job::JobSpec;
use crate::record::JobRecord;
use crate::types::{BackendTag, JobId};

/// What a backend can honour on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCapabilities {
    pub tag: BackendTag,
    /// Higher wins when several backends qualify.
    pub priority: u8,
    /// Environment constraints the backend can wait for.
    pub constraints: ConstraintSet,
    pub periodic: bool,
    /// Whether scheduled jobs survive a device restart.
    pub survives_reboot: bool,
}

impl BackendCapabilities {
    /// Plain alarm timer: timing only, available everywhere.
    pub fn alarm() -> Self {
        Self {
            tag: BackendTag::Alarm,
            priority: 0,
            constraints: ConstraintSet::EMPTY,
            periodic: true,
            survives_reboot: false,
        }
    }

    /// Push-style wake service: power and basic network conditions.
    pub fn push() -> Self {
        Self {
            tag: BackendTag::Push,
            priority: 1,
            constraints: ConstraintSet::of(&[
                Constraint::Charging,
                Constraint::Idle,
                Constraint::AnyNetwork,
                Constraint::UnmeteredNetwork,
            ]),
            periodic: true,
            survives_reboot: true,
        }
    }

    /// Native job-scheduling facility: everything.
    pub fn native() -> Self {
        Self {
            tag: BackendTag::Native,
            priority: 2,
            constraints: ConstraintSet::ENVIRONMENT,
            periodic: true,
            survives_reboot: true,
        }
    }

    /// Whether this backend can run `spec` without dropping a requirement.
    pub fn supports(&self, spec: &JobSpec) -> bool {
        spec.declared_constraints().is_subset(self.constraints)
            && (!spec.is_periodic() || self.periodic)
    }
}

/// Highest-priority backend able to run `spec`.
///
/// Persisted jobs prefer a backend that survives a restart, but fall back to
/// any supporting backend since the registry restores them on startup anyway.
/// Ties go to the backend listed first.
pub fn select_backend(spec: &JobSpec, available: &[BackendCapabilities]) -> Option<BackendTag> {
    let supporting = available.iter().filter(|caps| caps.supports(spec));
    if spec.is_persisted() {
        let durable = highest_priority(supporting.clone().filter(|caps| caps.survives_reboot));
        if durable.is_some() {
            return durable;
        }
    }
    highest_priority(supporting)
}

fn highest_priority<'a>(
    candidates: impl Iterator<Item = &'a BackendCapabilities>,
) -> Option<BackendTag> {
    candidates
        .fold(None::<&BackendCapabilities>, |best, caps| match best {
            Some(current) if current.priority >= caps.priority => Some(current),
            _ => Some(caps),
        })
        .map(|caps| caps.tag)
}

/// Result of handing a job to a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Success,
    Failure { reason: String },
}

impl ScheduleOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ScheduleOutcome::Success)
    }
}

/// A mechanism that wakes the process when a job is due.
///
/// Backends report finished runs back through
/// [`Dispatcher::job_finished`](crate::Dispatcher::job_finished).
#[async_trait]
pub trait WakeBackend: Send + Sync {
    fn tag(&self) -> BackendTag;

    async fn schedule(&self, record: &JobRecord) -> ScheduleOutcome;

    async fn cancel(&self, id: JobId);

    async fn cancel_all(&self);
}
