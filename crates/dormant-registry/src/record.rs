//! Mutable scheduling state for one admitted job.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::duration_millis;
use crate::constraints::{Constraint, ConstraintSet};
use crate::job::{Execution, JobSpec};
use crate::types::{BackendTag, JobId};

/// Elapsed-time value meaning "no earliest bound".
pub const NO_EARLIEST_RUNTIME: u64 = 0;

/// Elapsed-time value meaning "no latest bound".
pub const NO_LATEST_RUNTIME: u64 = u64::MAX;

/// Most changed URIs remembered for a content-triggered job.
pub const MAX_TRACKED_CONTENT_CHANGES: usize = 50;

/// Content changes observed since a content-triggered job was armed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChanges {
    /// Changed URIs, or `None` once more than
    /// [`MAX_TRACKED_CONTENT_CHANGES`] have been seen.
    pub uris: Option<BTreeSet<String>>,
    pub authorities: BTreeSet<String>,
}

/// Scheduling state for one job.
///
/// `required` is fixed when the record is built; only `satisfied` moves
/// afterwards. Rescheduling builds a fresh record rather than editing this one.
#[derive(Debug, Clone)]
pub struct JobRecord {
    spec: Arc<JobSpec>,
    backend: BackendTag,
    earliest_run_time: u64,
    latest_run_time: u64,
    num_failures: u32,
    required: ConstraintSet,
    satisfied: ConstraintSet,
    content_changes: Option<ContentChanges>,
}

impl JobRecord {
    /// Record for a freshly scheduled job, with its window anchored at `now`.
    pub fn new(spec: impl Into<Arc<JobSpec>>, backend: BackendTag, now: u64) -> Self {
        let spec = spec.into();
        let (earliest, latest) = match spec.execution() {
            Execution::Periodic { interval, flex } => {
                let earliest = bound_after(now, *interval);
                (earliest, bound_after(earliest, *flex))
            }
            Execution::OneOff {
                min_latency,
                deadline,
            } => (
                min_latency.map_or(NO_EARLIEST_RUNTIME, |d| bound_after(now, d)),
                deadline.map_or(NO_LATEST_RUNTIME, |d| bound_after(now, d)),
            ),
        };
        Self::with_window(spec, backend, earliest, latest, 0)
    }

    /// Record with an explicitly supplied window.
    ///
    /// Used when the window cannot be derived from the job declaration, such as after a
    /// reschedule or a load from disk.
    pub fn with_window(
        spec: impl Into<Arc<JobSpec>>,
        backend: BackendTag,
        earliest_run_time: u64,
        latest_run_time: u64,
        num_failures: u32,
    ) -> Self {
        let spec = spec.into();
        let mut required = spec.declared_constraints();
        if earliest_run_time != NO_EARLIEST_RUNTIME {
            required.insert(Constraint::TimingDelay);
        }
        if latest_run_time != NO_LATEST_RUNTIME {
            required.insert(Constraint::Deadline);
        }
        let content_changes = spec
            .content_triggers()
            .map(|_| ContentChanges::default());
        Self {
            spec,
            backend,
            earliest_run_time,
            latest_run_time,
            num_failures,
            required,
            satisfied: ConstraintSet::EMPTY,
            content_changes,
        }
    }

    /// Successor record sharing this record's spec and backend.
    ///
    /// Environment satisfaction carries over since observers only report
    /// transitions. Clock-driven bits and content triggers start fresh.
    pub(crate) fn successor(&self, earliest: u64, latest: u64, num_failures: u32) -> Self {
        let mut next = Self::with_window(
            Arc::clone(&self.spec),
            self.backend,
            earliest,
            latest,
            num_failures,
        );
        next.satisfied = self
            .satisfied
            .intersection(ConstraintSet::CARRIED_ON_RESCHEDULE);
        next
    }

    pub fn id(&self) -> JobId {
        self.spec.id()
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    pub fn backend(&self) -> BackendTag {
        self.backend
    }

    /// Hand the record to a different backend.
    pub fn set_backend(&mut self, backend: BackendTag) {
        self.backend = backend;
    }

    pub fn earliest_run_time(&self) -> u64 {
        self.earliest_run_time
    }

    pub fn latest_run_time(&self) -> u64 {
        self.latest_run_time
    }

    pub fn num_failures(&self) -> u32 {
        self.num_failures
    }

    pub fn is_persisted(&self) -> bool {
        self.spec.is_persisted()
    }

    pub fn is_periodic(&self) -> bool {
        self.spec.is_periodic()
    }

    pub fn required_constraints(&self) -> ConstraintSet {
        self.required
    }

    pub fn satisfied_constraints(&self) -> ConstraintSet {
        self.satisfied
    }

    pub fn has_timing_delay_constraint(&self) -> bool {
        self.required.contains(Constraint::TimingDelay)
    }

    pub fn has_deadline_constraint(&self) -> bool {
        self.required.contains(Constraint::Deadline)
    }

    /// Record whether `constraint` currently holds. Returns whether it changed.
    pub fn set_constraint_satisfied(&mut self, constraint: Constraint, state: bool) -> bool {
        self.satisfied.set(constraint, state)
    }

    /// Set the timing-delay and deadline bits from this record's own bounds.
    ///
    /// Returns whether either bit changed.
    pub fn refresh_time_constraints(&mut self, now: u64) -> bool {
        let mut changed = false;
        if self.has_timing_delay_constraint() {
            changed |= self
                .satisfied
                .set(Constraint::TimingDelay, now >= self.earliest_run_time);
        }
        if self.has_deadline_constraint() {
            changed |= self
                .satisfied
                .set(Constraint::Deadline, now >= self.latest_run_time);
        }
        changed
    }

    /// Required constraints that count toward ordinary readiness.
    fn constraints_of_interest(&self) -> ConstraintSet {
        self.required.difference(ConstraintSet::NOT_OF_INTEREST)
    }

    /// Whether every required constraint other than the deadline is met.
    pub fn are_constraints_satisfied(&self) -> bool {
        self.constraints_of_interest()
            .is_subset(self.satisfied.difference(ConstraintSet::NOT_OF_INTEREST))
    }

    /// Whether an expired deadline makes this job ready on its own.
    ///
    /// Never true for periodic jobs: their latest bound only shapes the next
    /// window and is not a caller-visible deadline.
    pub fn is_deadline_satisfied(&self) -> bool {
        !self.is_periodic()
            && self.has_deadline_constraint()
            && self.satisfied.contains(Constraint::Deadline)
    }

    pub fn is_ready(&self) -> bool {
        self.are_constraints_satisfied() || self.is_deadline_satisfied()
    }

    /// Required constraints that are not yet satisfied.
    pub fn unsatisfied_constraints(&self) -> ConstraintSet {
        self.required.difference(self.satisfied)
    }

    pub fn content_changes(&self) -> Option<&ContentChanges> {
        self.content_changes.as_ref()
    }

    /// Note a change to a watched URI. Ignored for jobs without triggers.
    ///
    /// Returns whether the change was recorded.
    pub fn record_content_change(&mut self, uri: &str, authority: &str) -> bool {
        let Some(changes) = self.content_changes.as_mut() else {
            return false;
        };
        changes.authorities.insert(authority.to_string());
        if let Some(uris) = changes.uris.as_mut() {
            uris.insert(uri.to_string());
            if uris.len() > MAX_TRACKED_CONTENT_CHANGES {
                changes.uris = None;
            }
        }
        true
    }
}

impl Default for ContentChanges {
    fn default() -> Self {
        Self {
            uris: Some(BTreeSet::new()),
            authorities: BTreeSet::new(),
        }
    }
}

/// Elapsed bound `delay` after `now`, never colliding with the sentinels.
pub(crate) fn bound_after(now: u64, delay: Duration) -> u64 {
    now.saturating_add(duration_millis(delay))
        .clamp(NO_EARLIEST_RUNTIME + 1, NO_LATEST_RUNTIME - 1)
}
