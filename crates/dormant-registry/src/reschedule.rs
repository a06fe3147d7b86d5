//! What a job turns into once it finishes running.
//!
//! These functions are pure: they take the finished record and the current
//! elapsed time and build the successor. [`JobRegistry::on_job_completed`]
//! applies them under the registry lock.
//!
//! [`JobRegistry::on_job_completed`]: crate::JobRegistry::on_job_completed

use tracing::debug;

use crate::backoff::next_delay;
use crate::clock::duration_millis;
use crate::record::{JobRecord, NO_LATEST_RUNTIME, bound_after};

/// Successor of a finished job, or `None` if it is done for good.
pub fn next_record(record: &JobRecord, needs_reschedule: bool, now: u64) -> Option<JobRecord> {
    if needs_reschedule {
        Some(for_failure(record, now))
    } else if record.is_periodic() {
        Some(for_periodic(record, now))
    } else {
        None
    }
}

/// Retry after a failed run.
///
/// The retry waits out the backoff delay and has no deadline, so a retried
/// job is never deadline-bound.
pub fn for_failure(record: &JobRecord, now: u64) -> JobRecord {
    let backoff = record.spec().backoff();
    let attempt = record.num_failures().saturating_add(1);
    let delay = next_delay(backoff.initial_delay, backoff.policy, attempt);
    let earliest = bound_after(now, delay);

    debug!(
        job_id = %record.id(),
        attempt,
        delay_ms = duration_millis(delay),
        "rescheduling failed job with backoff"
    );

    record.successor(earliest, NO_LATEST_RUNTIME, attempt)
}

/// Re-arm a periodic job after a successful run.
///
/// Whatever remained of the current window is carried into the next one, but
/// only while the record still has its deadline bit. A record that came out of
/// [`for_failure`] has none, so a periodic job re-armed after a failure starts
/// its next window at `now`.
pub fn for_periodic(record: &JobRecord, now: u64) -> JobRecord {
    let interval = duration_millis(record.spec().interval().unwrap_or_default());
    let slack = if record.has_deadline_constraint() {
        record.latest_run_time().saturating_sub(now)
    } else {
        0
    };
    let earliest = now.saturating_add(slack).max(1);
    let latest = earliest.saturating_add(interval).min(NO_LATEST_RUNTIME - 1);

    debug!(
        job_id = %record.id(),
        slack_ms = slack,
        earliest,
        latest,
        "re-arming periodic job"
    );

    record.successor(earliest, latest, 0)
}
