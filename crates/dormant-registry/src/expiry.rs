//! Clock-driven constraint reporting.
//!
//! The registry never looks at the clock to decide readiness. These helpers
//! compare runtime bounds against `now` and report the timing and deadline
//! bits through the same entry point environment observers use.

use crate::constraints::Constraint;
use crate::registry::JobRegistry;
use crate::types::JobId;

/// Refresh timing and deadline bits for every job as of `now`.
///
/// Returns the jobs that are ready afterwards.
pub fn refresh_time_constraints(registry: &JobRegistry, now: u64) -> Vec<JobId> {
    registry.refresh_time_constraints(now)
}

/// Soonest elapsed time at which a refresh could change some job's readiness.
///
/// Periodic latest bounds are skipped since they never make a job ready.
pub fn next_wakeup(registry: &JobRegistry) -> Option<u64> {
    registry
        .all()
        .iter()
        .flat_map(|record| {
            let satisfied = record.satisfied_constraints();
            let earliest = (record.has_timing_delay_constraint()
                && !satisfied.contains(Constraint::TimingDelay))
            .then(|| record.earliest_run_time());
            let latest = (record.has_deadline_constraint()
                && !record.is_periodic()
                && !satisfied.contains(Constraint::Deadline))
            .then(|| record.latest_run_time());
            earliest.into_iter().chain(latest)
        })
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::RegistryConfig;
    use crate::job::JobSpec;
    use crate::record::JobRecord;
    use crate::store::MemoryStore;
    use crate::types::BackendTag;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use std::time::Duration;

    const MINUTE: u64 = 60_000;

    async fn registry() -> (JobRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            MINUTE,
            Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        ));
        let registry = JobRegistry::open(
            RegistryConfig::default(),
            clock.clone(),
            Arc::new(MemoryStore::new()),
        )
        .await;
        (registry, clock)
    }

    #[tokio::test]
    async fn timing_delay_is_set_once_earliest_passes() {
        let (registry, clock) = registry().await;
        let spec = JobSpec::builder(1, "h")
            .minimum_latency(Duration::from_secs(10 * 60))
            .build()
            .unwrap();
        registry
            .register(JobRecord::new(spec, BackendTag::Alarm, clock.elapsed_millis()))
            .unwrap();

        assert!(refresh_time_constraints(&registry, 5 * MINUTE).is_empty());
        assert_eq!(next_wakeup(&registry), Some(11 * MINUTE));

        assert_eq!(refresh_time_constraints(&registry, 11 * MINUTE), vec![JobId(1)]);
        assert_eq!(next_wakeup(&registry), None);
    }

    #[tokio::test]
    async fn retried_job_waits_out_its_backoff() {
        let (registry, clock) = registry().await;
        let spec = JobSpec::builder(4, "h")
            .minimum_latency(Duration::from_secs(60))
            .build()
            .unwrap();
        registry
            .register(JobRecord::new(spec, BackendTag::Alarm, clock.elapsed_millis()))
            .unwrap();

        clock.advance(Duration::from_secs(120));
        let now = clock.elapsed_millis();
        assert_eq!(refresh_time_constraints(&registry, now), vec![JobId(4)]);

        // The run fails; the retry's window opens after the default 30s backoff.
        let retry = registry.on_job_completed(JobId(4), true).unwrap();
        assert_eq!(retry.earliest_run_time(), now + 30_000);

        assert!(refresh_time_constraints(&registry, now).is_empty());
        assert!(registry.ready_jobs().is_empty());
        assert_eq!(next_wakeup(&registry), Some(now + 30_000));
        assert_eq!(
            refresh_time_constraints(&registry, now + 30_000),
            vec![JobId(4)]
        );
    }

    #[tokio::test]
    async fn expired_deadline_makes_job_ready_despite_constraints() {
        let (registry, clock) = registry().await;
        let spec = JobSpec::builder(2, "h")
            .requires_charging(true)
            .override_deadline(Duration::from_secs(60))
            .build()
            .unwrap();
        registry
            .register(JobRecord::new(spec, BackendTag::Alarm, clock.elapsed_millis()))
            .unwrap();

        assert!(refresh_time_constraints(&registry, MINUTE).is_empty());
        assert_eq!(refresh_time_constraints(&registry, 2 * MINUTE), vec![JobId(2)]);
    }

    #[tokio::test]
    async fn periodic_latest_bound_is_not_a_wakeup() {
        let (registry, clock) = registry().await;
        let spec = JobSpec::builder(3, "h")
            .periodic(Duration::from_secs(3600))
            .build()
            .unwrap();
        let record = JobRecord::new(spec, BackendTag::Alarm, clock.elapsed_millis());
        let earliest = record.earliest_run_time();
        registry.register(record).unwrap();

        assert_eq!(next_wakeup(&registry), Some(earliest));
        refresh_time_constraints(&registry, earliest);
        assert_eq!(next_wakeup(&registry), None);
    }
}
