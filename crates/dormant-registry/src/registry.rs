//! The authoritative job map.
//!
//! Every mutation runs under one registry-wide lock for its whole
//! read-modify-write sequence. Durability is delegated to a [`WriteBehind`]
//! worker, so callers never wait on disk.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::RegistryError;
use crate::clock::Clock;
use crate::codec;
use crate::config::RegistryConfig;
use crate::constraints::Constraint;
use crate::record::JobRecord;
use crate::reschedule;
use crate::store::SnapshotStore;
use crate::types::{BackendTag, JobId};
use crate::writer::{SnapshotSource, WriteBehind, WriteStats};

struct Shared {
    jobs: Mutex<BTreeMap<JobId, JobRecord>>,
    clock: Arc<dyn Clock>,
}

impl SnapshotSource for Shared {
    fn snapshot(&self) -> Result<Vec<u8>, RegistryError> {
        let jobs = self.jobs.lock();
        codec::encode(jobs.values(), self.clock.as_ref())
    }
}

/// In-memory job registry with write-behind persistence.
pub struct JobRegistry {
    shared: Arc<Shared>,
    writer: WriteBehind,
    config: RegistryConfig,
}

impl JobRegistry {
    /// Load whatever `store` holds and start the write-behind worker.
    ///
    /// Never fails: an unreadable store or document yields an empty registry,
    /// and corrupt entries are skipped. Must be called inside a tokio runtime.
    pub async fn open(
        config: RegistryConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        let mut jobs = BTreeMap::new();

        match store.load().await {
            Ok(Some(bytes)) => {
                let decoded = codec::decode(&bytes, clock.as_ref());
                let mut dropped = 0usize;
                for record in decoded.records {
                    if jobs.len() >= config.max_jobs && !jobs.contains_key(&record.id()) {
                        dropped += 1;
                        continue;
                    }
                    jobs.insert(record.id(), record);
                }
                if dropped > 0 {
                    warn!(
                        dropped,
                        max_jobs = config.max_jobs,
                        "persisted jobs exceed the job limit, dropping the excess"
                    );
                }
                info!(
                    loaded = jobs.len(),
                    skipped = decoded.skipped,
                    "loaded persisted jobs"
                );
            }
            Ok(None) => debug!("no job document yet, starting empty"),
            Err(e) => warn!(error = %e, "could not read job document, starting empty"),
        }

        let shared = Arc::new(Shared {
            jobs: Mutex::new(jobs),
            clock,
        });
        let writer = WriteBehind::spawn(shared.clone(), store);

        Self {
            shared,
            writer,
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn clock(&self) -> &dyn Clock {
        self.shared.clock.as_ref()
    }

    /// Current elapsed time according to the registry's clock.
    pub fn now(&self) -> u64 {
        self.shared.clock.elapsed_millis()
    }

    /// Admit `record`, replacing any record with the same id.
    ///
    /// Fails with [`RegistryError::CapacityExceeded`] when the id is new and
    /// the registry is already full.
    #[tracing::instrument(skip(self, record), fields(job_id = %record.id(), backend = %record.backend()))]
    pub fn register(&self, record: JobRecord) -> Result<(), RegistryError> {
        let id = record.id();
        let mut jobs = self.shared.jobs.lock();

        if !jobs.contains_key(&id) && jobs.len() >= self.config.max_jobs {
            warn!(max = self.config.max_jobs, "job limit reached, rejecting");
            return Err(RegistryError::CapacityExceeded {
                max: self.config.max_jobs,
            });
        }

        let persisted = record.is_persisted();
        let replaced = jobs.insert(id, record);
        if persisted || replaced.as_ref().is_some_and(JobRecord::is_persisted) {
            self.writer.request();
        }

        info!(replaced = replaced.is_some(), persisted, "registered job");
        Ok(())
    }

    /// Remove a job. Returns the removed record, if there was one.
    #[tracing::instrument(skip(self))]
    pub fn cancel(&self, id: JobId) -> Option<JobRecord> {
        let mut jobs = self.shared.jobs.lock();
        let removed = jobs.remove(&id)?;
        if removed.is_persisted() {
            self.writer.request();
        }
        info!("cancelled job");
        Some(removed)
    }

    /// Remove every job. Always writes, even when already empty.
    #[tracing::instrument(skip(self))]
    pub fn cancel_all(&self) -> Vec<JobRecord> {
        let mut jobs = self.shared.jobs.lock();
        let removed: Vec<JobRecord> = std::mem::take(&mut *jobs).into_values().collect();
        self.writer.request();
        info!(count = removed.len(), "cancelled all jobs");
        removed
    }

    pub fn get(&self, id: JobId) -> Option<JobRecord> {
        self.shared.jobs.lock().get(&id).cloned()
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.shared.jobs.lock().contains_key(&id)
    }

    /// Every record, ordered by id.
    pub fn all(&self) -> Vec<JobRecord> {
        self.shared.jobs.lock().values().cloned().collect()
    }

    pub fn all_for_backend(&self, backend: BackendTag) -> Vec<JobRecord> {
        self.shared
            .jobs
            .lock()
            .values()
            .filter(|record| record.backend() == backend)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shared.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.jobs.lock().is_empty()
    }

    /// Report a constraint transition for one job.
    ///
    /// Returns whether anything changed; `false` for unknown ids.
    pub fn set_constraint_satisfied(&self, id: JobId, constraint: Constraint, state: bool) -> bool {
        let mut jobs = self.shared.jobs.lock();
        let Some(record) = jobs.get_mut(&id) else {
            return false;
        };
        let changed = record.set_constraint_satisfied(constraint, state);
        if changed {
            debug!(job_id = %id, %constraint, state, "constraint changed");
        }
        changed
    }

    /// Report a constraint transition to every job that requires it.
    ///
    /// Returns the ids whose state actually changed.
    pub fn set_constraint_satisfied_for_all(&self, constraint: Constraint, state: bool) -> Vec<JobId> {
        let mut jobs = self.shared.jobs.lock();
        let changed: Vec<JobId> = jobs
            .values_mut()
            .filter(|record| record.required_constraints().contains(constraint))
            .filter_map(|record| {
                record
                    .set_constraint_satisfied(constraint, state)
                    .then(|| record.id())
            })
            .collect();
        debug!(%constraint, state, changed = changed.len(), "broadcast constraint change");
        changed
    }

    /// Note a content change for a content-triggered job.
    ///
    /// Returns `false` if the job is unknown or has no triggers.
    pub fn record_content_change(&self, id: JobId, uri: &str, authority: &str) -> bool {
        let mut jobs = self.shared.jobs.lock();
        jobs.get_mut(&id)
            .is_some_and(|record| record.record_content_change(uri, authority))
    }

    /// Set the timing-delay and deadline bits of every job as of `now`.
    ///
    /// Bounds are compared and readiness is read in the same critical
    /// section, so a record replaced concurrently is judged by its own
    /// window. Returns the jobs that are ready afterwards.
    pub fn refresh_time_constraints(&self, now: u64) -> Vec<JobId> {
        let mut jobs = self.shared.jobs.lock();
        let mut changed = 0usize;
        let mut ready = Vec::new();
        for record in jobs.values_mut() {
            if record.refresh_time_constraints(now) {
                changed += 1;
            }
            if record.is_ready() {
                ready.push(record.id());
            }
        }
        debug!(now, changed, ready = ready.len(), "refreshed time constraints");
        ready
    }

    /// Records that are ready to run right now.
    pub fn ready_jobs(&self) -> Vec<JobRecord> {
        self.shared
            .jobs
            .lock()
            .values()
            .filter(|record| record.is_ready())
            .cloned()
            .collect()
    }

    /// Apply the outcome of a finished run.
    ///
    /// Returns the rescheduled record, or `None` if the job is gone (unknown
    /// id, or a one-off that succeeded).
    #[tracing::instrument(skip(self))]
    pub fn on_job_completed(&self, id: JobId, needs_reschedule: bool) -> Option<JobRecord> {
        let mut jobs = self.shared.jobs.lock();
        let Some(finished) = jobs.remove(&id) else {
            debug!("completion for unknown job, ignoring");
            return None;
        };

        let now = self.shared.clock.elapsed_millis();
        let next = reschedule::next_record(&finished, needs_reschedule, now);

        let persisted = finished.is_persisted();
        if let Some(next) = &next {
            jobs.insert(id, next.clone());
        }
        if persisted {
            self.writer.request();
        }

        match &next {
            Some(next) => info!(
                failures = next.num_failures(),
                earliest = next.earliest_run_time(),
                latest = next.latest_run_time(),
                "job rescheduled"
            ),
            None => info!("job finished"),
        }
        next
    }

    /// Move a job to a different backend.
    ///
    /// Returns `false` for unknown ids.
    pub fn reassign_backend(&self, id: JobId, backend: BackendTag) -> bool {
        let mut jobs = self.shared.jobs.lock();
        let Some(record) = jobs.get_mut(&id) else {
            return false;
        };
        if record.backend() == backend {
            return true;
        }
        info!(job_id = %id, from = %record.backend(), to = %backend, "reassigning job backend");
        record.set_backend(backend);
        if record.is_persisted() {
            self.writer.request();
        }
        true
    }

    /// Wait until a write reflecting the current state has reached the store.
    pub async fn flush(&self) -> Result<(), RegistryError> {
        self.writer.flush().await
    }

    /// Drain any pending write and stop the worker.
    ///
    /// Mutations keep working afterwards but are no longer persisted.
    pub async fn shutdown(&self) {
        self.writer.shutdown().await;
    }

    pub fn write_stats(&self) -> WriteStats {
        self.writer.stats()
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.len())
            .field("config", &self.config)
            .field("writer", &self.writer)
            .finish()
    }
}
