//! Glue between the registry and the configured wake-up backends.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::RegistryError;
use crate::backend::{BackendCapabilities, ScheduleOutcome, WakeBackend, select_backend};
use crate::job::JobSpec;
use crate::record::JobRecord;
use crate::registry::JobRegistry;
use crate::types::{BackendTag, JobId};

struct Configured {
    capabilities: BackendCapabilities,
    backend: Arc<dyn WakeBackend>,
}

/// Routes jobs between the registry and the backend that owns each one.
pub struct Dispatcher {
    registry: Arc<JobRegistry>,
    backends: BTreeMap<BackendTag, Configured>,
}

impl Dispatcher {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self {
            registry,
            backends: BTreeMap::new(),
        }
    }

    /// Configure a backend. Replaces any backend with the same tag.
    pub fn add_backend(
        &mut self,
        capabilities: BackendCapabilities,
        backend: Arc<dyn WakeBackend>,
    ) -> Result<(), RegistryError> {
        if capabilities.tag != backend.tag() {
            return Err(RegistryError::invalid(format!(
                "capabilities for {} given to the {} backend",
                capabilities.tag,
                backend.tag()
            )));
        }
        self.backends.insert(
            capabilities.tag,
            Configured {
                capabilities,
                backend,
            },
        );
        Ok(())
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// The backend configured for `tag`.
    pub fn backend(&self, tag: BackendTag) -> Result<&Arc<dyn WakeBackend>, RegistryError> {
        self.backends
            .get(&tag)
            .map(|configured| &configured.backend)
            .ok_or_else(|| RegistryError::invalid(format!("backend {tag} is not configured")))
    }

    fn capabilities(&self) -> Vec<BackendCapabilities> {
        self.backends
            .values()
            .map(|configured| configured.capabilities.clone())
            .collect()
    }

    /// Admit `spec` and hand it to the best backend.
    ///
    /// If the backend refuses, the registry goes back to what it held before:
    /// a job this call replaced is restored (and stays with its old backend),
    /// otherwise the new job is removed again. The old backend is only told
    /// to cancel once the new one has accepted.
    #[tracing::instrument(skip(self, spec), fields(job_id = %spec.id()))]
    pub async fn schedule(&self, spec: JobSpec) -> Result<ScheduleOutcome, RegistryError> {
        let id = spec.id();
        let tag = select_backend(&spec, &self.capabilities()).ok_or_else(|| {
            RegistryError::invalid(format!("no configured backend can run job {id}"))
        })?;
        let backend = self.backend(tag)?;

        let record = JobRecord::new(spec, tag, self.registry.now());
        let previous = self.registry.get(id);
        self.registry.register(record.clone())?;

        let outcome = backend.schedule(&record).await;
        match &outcome {
            ScheduleOutcome::Success => {
                info!(backend = %tag, "job handed to backend");
                if let Some(previous) = previous.filter(|previous| previous.backend() != tag) {
                    if let Ok(old) = self.backend(previous.backend()) {
                        old.cancel(id).await;
                    }
                }
            }
            ScheduleOutcome::Failure { reason } => {
                warn!(backend = %tag, %reason, "backend refused job");
                match previous {
                    Some(previous) => {
                        info!(backend = %previous.backend(), "restoring the job it replaced");
                        self.registry.register(previous)?;
                    }
                    None => {
                        self.registry.cancel(id);
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// Remove a job from the registry and from its backend.
    ///
    /// Returns whether the job existed.
    pub async fn cancel(&self, id: JobId) -> Result<bool, RegistryError> {
        let Some(removed) = self.registry.cancel(id) else {
            return Ok(false);
        };
        self.backend(removed.backend())?.cancel(id).await;
        Ok(true)
    }

    pub async fn cancel_all(&self) {
        let removed = self.registry.cancel_all();
        for configured in self.backends.values() {
            configured.backend.cancel_all().await;
        }
        info!(count = removed.len(), "cancelled every job on every backend");
    }

    /// Report a finished run and hand any successor back to its backend.
    ///
    /// Returns the successor the backend accepted. A successor the backend
    /// refuses is removed from the registry, the same as a refused new job.
    #[tracing::instrument(skip(self))]
    pub async fn job_finished(
        &self,
        id: JobId,
        needs_reschedule: bool,
    ) -> Result<Option<JobRecord>, RegistryError> {
        let Some(next) = self.registry.on_job_completed(id, needs_reschedule) else {
            return Ok(None);
        };
        let outcome = self.backend(next.backend())?.schedule(&next).await;
        match outcome {
            ScheduleOutcome::Success => Ok(Some(next)),
            ScheduleOutcome::Failure { reason } => {
                warn!(backend = %next.backend(), %reason, "backend refused rescheduled job, removing it");
                self.registry.cancel(id);
                Ok(None)
            }
        }
    }

    /// Hand every registered job to its backend, typically after loading.
    ///
    /// Jobs whose backend is no longer configured are moved to a backend that
    /// is. Jobs no configured backend can run, and jobs the backend refuses,
    /// are dropped. Returns how many jobs were handed over successfully.
    pub async fn restore_all(&self) -> usize {
        let capabilities = self.capabilities();
        let mut restored = 0;

        for record in self.registry.all() {
            let id = record.id();
            let tag = if self.backends.contains_key(&record.backend()) {
                record.backend()
            } else {
                match select_backend(record.spec(), &capabilities) {
                    Some(tag) => {
                        self.registry.reassign_backend(id, tag);
                        tag
                    }
                    None => {
                        warn!(job_id = %id, backend = %record.backend(), "no backend can run restored job, dropping");
                        self.registry.cancel(id);
                        continue;
                    }
                }
            };

            let Some(current) = self.registry.get(id) else {
                continue;
            };
            let Ok(backend) = self.backend(tag) else {
                continue;
            };
            match backend.schedule(&current).await {
                ScheduleOutcome::Success => restored += 1,
                ScheduleOutcome::Failure { reason } => {
                    warn!(job_id = %id, backend = %tag, %reason, "backend refused restored job, dropping");
                    self.registry.cancel(id);
                }
            }
        }

        info!(restored, "restored jobs to backends");
        restored
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RegistryConfig;
    use crate::store::MemoryStore;
    use crate::types::NetworkType;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Schedule(u32),
        Cancel(u32),
        CancelAll,
    }

    struct Recording {
        tag: BackendTag,
        calls: Mutex<Vec<Call>>,
        refuse: AtomicBool,
    }

    impl Recording {
        fn new(tag: BackendTag) -> Arc<Self> {
            Arc::new(Self {
                tag,
                calls: Mutex::new(Vec::new()),
                refuse: AtomicBool::new(false),
            })
        }

        fn refusing(tag: BackendTag) -> Arc<Self> {
            Arc::new(Self {
                tag,
                calls: Mutex::new(Vec::new()),
                refuse: AtomicBool::new(true),
            })
        }

        fn set_refusing(&self, refuse: bool) {
            self.refuse.store(refuse, Ordering::SeqCst);
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl WakeBackend for Recording {
        fn tag(&self) -> BackendTag {
            self.tag
        }

        async fn schedule(&self, record: &JobRecord) -> ScheduleOutcome {
            self.calls.lock().push(Call::Schedule(record.id().0));
            if self.refuse.load(Ordering::SeqCst) {
                ScheduleOutcome::Failure {
                    reason: "quota exhausted".to_string(),
                }
            } else {
                ScheduleOutcome::Success
            }
        }

        async fn cancel(&self, id: JobId) {
            self.calls.lock().push(Call::Cancel(id.0));
        }

        async fn cancel_all(&self) {
            self.calls.lock().push(Call::CancelAll);
        }
    }

    async fn registry() -> Arc<JobRegistry> {
        let clock = Arc::new(ManualClock::new(
            10_000,
            Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        ));
        Arc::new(
            JobRegistry::open(
                RegistryConfig::default(),
                clock,
                Arc::new(MemoryStore::new()),
            )
            .await,
        )
    }

    fn timed(id: u32) -> JobSpec {
        JobSpec::builder(id, "h")
            .minimum_latency(Duration::from_secs(60))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn schedule_picks_backend_and_registers() {
        let mut dispatcher = Dispatcher::new(registry().await);
        let alarm = Recording::new(BackendTag::Alarm);
        let native = Recording::new(BackendTag::Native);
        dispatcher
            .add_backend(BackendCapabilities::alarm(), alarm.clone())
            .unwrap();
        dispatcher
            .add_backend(BackendCapabilities::native(), native.clone())
            .unwrap();

        let outcome = dispatcher.schedule(timed(1)).await.unwrap();

        assert!(outcome.is_success());
        assert_eq!(native.calls(), vec![Call::Schedule(1)]);
        assert!(alarm.calls().is_empty());
        assert_eq!(
            dispatcher.registry().get(JobId(1)).unwrap().backend(),
            BackendTag::Native
        );
    }

    #[tokio::test]
    async fn unsupported_job_is_invalid() {
        let mut dispatcher = Dispatcher::new(registry().await);
        dispatcher
            .add_backend(BackendCapabilities::alarm(), Recording::new(BackendTag::Alarm))
            .unwrap();

        let spec = JobSpec::builder(1, "h")
            .network(NetworkType::Metered)
            .build()
            .unwrap();
        let err = dispatcher.schedule(spec).await.unwrap_err();

        assert!(matches!(err, RegistryError::InvalidArgument(_)));
        assert!(dispatcher.registry().is_empty());
    }

    #[tokio::test]
    async fn refused_job_is_removed_again() {
        let mut dispatcher = Dispatcher::new(registry().await);
        dispatcher
            .add_backend(
                BackendCapabilities::alarm(),
                Recording::refusing(BackendTag::Alarm),
            )
            .unwrap();

        let outcome = dispatcher.schedule(timed(1)).await.unwrap();

        assert!(!outcome.is_success());
        assert!(!dispatcher.registry().contains(JobId(1)));
    }

    #[tokio::test]
    async fn refused_replacement_restores_the_previous_job() {
        let mut dispatcher = Dispatcher::new(registry().await);
        let alarm = Recording::new(BackendTag::Alarm);
        dispatcher
            .add_backend(BackendCapabilities::alarm(), alarm.clone())
            .unwrap();
        dispatcher.schedule(timed(1)).await.unwrap();

        alarm.set_refusing(true);
        let replacement = JobSpec::builder(1, "other")
            .override_deadline(Duration::from_secs(600))
            .build()
            .unwrap();
        let outcome = dispatcher.schedule(replacement).await.unwrap();

        assert!(!outcome.is_success());
        let kept = dispatcher.registry().get(JobId(1)).unwrap();
        assert_eq!(kept.spec().handler().as_str(), "h");
        assert!(kept.has_timing_delay_constraint());
        assert_eq!(kept.backend(), BackendTag::Alarm);
        assert_eq!(alarm.calls(), vec![Call::Schedule(1), Call::Schedule(1)]);
    }

    #[tokio::test]
    async fn old_backend_keeps_a_job_the_new_backend_refused() {
        let mut dispatcher = Dispatcher::new(registry().await);
        let alarm = Recording::new(BackendTag::Alarm);
        dispatcher
            .add_backend(BackendCapabilities::alarm(), alarm.clone())
            .unwrap();
        dispatcher.schedule(timed(1)).await.unwrap();

        let push = Recording::refusing(BackendTag::Push);
        dispatcher
            .add_backend(BackendCapabilities::push(), push.clone())
            .unwrap();
        let outcome = dispatcher.schedule(timed(1)).await.unwrap();

        assert!(!outcome.is_success());
        assert_eq!(push.calls(), vec![Call::Schedule(1)]);
        assert_eq!(alarm.calls(), vec![Call::Schedule(1)]);
        assert_eq!(
            dispatcher.registry().get(JobId(1)).unwrap().backend(),
            BackendTag::Alarm
        );

        push.set_refusing(false);
        dispatcher.schedule(timed(1)).await.unwrap();
        assert_eq!(alarm.calls(), vec![Call::Schedule(1), Call::Cancel(1)]);
        assert_eq!(
            dispatcher.registry().get(JobId(1)).unwrap().backend(),
            BackendTag::Push
        );
    }

    #[tokio::test]
    async fn mismatched_capabilities_are_rejected() {
        let mut dispatcher = Dispatcher::new(registry().await);
        let err = dispatcher
            .add_backend(BackendCapabilities::native(), Recording::new(BackendTag::Alarm))
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn unconfigured_backend_lookup_is_invalid() {
        let dispatcher = Dispatcher::new(registry().await);
        assert!(matches!(
            dispatcher.backend(BackendTag::Push),
            Err(RegistryError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn failed_run_is_rescheduled_on_the_same_backend() {
        let mut dispatcher = Dispatcher::new(registry().await);
        let alarm = Recording::new(BackendTag::Alarm);
        dispatcher
            .add_backend(BackendCapabilities::alarm(), alarm.clone())
            .unwrap();
        dispatcher.schedule(timed(4)).await.unwrap();

        let next = dispatcher.job_finished(JobId(4), true).await.unwrap().unwrap();
        assert_eq!(next.num_failures(), 1);

        let done = dispatcher.job_finished(JobId(4), false).await.unwrap();
        assert!(done.is_none());
        assert_eq!(alarm.calls(), vec![Call::Schedule(4), Call::Schedule(4)]);
    }

    #[tokio::test]
    async fn refused_reschedule_is_removed_like_a_refused_job() {
        let mut dispatcher = Dispatcher::new(registry().await);
        let alarm = Recording::new(BackendTag::Alarm);
        dispatcher
            .add_backend(BackendCapabilities::alarm(), alarm.clone())
            .unwrap();
        dispatcher.schedule(timed(5)).await.unwrap();

        alarm.set_refusing(true);
        let next = dispatcher.job_finished(JobId(5), true).await.unwrap();

        assert!(next.is_none());
        assert!(!dispatcher.registry().contains(JobId(5)));
        assert_eq!(alarm.calls(), vec![Call::Schedule(5), Call::Schedule(5)]);
    }

    #[tokio::test]
    async fn cancel_reaches_the_owning_backend() {
        let mut dispatcher = Dispatcher::new(registry().await);
        let alarm = Recording::new(BackendTag::Alarm);
        let push = Recording::new(BackendTag::Push);
        dispatcher
            .add_backend(BackendCapabilities::alarm(), alarm.clone())
            .unwrap();
        dispatcher
            .add_backend(BackendCapabilities::push(), push.clone())
            .unwrap();
        dispatcher.schedule(timed(1)).await.unwrap();

        assert!(dispatcher.cancel(JobId(1)).await.unwrap());
        assert!(!dispatcher.cancel(JobId(1)).await.unwrap());
        assert_eq!(push.calls(), vec![Call::Schedule(1), Call::Cancel(1)]);

        dispatcher.cancel_all().await;
        assert_eq!(alarm.calls(), vec![Call::CancelAll]);
    }

    #[tokio::test]
    async fn restore_moves_jobs_off_missing_backends() {
        let registry = registry().await;
        let now = registry.now();
        registry
            .register(JobRecord::new(timed(1), BackendTag::Push, now))
            .unwrap();
        registry
            .register(JobRecord::new(timed(2), BackendTag::Alarm, now))
            .unwrap();
        let metered = JobSpec::builder(3, "h")
            .network(NetworkType::Metered)
            .build()
            .unwrap();
        registry
            .register(JobRecord::new(metered, BackendTag::Native, now))
            .unwrap();

        let mut dispatcher = Dispatcher::new(registry.clone());
        let alarm = Recording::new(BackendTag::Alarm);
        dispatcher
            .add_backend(BackendCapabilities::alarm(), alarm.clone())
            .unwrap();

        let restored = dispatcher.restore_all().await;

        assert_eq!(restored, 2);
        assert_eq!(alarm.calls(), vec![Call::Schedule(1), Call::Schedule(2)]);
        assert_eq!(registry.get(JobId(1)).unwrap().backend(), BackendTag::Alarm);
        assert!(!registry.contains(JobId(3)));
    }
}
