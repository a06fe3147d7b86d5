//! Immutable job declarations.
//!
//! A [`JobSpec`] is built through [`JobSpecBuilder`], which rejects
//! conflicting or empty declarations up front so that nothing invalid ever
//! reaches the registry.

use std::time::Duration;

use tracing::warn;

use crate::RegistryError;
use crate::backoff::MIN_BACKOFF_DELAY;
use crate::constraints::{Constraint, ConstraintSet};
use crate::types::{
    Backoff, ContentTriggers, Extras, HandlerRef, JobId, NetworkType, extras_are_finite,
    extras_depth,
};

/// Shortest period a periodic job may declare.
pub const MIN_PERIOD: Duration = Duration::from_secs(15 * 60);

/// Shortest flex window a periodic job may declare.
pub const MIN_FLEX: Duration = Duration::from_secs(5 * 60);

/// Deepest extras tree a job may carry.
pub const MAX_EXTRAS_DEPTH: usize = 8;

/// When a job is allowed to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution {
    /// Re-armed after every run.
    Periodic { interval: Duration, flex: Duration },
    /// Runs once, optionally no sooner than `min_latency` and no later than
    /// `deadline` after scheduling.
    OneOff {
        min_latency: Option<Duration>,
        deadline: Option<Duration>,
    },
}

/// Immutable declaration of a unit of background work.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    id: JobId,
    handler: HandlerRef,
    extras: Extras,
    transient_extras: Extras,
    requires_charging: bool,
    requires_idle: bool,
    requires_battery_not_low: bool,
    requires_storage_not_low: bool,
    network: NetworkType,
    content_triggers: Option<ContentTriggers>,
    execution: Execution,
    persisted: bool,
    backoff: Option<Backoff>,
}

impl JobSpec {
    /// Start declaring a job.
    pub fn builder(id: u32, handler: impl Into<String>) -> JobSpecBuilder {
        JobSpecBuilder::new(JobId(id), HandlerRef::new(handler))
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn handler(&self) -> &HandlerRef {
        &self.handler
    }

    pub fn extras(&self) -> &Extras {
        &self.extras
    }

    pub fn transient_extras(&self) -> &Extras {
        &self.transient_extras
    }

    pub fn requires_charging(&self) -> bool {
        self.requires_charging
    }

    pub fn requires_idle(&self) -> bool {
        self.requires_idle
    }

    pub fn requires_battery_not_low(&self) -> bool {
        self.requires_battery_not_low
    }

    pub fn requires_storage_not_low(&self) -> bool {
        self.requires_storage_not_low
    }

    pub fn network(&self) -> NetworkType {
        self.network
    }

    pub fn content_triggers(&self) -> Option<&ContentTriggers> {
        self.content_triggers.as_ref()
    }

    pub fn execution(&self) -> &Execution {
        &self.execution
    }

    pub fn is_periodic(&self) -> bool {
        matches!(self.execution, Execution::Periodic { .. })
    }

    /// Period of a periodic job.
    pub fn interval(&self) -> Option<Duration> {
        match self.execution {
            Execution::Periodic { interval, .. } => Some(interval),
            Execution::OneOff { .. } => None,
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    /// Effective backoff: the declared one, or [`Backoff::DEFAULT`].
    pub fn backoff(&self) -> Backoff {
        self.backoff.unwrap_or_default()
    }

    /// Whether the job declared its own backoff.
    pub fn has_custom_backoff(&self) -> bool {
        self.backoff.is_some()
    }

    /// Constraints implied by the declaration alone.
    ///
    /// Timing bits depend on the runtime window and are added by the record.
    pub fn declared_constraints(&self) -> ConstraintSet {
        let mut set = ConstraintSet::EMPTY;
        if self.requires_charging {
            set.insert(Constraint::Charging);
        }
        if self.requires_idle {
            set.insert(Constraint::Idle);
        }
        if self.requires_battery_not_low {
            set.insert(Constraint::BatteryNotLow);
        }
        if self.requires_storage_not_low {
            set.insert(Constraint::StorageNotLow);
        }
        if let Some(network) = Constraint::for_network(self.network) {
            set.insert(network);
        }
        if self.content_triggers.is_some() {
            set.insert(Constraint::ContentTrigger);
        }
        set
    }
}

/// Fluent builder for [`JobSpec`].
#[derive(Debug, Clone)]
pub struct JobSpecBuilder {
    id: JobId,
    handler: HandlerRef,
    extras: Extras,
    transient_extras: Extras,
    requires_charging: bool,
    requires_idle: bool,
    requires_battery_not_low: bool,
    requires_storage_not_low: bool,
    network: NetworkType,
    content_triggers: Option<ContentTriggers>,
    periodic: Option<(Duration, Option<Duration>)>,
    min_latency: Option<Duration>,
    deadline: Option<Duration>,
    persisted: bool,
    backoff: Option<Backoff>,
}

impl JobSpecBuilder {
    fn new(id: JobId, handler: HandlerRef) -> Self {
        Self {
            id,
            handler,
            extras: Extras::new(),
            transient_extras: Extras::new(),
            requires_charging: false,
            requires_idle: false,
            requires_battery_not_low: false,
            requires_storage_not_low: false,
            network: NetworkType::None,
            content_triggers: None,
            periodic: None,
            min_latency: None,
            deadline: None,
            persisted: false,
            backoff: None,
        }
    }

    pub fn extras(mut self, extras: Extras) -> Self {
        self.extras = extras;
        self
    }

    /// Payload that lives only in memory and is never written to disk.
    pub fn transient_extras(mut self, extras: Extras) -> Self {
        self.transient_extras = extras;
        self
    }

    pub fn requires_charging(mut self, required: bool) -> Self {
        self.requires_charging = required;
        self
    }

    pub fn requires_idle(mut self, required: bool) -> Self {
        self.requires_idle = required;
        self
    }

    pub fn requires_battery_not_low(mut self, required: bool) -> Self {
        self.requires_battery_not_low = required;
        self
    }

    pub fn requires_storage_not_low(mut self, required: bool) -> Self {
        self.requires_storage_not_low = required;
        self
    }

    pub fn network(mut self, network: NetworkType) -> Self {
        self.network = network;
        self
    }

    pub fn content_triggers(mut self, triggers: ContentTriggers) -> Self {
        self.content_triggers = Some(triggers);
        self
    }

    /// Run every `interval`, anywhere inside a flex window equal to the interval.
    pub fn periodic(mut self, interval: Duration) -> Self {
        self.periodic = Some((interval, None));
        self
    }

    /// Run every `interval`, inside a window of length `flex`.
    pub fn periodic_with_flex(mut self, interval: Duration, flex: Duration) -> Self {
        self.periodic = Some((interval, Some(flex)));
        self
    }

    pub fn minimum_latency(mut self, latency: Duration) -> Self {
        self.min_latency = Some(latency);
        self
    }

    pub fn override_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn persisted(mut self, persisted: bool) -> Self {
        self.persisted = persisted;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Validate the declaration and produce the job.
    pub fn build(self) -> Result<JobSpec, RegistryError> {
        let id = self.id;

        if self.handler.as_str().trim().is_empty() {
            return Err(RegistryError::invalid(format!(
                "job {id} must declare a handler"
            )));
        }

        if self
            .content_triggers
            .as_ref()
            .is_some_and(|triggers| triggers.uris.is_empty())
        {
            return Err(RegistryError::invalid(format!(
                "job {id} declares content triggers without any URI"
            )));
        }

        if self.periodic.is_some()
            && (self.min_latency.is_some()
                || self.deadline.is_some()
                || self.content_triggers.is_some())
        {
            return Err(RegistryError::invalid(format!(
                "periodic job {id} may not set a minimum latency, deadline or content triggers"
            )));
        }

        if self.requires_idle && self.backoff.is_some() {
            return Err(RegistryError::invalid(format!(
                "job {id} requires idle mode and therefore cannot customise backoff"
            )));
        }

        if self.persisted && self.content_triggers.is_some() {
            return Err(RegistryError::invalid(format!(
                "persisted job {id} may not use content triggers"
            )));
        }

        if self.persisted && !self.transient_extras.is_empty() {
            return Err(RegistryError::invalid(format!(
                "persisted job {id} may not carry transient extras"
            )));
        }

        if self.persisted && !extras_are_finite(&self.extras) {
            return Err(RegistryError::invalid(format!(
                "persisted job {id} carries a NaN or infinite double in its extras"
            )));
        }

        for extras in [&self.extras, &self.transient_extras] {
            let depth = extras_depth(extras);
            if depth > MAX_EXTRAS_DEPTH {
                return Err(RegistryError::invalid(format!(
                    "job {id} extras nest {depth} levels deep (max {MAX_EXTRAS_DEPTH})"
                )));
            }
        }

        let has_requirement = self.requires_charging
            || self.requires_idle
            || self.requires_battery_not_low
            || self.requires_storage_not_low
            || self.network != NetworkType::None
            || self.content_triggers.is_some();
        let has_window =
            self.periodic.is_some() || self.min_latency.is_some() || self.deadline.is_some();
        if !has_requirement && !has_window {
            return Err(RegistryError::invalid(format!(
                "job {id} declares no constraints and no timing window"
            )));
        }

        let execution = match self.periodic {
            Some((interval, flex)) => {
                let interval = clamp_period(id, interval);
                let flex = clamp_flex(id, interval, flex.unwrap_or(interval));
                Execution::Periodic { interval, flex }
            }
            None => Execution::OneOff {
                min_latency: self.min_latency,
                deadline: self.deadline,
            },
        };

        let backoff = self.backoff.map(|backoff| {
            if backoff.initial_delay < MIN_BACKOFF_DELAY {
                warn!(
                    job_id = %id,
                    requested_ms = backoff.initial_delay.as_millis() as u64,
                    "initial backoff below minimum, clamping"
                );
                Backoff::new(backoff.policy, MIN_BACKOFF_DELAY)
            } else {
                backoff
            }
        });

        Ok(JobSpec {
            id,
            handler: self.handler,
            extras: self.extras,
            transient_extras: self.transient_extras,
            requires_charging: self.requires_charging,
            requires_idle: self.requires_idle,
            requires_battery_not_low: self.requires_battery_not_low,
            requires_storage_not_low: self.requires_storage_not_low,
            network: self.network,
            content_triggers: self.content_triggers,
            execution,
            persisted: self.persisted,
            backoff,
        })
    }
}

fn clamp_period(id: JobId, interval: Duration) -> Duration {
    if interval < MIN_PERIOD {
        warn!(
            job_id = %id,
            requested_ms = interval.as_millis() as u64,
            minimum_ms = MIN_PERIOD.as_millis() as u64,
            "periodic interval below minimum, clamping"
        );
        MIN_PERIOD
    } else {
        interval
    }
}

fn clamp_flex(id: JobId, interval: Duration, flex: Duration) -> Duration {
    let clamped = flex.clamp(MIN_FLEX, interval);
    if clamped != flex {
        warn!(
            job_id = %id,
            requested_ms = flex.as_millis() as u64,
            clamped_ms = clamped.as_millis() as u64,
            "periodic flex outside [minimum, interval], clamping"
        );
    }
    clamped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExtraValue, TriggerContentUri};
    use proptest::prelude::*;
    use test_case::test_case;

    fn triggers() -> ContentTriggers {
        ContentTriggers::new(vec![TriggerContentUri::new(
            "content://media/photos",
            TriggerContentUri::FLAG_NOTIFY_FOR_DESCENDANTS,
        )])
    }

    fn nested(depth: usize) -> Extras {
        let mut extras = Extras::new();
        if depth == 1 {
            extras.insert("leaf".to_string(), ExtraValue::Bool(true));
        } else {
            extras.insert("child".to_string(), ExtraValue::Nested(nested(depth - 1)));
        }
        extras
    }

    #[test]
    fn periodic_zero_interval_is_clamped_to_minimum() {
        let spec = JobSpec::builder(1, "sync")
            .periodic(Duration::ZERO)
            .build()
            .unwrap();
        assert_eq!(spec.interval(), Some(MIN_PERIOD));
    }

    #[test]
    fn flex_defaults_to_interval() {
        let spec = JobSpec::builder(1, "sync")
            .periodic(Duration::from_secs(3600))
            .build()
            .unwrap();
        assert_eq!(
            spec.execution(),
            &Execution::Periodic {
                interval: Duration::from_secs(3600),
                flex: Duration::from_secs(3600),
            }
        );
    }

    #[test]
    fn flex_is_clamped_into_range() {
        let small = JobSpec::builder(1, "sync")
            .periodic_with_flex(Duration::from_secs(3600), Duration::from_secs(1))
            .build()
            .unwrap();
        assert!(matches!(small.execution(), Execution::Periodic { flex, .. } if *flex == MIN_FLEX));

        let large = JobSpec::builder(1, "sync")
            .periodic_with_flex(Duration::from_secs(3600), Duration::from_secs(7200))
            .build()
            .unwrap();
        assert!(
            matches!(large.execution(), Execution::Periodic { flex, .. } if *flex == Duration::from_secs(3600))
        );
    }

    #[test]
    fn missing_handler_is_rejected() {
        let err = JobSpec::builder(1, "  ")
            .requires_charging(true)
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidArgument(_)));
    }

    #[test]
    fn periodic_rejects_one_off_fields() {
        let cases = [
            JobSpec::builder(1, "h")
                .periodic(MIN_PERIOD)
                .minimum_latency(Duration::from_secs(1)),
            JobSpec::builder(1, "h")
                .periodic(MIN_PERIOD)
                .override_deadline(Duration::from_secs(1)),
            JobSpec::builder(1, "h")
                .periodic(MIN_PERIOD)
                .content_triggers(triggers()),
        ];
        for builder in cases {
            assert!(matches!(
                builder.build(),
                Err(RegistryError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn idle_jobs_cannot_customise_backoff() {
        let err = JobSpec::builder(1, "h")
            .requires_idle(true)
            .backoff(Backoff::linear(Duration::from_secs(60)))
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidArgument(_)));

        let spec = JobSpec::builder(1, "h").requires_idle(true).build().unwrap();
        assert!(!spec.has_custom_backoff());
        assert_eq!(spec.backoff(), Backoff::DEFAULT);
    }

    #[test]
    fn persisted_jobs_reject_content_triggers_and_transient_extras() {
        let with_triggers = JobSpec::builder(1, "h")
            .persisted(true)
            .content_triggers(triggers())
            .build();
        assert!(with_triggers.is_err());

        let mut transient = Extras::new();
        transient.insert("k".to_string(), ExtraValue::Long(1));
        let with_transient = JobSpec::builder(1, "h")
            .persisted(true)
            .requires_charging(true)
            .transient_extras(transient.clone())
            .build();
        assert!(with_transient.is_err());

        let not_persisted = JobSpec::builder(1, "h")
            .requires_charging(true)
            .transient_extras(transient)
            .build();
        assert!(not_persisted.is_ok());
    }

    #[test]
    fn empty_content_trigger_list_is_rejected() {
        let err = JobSpec::builder(1, "h")
            .content_triggers(ContentTriggers::new(Vec::new()))
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidArgument(_)));
    }

    #[test_case(ExtraValue::Double(f64::NAN) ; "nan")]
    #[test_case(ExtraValue::Double(f64::NEG_INFINITY) ; "negative infinity")]
    #[test_case(ExtraValue::DoubleArray(vec![1.0, f64::INFINITY]) ; "infinite array element")]
    fn persisted_extras_must_be_finite(value: ExtraValue) {
        let mut extras = Extras::new();
        extras.insert("ratio".to_string(), value);

        let persisted = JobSpec::builder(1, "h")
            .persisted(true)
            .requires_charging(true)
            .extras(extras.clone())
            .build();
        assert!(matches!(persisted, Err(RegistryError::InvalidArgument(_))));

        let in_memory = JobSpec::builder(1, "h")
            .requires_charging(true)
            .extras(extras)
            .build();
        assert!(in_memory.is_ok());
    }

    #[test]
    fn extras_depth_is_bounded() {
        let ok = JobSpec::builder(1, "h")
            .requires_charging(true)
            .extras(nested(MAX_EXTRAS_DEPTH))
            .build();
        assert!(ok.is_ok());

        let too_deep = JobSpec::builder(1, "h")
            .requires_charging(true)
            .extras(nested(MAX_EXTRAS_DEPTH + 1))
            .build();
        assert!(too_deep.is_err());
    }

    #[test]
    fn small_initial_backoff_is_clamped() {
        let spec = JobSpec::builder(1, "h")
            .requires_charging(true)
            .backoff(Backoff::linear(Duration::from_millis(5)))
            .build()
            .unwrap();
        assert_eq!(spec.backoff().initial_delay, MIN_BACKOFF_DELAY);
    }

    #[test]
    fn declared_constraints_cover_requirements() {
        let spec = JobSpec::builder(1, "h")
            .requires_charging(true)
            .requires_storage_not_low(true)
            .network(NetworkType::Unmetered)
            .content_triggers(triggers())
            .build()
            .unwrap();
        assert_eq!(
            spec.declared_constraints(),
            ConstraintSet::of(&[
                Constraint::Charging,
                Constraint::StorageNotLow,
                Constraint::UnmeteredNetwork,
                Constraint::ContentTrigger,
            ])
        );
    }

    proptest! {
        #[test]
        fn any_interval_below_minimum_clamps(secs in 0u64..(15 * 60)) {
            let spec = JobSpec::builder(7, "h")
                .periodic(Duration::from_secs(secs))
                .build()
                .unwrap();
            prop_assert_eq!(spec.interval(), Some(MIN_PERIOD));
        }

        #[test]
        fn intervals_at_or_above_minimum_are_kept(secs in (15 * 60u64)..(7 * 24 * 3600)) {
            let spec = JobSpec::builder(7, "h")
                .periodic(Duration::from_secs(secs))
                .build()
                .unwrap();
            prop_assert_eq!(spec.interval(), Some(Duration::from_secs(secs)));
        }

        #[test]
        fn no_constraints_and_no_window_is_rejected(
            id in any::<u32>(),
            persisted in any::<bool>(),
            extras_value in any::<i64>(),
        ) {
            let mut extras = Extras::new();
            extras.insert("value".to_string(), ExtraValue::Long(extras_value));
            let result = JobSpec::builder(id, "handler")
                .persisted(persisted)
                .extras(extras)
                .network(NetworkType::None)
                .build();
            prop_assert!(matches!(result, Err(RegistryError::InvalidArgument(_))));
        }
    }
}
