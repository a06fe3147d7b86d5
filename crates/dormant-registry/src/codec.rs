//! On-disk document format for persisted jobs.
//!
//! The document is JSON with a top-level schema version. Runtime bounds are
//! written as wall-clock timestamps, since elapsed time restarts at boot, and
//! translated back against the loading process's clocks. Satisfaction state
//! and failure counts are not written; a loaded job starts fresh.
//!
//! Loading never fails outright: a bad version or unreadable document loads as
//! empty, and a bad entry is skipped.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::RegistryError;
use crate::clock::Clock;
use crate::job::{Execution, JobSpec};
use crate::record::{JobRecord, NO_EARLIEST_RUNTIME, NO_LATEST_RUNTIME};
use crate::types::{Backoff, BackendTag, Extras, HandlerRef, JobId, NetworkType, millis};

/// Schema version written by this build.
pub const DOCUMENT_VERSION: u64 = 1;

/// Result of decoding a document.
#[derive(Debug, Default)]
pub struct DecodedJobs {
    pub records: Vec<JobRecord>,
    /// Entries dropped because they could not be read or failed validation.
    pub skipped: usize,
    /// Whether the document as a whole was rejected.
    pub rejected: bool,
}

#[derive(Debug, Serialize)]
struct Document {
    version: u64,
    jobs: Vec<PersistedJob>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedJob {
    id: JobId,
    handler: HandlerRef,
    persisted: bool,
    backend: BackendTag,
    #[serde(default)]
    requires: PersistedRequirements,
    execution: PersistedExecution,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    earliest_run_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    latest_run_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    backoff: Option<Backoff>,
    #[serde(default, skip_serializing_if = "Extras::is_empty")]
    extras: Extras,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedRequirements {
    #[serde(default, skip_serializing_if = "is_false")]
    charging: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    idle: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    battery_not_low: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    storage_not_low: bool,
    #[serde(default)]
    network: NetworkType,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum PersistedExecution {
    Periodic {
        #[serde(rename = "interval_ms", with = "millis")]
        interval: Duration,
        #[serde(rename = "flex_ms", with = "millis")]
        flex: Duration,
    },
    OneOff,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Serialize the persisted subset of `records`.
///
/// Non-persisted records are left out.
pub fn encode<'a>(
    records: impl IntoIterator<Item = &'a JobRecord>,
    clock: &dyn Clock,
) -> Result<Vec<u8>, RegistryError> {
    let now_elapsed = clock.elapsed_millis();
    let now_wall = clock.wall_clock();

    let jobs = records
        .into_iter()
        .filter(|record| record.is_persisted())
        .map(|record| to_persisted(record, now_elapsed, now_wall))
        .collect();

    let document = Document {
        version: DOCUMENT_VERSION,
        jobs,
    };
    Ok(serde_json::to_vec_pretty(&document)?)
}

/// Read records back from a document.
pub fn decode(bytes: &[u8], clock: &dyn Clock) -> DecodedJobs {
    let document: Value = match serde_json::from_slice(bytes) {
        Ok(document) => document,
        Err(e) => {
            warn!(error = %e, "job document is unreadable, starting empty");
            return rejected();
        }
    };

    let version = document.get("version").and_then(Value::as_u64);
    if version != Some(DOCUMENT_VERSION) {
        warn!(
            found = ?version,
            expected = DOCUMENT_VERSION,
            "job document version mismatch, starting empty"
        );
        return rejected();
    }

    let Some(entries) = document.get("jobs").and_then(Value::as_array) else {
        warn!("job document has no job list, starting empty");
        return rejected();
    };

    let now_elapsed = clock.elapsed_millis();
    let now_wall = clock.wall_clock();
    let mut decoded = DecodedJobs::default();

    for (index, entry) in entries.iter().enumerate() {
        let result = PersistedJob::deserialize(entry)
            .map_err(RegistryError::from)
            .and_then(|job| from_persisted(job, now_elapsed, now_wall));
        match result {
            Ok(record) => decoded.records.push(record),
            Err(e) => {
                warn!(index, error = %e, "skipping corrupt job entry");
                decoded.skipped += 1;
            }
        }
    }

    debug!(
        loaded = decoded.records.len(),
        skipped = decoded.skipped,
        "decoded job document"
    );
    decoded
}

fn rejected() -> DecodedJobs {
    DecodedJobs {
        rejected: true,
        ..DecodedJobs::default()
    }
}

fn to_persisted(record: &JobRecord, now_elapsed: u64, now_wall: DateTime<Utc>) -> PersistedJob {
    let spec = record.spec();
    let execution = match spec.execution() {
        Execution::Periodic { interval, flex } => PersistedExecution::Periodic {
            interval: *interval,
            flex: *flex,
        },
        Execution::OneOff { .. } => PersistedExecution::OneOff,
    };

    let earliest = record.earliest_run_time();
    let latest = record.latest_run_time();

    PersistedJob {
        id: record.id(),
        handler: spec.handler().clone(),
        persisted: spec.is_persisted(),
        backend: record.backend(),
        requires: PersistedRequirements {
            charging: spec.requires_charging(),
            idle: spec.requires_idle(),
            battery_not_low: spec.requires_battery_not_low(),
            storage_not_low: spec.requires_storage_not_low(),
            network: spec.network(),
        },
        execution,
        earliest_run_time: (earliest != NO_EARLIEST_RUNTIME)
            .then(|| elapsed_to_wall(earliest, now_elapsed, now_wall)),
        latest_run_time: (latest != NO_LATEST_RUNTIME)
            .then(|| elapsed_to_wall(latest, now_elapsed, now_wall)),
        backoff: spec
            .has_custom_backoff()
            .then(|| spec.backoff())
            .filter(|backoff| *backoff != Backoff::DEFAULT),
        extras: spec.extras().clone(),
    }
}

fn from_persisted(
    job: PersistedJob,
    now_elapsed: u64,
    now_wall: DateTime<Utc>,
) -> Result<JobRecord, RegistryError> {
    let earliest_delay = job
        .earliest_run_time
        .map(|wall| remaining_until(wall, now_wall));
    let latest_delay = job
        .latest_run_time
        .map(|wall| remaining_until(wall, now_wall));

    let mut builder = JobSpec::builder(job.id.0, job.handler.as_str())
        .persisted(job.persisted)
        .requires_charging(job.requires.charging)
        .requires_idle(job.requires.idle)
        .requires_battery_not_low(job.requires.battery_not_low)
        .requires_storage_not_low(job.requires.storage_not_low)
        .network(job.requires.network)
        .extras(job.extras);

    builder = match job.execution {
        // A periodic job waiting out a retry has no latest bound.
        PersistedExecution::Periodic { interval, flex } => builder.periodic_with_flex(interval, flex),
        PersistedExecution::OneOff => {
            if let Some(delay) = earliest_delay {
                builder = builder.minimum_latency(delay);
            }
            if let Some(delay) = latest_delay {
                builder = builder.override_deadline(delay);
            }
            builder
        }
    };

    if let Some(backoff) = job.backoff {
        builder = builder.backoff(backoff);
    }

    let spec = builder.build()?;
    let earliest = earliest_delay.map_or(NO_EARLIEST_RUNTIME, |d| {
        crate::record::bound_after(now_elapsed, d)
    });
    let latest = latest_delay.map_or(NO_LATEST_RUNTIME, |d| {
        crate::record::bound_after(now_elapsed, d)
    });

    Ok(JobRecord::with_window(spec, job.backend, earliest, latest, 0))
}

/// `now_wall + (bound - now_elapsed)`, allowing bounds already in the past.
fn elapsed_to_wall(bound: u64, now_elapsed: u64, now_wall: DateTime<Utc>) -> DateTime<Utc> {
    let offset_ms = i64::try_from(i128::from(bound) - i128::from(now_elapsed)).unwrap_or(i64::MAX);
    chrono::Duration::try_milliseconds(offset_ms)
        .and_then(|offset| now_wall.checked_add_signed(offset))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `max(bound - now_wall, 0)`.
fn remaining_until(bound: DateTime<Utc>, now_wall: DateTime<Utc>) -> Duration {
    (bound - now_wall).to_std().unwrap_or(Duration::ZERO)
}
