//! Subcommand implementations.

use std::sync::Arc;

use dormant_registry::{
    Clock, Execution, FileStore, JobId, JobRecord, JobRegistry, NO_EARLIEST_RUNTIME,
    NO_LATEST_RUNTIME, RegistryConfig, SnapshotStore, SystemClock, codec,
};
use miette::Result;

/// Print every persisted job.
pub async fn list(config: &RegistryConfig) -> Result<()> {
    let clock = SystemClock::new();
    let Some(decoded) = read(config, &clock).await? else {
        println!("no jobs stored at {}", config.store_path.display());
        return Ok(());
    };

    if decoded.records.is_empty() {
        println!("no jobs");
    }
    let now = clock.elapsed_millis();
    for record in &decoded.records {
        println!("{}", describe(record, now));
    }
    if decoded.skipped > 0 {
        println!("({} corrupt entries skipped)", decoded.skipped);
    }
    Ok(())
}

/// Validate the stored document.
pub async fn check(config: &RegistryConfig) -> Result<()> {
    let clock = SystemClock::new();
    let Some(decoded) = read(config, &clock).await? else {
        println!("no job document at {}", config.store_path.display());
        return Ok(());
    };

    if decoded.rejected {
        return Err(miette::miette!(
            "{} is unreadable or has an unsupported version",
            config.store_path.display()
        ));
    }
    println!(
        "{}: {} jobs, {} corrupt entries skipped",
        config.store_path.display(),
        decoded.records.len(),
        decoded.skipped
    );
    Ok(())
}

/// Remove one job and persist the result.
///
/// Refuses to touch a document that did not load completely, since the
/// rewrite would drop whatever was left out.
pub async fn cancel(config: RegistryConfig, id: u32) -> Result<()> {
    let registry = open_complete(config).await?;
    let removed = registry.cancel(JobId(id));
    finish(&registry).await?;

    match removed {
        Some(record) => println!("cancelled {}", describe(&record, registry.now())),
        None => println!("no job with id {id}"),
    }
    Ok(())
}

/// Remove every job and persist the empty registry.
pub async fn clear(config: RegistryConfig) -> Result<()> {
    let registry = open(config).await;
    let removed = registry.cancel_all();
    finish(&registry).await?;

    println!("cancelled {} jobs", removed.len());
    Ok(())
}

async fn read(config: &RegistryConfig, clock: &dyn Clock) -> Result<Option<codec::DecodedJobs>> {
    let store = FileStore::new(&config.store_path);
    let bytes = store
        .load()
        .await
        .map_err(|e| miette::miette!("failed to read {}: {}", config.store_path.display(), e))?;
    Ok(bytes.map(|bytes| codec::decode(&bytes, clock)))
}

async fn open(config: RegistryConfig) -> JobRegistry {
    let store = Arc::new(FileStore::new(&config.store_path));
    JobRegistry::open(config, Arc::new(SystemClock::new()), store).await
}

/// Open a registry holding every job in the stored document.
///
/// The job limit is raised to the document's job count so that nothing is
/// truncated on load.
async fn open_complete(mut config: RegistryConfig) -> Result<JobRegistry> {
    if let Some(decoded) = read(&config, &SystemClock::new()).await? {
        if decoded.rejected {
            return Err(miette::miette!(
                "{} is unreadable or has an unsupported version; refusing to rewrite it",
                config.store_path.display()
            ));
        }
        if decoded.skipped > 0 {
            return Err(miette::miette!(
                "{} has {} corrupt entries; refusing to rewrite it (see `dormant check`)",
                config.store_path.display(),
                decoded.skipped
            ));
        }
        config.max_jobs = config.max_jobs.max(decoded.records.len());
    }
    Ok(open(config).await)
}

async fn finish(registry: &JobRegistry) -> Result<()> {
    registry
        .flush()
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    registry.shutdown().await;
    Ok(())
}

/// One-line summary of a record.
fn describe(record: &JobRecord, now: u64) -> String {
    let spec = record.spec();
    let shape = match spec.execution() {
        Execution::Periodic { interval, .. } => format!("every {}", human(interval.as_millis() as u64)),
        Execution::OneOff { .. } => "one-off".to_string(),
    };
    let required = record.required_constraints();
    let required = if required.is_empty() {
        "-".to_string()
    } else {
        required.to_string()
    };

    format!(
        "{:>6}  {:<7} {:<12} earliest {:<12} latest {:<12} {}  [{}]",
        record.id(),
        record.backend(),
        shape,
        bound(record.earliest_run_time(), NO_EARLIEST_RUNTIME, now),
        bound(record.latest_run_time(), NO_LATEST_RUNTIME, now),
        spec.handler(),
        required,
    )
}

fn bound(value: u64, sentinel: u64, now: u64) -> String {
    if value == sentinel {
        "none".to_string()
    } else if value <= now {
        "now".to_string()
    } else {
        format!("in {}", human(value - now))
    }
}

/// Coarse human duration, largest two units.
fn human(millis: u64) -> String {
    let secs = millis / 1000;
    let (days, hours, minutes, seconds) = (
        secs / 86_400,
        secs % 86_400 / 3600,
        secs % 3600 / 60,
        secs % 60,
    );
    match (days, hours, minutes) {
        (0, 0, 0) => format!("{seconds}s"),
        (0, 0, m) => format!("{m}m{seconds:02}s"),
        (0, h, m) => format!("{h}h{m:02}m"),
        (d, h, _) => format!("{d}d{h:02}h"),
    }
}
