//! Registry value types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::RegistryError;

/// Caller-assigned job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u32);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for JobId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Opaque reference to whatever runs the job. Never interpreted by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerRef(String);

impl HandlerRef {
    pub fn new(handler: impl Into<String>) -> Self {
        Self(handler.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Network class a job needs before it may run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    /// No network requirement.
    #[default]
    None,
    /// Any connected network.
    Any,
    /// A network that is not metered.
    Unmetered,
    /// A network that is not roaming.
    NotRoaming,
    /// A metered network.
    Metered,
}

/// How the retry delay grows with consecutive failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffPolicy {
    Linear,
    #[default]
    Exponential,
}

/// Retry policy plus the delay used for the first retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub policy: BackoffPolicy,
    #[serde(rename = "initial_delay_ms", with = "millis")]
    pub initial_delay: Duration,
}

impl Backoff {
    /// Policy applied when a job does not customise its backoff.
    pub const DEFAULT: Backoff = Backoff {
        policy: BackoffPolicy::Exponential,
        initial_delay: Duration::from_secs(30),
    };

    pub fn new(policy: BackoffPolicy, initial_delay: Duration) -> Self {
        Self {
            policy,
            initial_delay,
        }
    }

    pub fn linear(initial_delay: Duration) -> Self {
        Self::new(BackoffPolicy::Linear, initial_delay)
    }

    pub fn exponential(initial_delay: Duration) -> Self {
        Self::new(BackoffPolicy::Exponential, initial_delay)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Identifies the wake-up mechanism that currently owns a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendTag {
    /// Alarm-style timer.
    Alarm,
    /// Push-style wake service.
    Push,
    /// Native job-scheduling facility.
    Native,
}

impl BackendTag {
    pub const ALL: [BackendTag; 3] = [BackendTag::Alarm, BackendTag::Push, BackendTag::Native];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendTag::Alarm => "alarm",
            BackendTag::Push => "push",
            BackendTag::Native => "native",
        }
    }
}

impl fmt::Display for BackendTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendTag {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendTag::ALL
            .into_iter()
            .find(|tag| tag.as_str() == s)
            .ok_or_else(|| RegistryError::invalid(format!("unknown backend tag: {s}")))
    }
}

/// Key-typed payload handed to the job's handler.
pub type Extras = BTreeMap<String, ExtraValue>;

/// A single extras value. Arrays are homogeneous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ExtraValue {
    Bool(bool),
    Long(i64),
    Double(f64),
    String(String),
    BoolArray(Vec<bool>),
    LongArray(Vec<i64>),
    DoubleArray(Vec<f64>),
    StringArray(Vec<String>),
    Nested(Extras),
}

/// Nesting depth of an extras tree; a flat map has depth 1, an empty map 0.
pub fn extras_depth(extras: &Extras) -> usize {
    if extras.is_empty() {
        return 0;
    }
    1 + extras
        .values()
        .map(|value| match value {
            ExtraValue::Nested(inner) => extras_depth(inner).max(1),
            _ => 0,
        })
        .max()
        .unwrap_or(0)
}

/// Whether every double in an extras tree has a JSON representation.
pub fn extras_are_finite(extras: &Extras) -> bool {
    extras.values().all(|value| match value {
        ExtraValue::Double(v) => v.is_finite(),
        ExtraValue::DoubleArray(values) => values.iter().all(|v| v.is_finite()),
        ExtraValue::Nested(inner) => extras_are_finite(inner),
        _ => true,
    })
}

/// Content URI watched by a content-triggered job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriggerContentUri {
    pub uri: String,
    pub flags: u32,
}

impl TriggerContentUri {
    /// Also trigger for changes to descendants of the URI.
    pub const FLAG_NOTIFY_FOR_DESCENDANTS: u32 = 1;

    pub fn new(uri: impl Into<String>, flags: u32) -> Self {
        Self {
            uri: uri.into(),
            flags,
        }
    }
}

/// Content-change trigger set for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentTriggers {
    pub uris: Vec<TriggerContentUri>,
    /// Delay from the last observed change before the job runs.
    pub update_delay: Option<Duration>,
    /// Longest the job will wait after the first change.
    pub max_delay: Option<Duration>,
}

impl ContentTriggers {
    pub fn new(uris: Vec<TriggerContentUri>) -> Self {
        Self {
            uris,
            update_delay: None,
            max_delay: None,
        }
    }
}

/// Serde helper storing a [`Duration`] as whole milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(crate::clock::duration_millis(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
