//! Cleanup policy values.

use crate::RegistryType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use time::{Duration, OffsetDateTime};

/// Bounds for `keep_n_days_after_download`.
pub const MIN_KEEP_DAYS: u32 = 1;
pub const MAX_KEEP_DAYS: u32 = 365;

/// Validate a retention window.
pub fn validate_keep_days(days: u32) -> crate::Result<u32> {
    if (MIN_KEEP_DAYS..=MAX_KEEP_DAYS).contains(&days) {
        Ok(days)
    } else {
        Err(crate::Error::InvalidPolicy(format!(
            "keep_n_days_after_download must be between {MIN_KEEP_DAYS} and {MAX_KEEP_DAYS}, got {days}"
        )))
    }
}

/// How often a policy runs, in days.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Cadence {
    Daily,
    Weekly,
    Biweekly,
    Monthly,
    Quarterly,
}

impl Cadence {
    pub fn days(&self) -> u32 {
        match self {
            Self::Daily => 1,
            Self::Weekly => 7,
            Self::Biweekly => 14,
            Self::Monthly => 30,
            Self::Quarterly => 90,
        }
    }

    pub fn from_days(days: u32) -> crate::Result<Self> {
        match days {
            1 => Ok(Self::Daily),
            7 => Ok(Self::Weekly),
            14 => Ok(Self::Biweekly),
            30 => Ok(Self::Monthly),
            90 => Ok(Self::Quarterly),
            other => Err(crate::Error::InvalidPolicy(format!(
                "cadence must be one of 1, 7, 14, 30, 90 days, got {other}"
            ))),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::days(i64::from(self.days()))
    }

    /// Next run time measured from `from`.
    pub fn next_run_after(&self, from: OffsetDateTime) -> OffsetDateTime {
        from + self.interval()
    }
}

impl TryFrom<u32> for Cadence {
    type Error = crate::Error;

    fn try_from(value: u32) -> crate::Result<Self> {
        Self::from_days(value)
    }
}

impl From<Cadence> for u32 {
    fn from(value: Cadence) -> Self {
        value.days()
    }
}

/// Cleanup policy lifecycle.
///
/// `Scheduled -> Running -> Scheduled | Failed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupStatus {
    Scheduled,
    Running,
    Failed,
}

impl CleanupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "running" => Ok(Self::Running),
            "failed" => Ok(Self::Failed),
            other => Err(crate::Error::InvalidPolicy(format!(
                "unknown cleanup status: {other}"
            ))),
        }
    }

    /// Whether the executor may move a policy from `self` to `next`.
    pub fn can_transition_to(&self, next: CleanupStatus) -> bool {
        matches!(
            (self, next),
            (Self::Scheduled, Self::Running)
                | (Self::Running, Self::Scheduled)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for CleanupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counts for one registry type in a cleanup run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryTypeMetrics {
    pub deleted_entries_count: u64,
    pub deleted_size: u64,
}

impl RegistryTypeMetrics {
    pub fn add(&mut self, count: u64, size: u64) {
        self.deleted_entries_count = self.deleted_entries_count.saturating_add(count);
        self.deleted_size = self.deleted_size.saturating_add(size);
    }
}

/// Per registry type breakdown persisted as `last_run_detailed_metrics`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CleanupMetrics(BTreeMap<RegistryType, RegistryTypeMetrics>);

impl CleanupMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, registry_type: RegistryType, count: u64, size: u64) {
        self.0.entry(registry_type).or_default().add(count, size);
    }

    pub fn get(&self, registry_type: RegistryType) -> RegistryTypeMetrics {
        self.0.get(&registry_type).copied().unwrap_or_default()
    }

    pub fn total_count(&self) -> u64 {
        self.0.values().map(|m| m.deleted_entries_count).sum()
    }

    pub fn total_size(&self) -> u64 {
        self.0.values().map(|m| m.deleted_size).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RegistryType, &RegistryTypeMetrics)> {
        self.0.iter()
    }

    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| crate::Error::Serialization(e.to_string()))
    }

    /// Parse a persisted blob, rejecting unknown registry types and fields.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| crate::Error::InvalidMetrics(e.to_string()))
    }
}
