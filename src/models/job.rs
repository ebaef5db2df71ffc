//! Durable job records and their schedules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{collections::BTreeSet, time::Duration};
use uuid::Uuid;

/// When a job runs once it is attached to a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobDefinition {
    /// Run as soon as a worker is free, then delete the record.
    OneTime,
    /// Run once, `delay_ms` after the record was created.
    Delayed { delay_ms: u64 },
    /// Run every `interval_ms`; the record is kept.
    Every { interval_ms: u64 },
}

impl JobDefinition {
    pub fn delayed(delay: Duration) -> Self {
        JobDefinition::Delayed {
            delay_ms: delay.as_millis() as u64,
        }
    }

    pub fn every(interval: Duration) -> Self {
        JobDefinition::Every {
            interval_ms: interval.as_millis() as u64,
        }
    }

    pub fn is_recurring(&self) -> bool {
        matches!(self, JobDefinition::Every { .. })
    }
}

/// One durable unit of scheduled work.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct JobRecord {
    pub uuid: Uuid,

    /// Registered task name.
    pub function: String,

    /// JSON-serialized task arguments.
    pub args: String,

    /// Sorted JSON array of dedup tags.
    pub tags: String,

    /// JSON-serialized [`JobDefinition`].
    pub definition: String,

    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn definition(&self) -> Result<JobDefinition, serde_json::Error> {
        serde_json::from_str(&self.definition)
    }

    pub fn tags(&self) -> Result<Vec<String>, serde_json::Error> {
        serde_json::from_str(&self.tags)
    }
}

/// Canonical tag encoding: sorted and de-duplicated, so the same set always
/// serializes to the same string.
pub fn encode_tags<I, S>(tags: I) -> String
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let set: BTreeSet<String> = tags.into_iter().map(Into::into).collect();
    let list: Vec<&String> = set.iter().collect();
    serde_json::to_string(&list).unwrap_or_else(|_| "[]".to_string())
}
