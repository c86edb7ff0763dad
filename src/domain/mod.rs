//! Core domain types for the scheduler store.
//!
//! This module provides:
//! - **Keys**: `JobKey` and `TriggerKey`, both `(group, name)` pairs
//! - **TriggerState**: the closed state machine persisted by the store
//! - **Trigger / JobDetail / FiredTriggerRecord**: the durable entities

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{Result, SchedulerError};

// ═══════════════════════════════════════════════════════════════════════════════
// Keys
// ═══════════════════════════════════════════════════════════════════════════════

/// Identity of a job detail: `(group, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub group: String,
    pub name: String,
}

impl JobKey {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// Identity of a trigger: `(group, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerKey {
    pub group: String,
    pub name: String,
}

impl TriggerKey {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Trigger State
// ═══════════════════════════════════════════════════════════════════════════════

/// Durable trigger states.
///
/// The string renderings are a bit-level contract with the underlying
/// job-store tables and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerState {
    /// Eligible for acquisition once due
    Waiting,
    /// Promoted by acquisition; owned by the dispatcher
    Acquired,
    /// Fired; the job is running
    Executing,
    /// Finished; the trigger will not fire again
    Complete,
    /// Cannot fire because a sibling occupies its concurrency slot
    Blocked,
    /// Administratively paused
    Paused,
    /// Paused while also concurrency-blocked
    PausedBlocked,
    /// Faulted (e.g. its job type no longer resolves)
    Error,
}

impl TriggerState {
    /// Render the exact literal persisted by the base store.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::Acquired => "ACQUIRED",
            Self::Executing => "EXECUTING",
            Self::Complete => "COMPLETE",
            Self::Blocked => "BLOCKED",
            Self::Paused => "PAUSED",
            Self::PausedBlocked => "PAUSED_BLOCKED",
            Self::Error => "ERROR",
        }
    }

    /// Parse a persisted state literal.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "WAITING" => Ok(Self::Waiting),
            "ACQUIRED" => Ok(Self::Acquired),
            "EXECUTING" => Ok(Self::Executing),
            "COMPLETE" => Ok(Self::Complete),
            "BLOCKED" => Ok(Self::Blocked),
            "PAUSED" => Ok(Self::Paused),
            "PAUSED_BLOCKED" => Ok(Self::PausedBlocked),
            "ERROR" => Ok(Self::Error),
            other => Err(SchedulerError::invalid_state(format!(
                "unknown trigger state: {other}"
            ))),
        }
    }

    /// Check if the trigger sits on the paused axis.
    pub const fn is_paused(&self) -> bool {
        matches!(self, Self::Paused | Self::PausedBlocked)
    }
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// States of an in-flight fired-trigger record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FiredState {
    Acquired,
    Executing,
}

impl FiredState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Acquired => "ACQUIRED",
            Self::Executing => "EXECUTING",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "ACQUIRED" => Ok(Self::Acquired),
            "EXECUTING" => Ok(Self::Executing),
            other => Err(SchedulerError::invalid_state(format!(
                "unknown fired-trigger state: {other}"
            ))),
        }
    }
}

impl fmt::Display for FiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Detail
// ═══════════════════════════════════════════════════════════════════════════════

/// Durable description of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDetail {
    /// Unique job identity
    pub key: JobKey,
    /// Registered job-type name (resolved through the type registry)
    pub job_type: String,
    /// Opaque key/value bag passed to the job on execution
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
    /// Whether the job survives with no triggers pointing at it
    #[serde(default)]
    pub durable: bool,
    /// Whether the job should be re-executed after instance recovery
    #[serde(default)]
    pub requests_recovery: bool,
    /// Human-readable description for queue-state surfaces
    #[serde(default)]
    pub description: Option<String>,
}

impl JobDetail {
    pub fn new(key: JobKey, job_type: impl Into<String>) -> Self {
        Self {
            key,
            job_type: job_type.into(),
            data: serde_json::Map::new(),
            durable: false,
            requests_recovery: false,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Trigger
// ═══════════════════════════════════════════════════════════════════════════════

/// Repeat behavior of a trigger.
///
/// Cron algebra is out of scope; the store only needs "is there a next
/// fire time after this one".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSchedule {
    /// Fire once, then complete
    Once,
    /// Fire every `every_secs`; `remaining == None` repeats forever
    Interval {
        every_secs: i64,
        remaining: Option<u32>,
    },
}

/// Durable record describing when and for which job a fire should occur.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    /// Unique trigger identity
    pub key: TriggerKey,
    /// The job this trigger fires
    pub job_key: JobKey,
    /// Job-type name, denormalized for candidate filtering
    pub job_type: String,
    /// Current durable state
    pub state: TriggerState,
    /// When the trigger becomes eligible
    pub start_time: DateTime<Utc>,
    /// Next scheduled fire time (None once exhausted)
    pub next_fire_time: Option<DateTime<Utc>>,
    /// Previous fire time
    pub previous_fire_time: Option<DateTime<Utc>>,
    /// Repeat behavior
    pub schedule: TriggerSchedule,
    /// Dispatch priority within one fire instant (higher first)
    pub priority: i32,
    /// Calendar gating this trigger, if any
    pub calendar_name: Option<String>,
    /// Identity of the in-flight firing, set at acquisition
    pub fire_instance_id: Option<Uuid>,
}

impl Trigger {
    /// Create a one-shot trigger due at `fire_at`.
    pub fn once(key: TriggerKey, job: &JobDetail, fire_at: DateTime<Utc>) -> Self {
        Self {
            key,
            job_key: job.key.clone(),
            job_type: job.job_type.clone(),
            state: TriggerState::Waiting,
            start_time: fire_at,
            next_fire_time: Some(fire_at),
            previous_fire_time: None,
            schedule: TriggerSchedule::Once,
            priority: 0,
            calendar_name: None,
            fire_instance_id: None,
        }
    }

    /// Create a repeating trigger starting at `start`.
    pub fn repeating(
        key: TriggerKey,
        job: &JobDetail,
        start: DateTime<Utc>,
        every_secs: i64,
        remaining: Option<u32>,
    ) -> Self {
        Self {
            key,
            job_key: job.key.clone(),
            job_type: job.job_type.clone(),
            state: TriggerState::Waiting,
            start_time: start,
            next_fire_time: Some(start),
            previous_fire_time: None,
            schedule: TriggerSchedule::Interval {
                every_secs,
                remaining,
            },
            priority: 0,
            calendar_name: None,
            fire_instance_id: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_calendar(mut self, calendar_name: impl Into<String>) -> Self {
        self.calendar_name = Some(calendar_name.into());
        self
    }

    /// Record a fire: shift `previous_fire_time` and compute the next
    /// fire time from the schedule.
    pub fn triggered(&mut self) {
        let fired_at = self.next_fire_time;
        self.previous_fire_time = fired_at;
        self.next_fire_time = match self.schedule {
            TriggerSchedule::Once => None,
            TriggerSchedule::Interval {
                every_secs,
                remaining,
            } => {
                let next = fired_at.map(|t| t + Duration::seconds(every_secs));
                match remaining {
                    Some(0) => None,
                    Some(n) => {
                        self.schedule = TriggerSchedule::Interval {
                            every_secs,
                            remaining: Some(n - 1),
                        };
                        next
                    }
                    None => next,
                }
            }
        };
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Fired Trigger Record
// ═══════════════════════════════════════════════════════════════════════════════

/// An in-flight firing, created at acquisition and deleted at completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiredTriggerRecord {
    /// Identity of this firing
    pub fire_instance_id: Uuid,
    /// Scheduler instance owning the firing
    pub scheduler_instance_id: String,
    /// `Acquired` at creation, `Executing` once fired
    pub state: FiredState,
    pub trigger_key: TriggerKey,
    pub job_key: JobKey,
    pub job_type: String,
    /// When the record was created
    pub fired_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_literals_round_trip() {
        let states = [
            (TriggerState::Waiting, "WAITING"),
            (TriggerState::Acquired, "ACQUIRED"),
            (TriggerState::Executing, "EXECUTING"),
            (TriggerState::Complete, "COMPLETE"),
            (TriggerState::Blocked, "BLOCKED"),
            (TriggerState::Paused, "PAUSED"),
            (TriggerState::PausedBlocked, "PAUSED_BLOCKED"),
            (TriggerState::Error, "ERROR"),
        ];
        for (state, literal) in states {
            assert_eq!(state.as_str(), literal);
            assert_eq!(TriggerState::parse(literal).unwrap(), state);
        }
        assert!(TriggerState::parse("RUNNING").is_err());
    }

    #[test]
    fn test_once_trigger_exhausts() {
        let job = JobDetail::new(JobKey::new("import", "hash-1"), "HashFileJob");
        let mut trigger = Trigger::once(TriggerKey::new("import", "t1"), &job, Utc::now());
        assert!(trigger.next_fire_time.is_some());

        trigger.triggered();
        assert!(trigger.next_fire_time.is_none());
        assert!(trigger.previous_fire_time.is_some());
    }

    #[test]
    fn test_interval_trigger_advances() {
        let job = JobDetail::new(JobKey::new("import", "poll"), "PollJob");
        let start = Utc::now();
        let mut trigger = Trigger::repeating(
            TriggerKey::new("import", "t2"),
            &job,
            start,
            60,
            Some(1),
        );

        trigger.triggered();
        assert_eq!(
            trigger.next_fire_time,
            Some(start + Duration::seconds(60))
        );

        // One repeat remained; the next fire exhausts the schedule.
        trigger.triggered();
        assert!(trigger.next_fire_time.is_none());
    }

    #[test]
    fn test_key_display() {
        assert_eq!(JobKey::new("import", "hash-1").to_string(), "import.hash-1");
        assert_eq!(TriggerKey::new("import", "t1").to_string(), "import.t1");
    }
}
