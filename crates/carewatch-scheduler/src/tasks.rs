//! Task definitions — the core data model for scheduled work.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cron::CronSchedule;

/// How/when a task becomes due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Run every N seconds, measured from the previous attempt.
    Interval { every_secs: u64 },
    /// Run on matching calendar minutes.
    Crontab {
        #[serde(default = "any")]
        minute: String,
        #[serde(default = "any")]
        hour: String,
        #[serde(default = "any")]
        day_of_week: String,
        #[serde(default = "any")]
        day_of_month: String,
        #[serde(default = "any")]
        month: String,
    },
}

fn any() -> String {
    "*".into()
}

impl Trigger {
    /// Fixed interval, rounded up to whole seconds.
    pub fn every(every: Duration) -> Self {
        let partial = u64::from(every.subsec_nanos() > 0);
        Trigger::Interval {
            every_secs: every.as_secs().saturating_add(partial),
        }
    }

    /// Every day at `hour:minute` UTC.
    pub fn daily_at(hour: u32, minute: u32) -> Self {
        Trigger::crontab(&minute.to_string(), &hour.to_string(), "*", "*", "*")
    }

    pub fn crontab(
        minute: &str,
        hour: &str,
        day_of_week: &str,
        day_of_month: &str,
        month: &str,
    ) -> Self {
        Trigger::Crontab {
            minute: minute.into(),
            hour: hour.into(),
            day_of_week: day_of_week.into(),
            day_of_month: day_of_month.into(),
            month: month.into(),
        }
    }

    /// Check that the trigger can ever fire.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Trigger::Interval { every_secs } => {
                if *every_secs == 0 {
                    return Err("interval must be at least one second".into());
                }
                let secs = i64::try_from(*every_secs).ok();
                if secs.and_then(chrono::Duration::try_seconds).is_none() {
                    return Err(format!("interval of {every_secs}s is too large"));
                }
                Ok(())
            }
            Trigger::Crontab { .. } => {
                let schedule = self.cron_schedule()?;
                let probe = DateTime::<Utc>::default();
                if schedule.next_after(probe).is_none() {
                    return Err("crontab never matches a real date".into());
                }
                Ok(())
            }
        }
    }

    /// First due time after `reference`.
    pub fn next_after(&self, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Interval { every_secs } => {
                let every = chrono::Duration::try_seconds(i64::try_from(*every_secs).ok()?)?;
                reference.checked_add_signed(every)
            }
            Trigger::Crontab { .. } => self.cron_schedule().ok()?.next_after(reference),
        }
    }

    fn cron_schedule(&self) -> Result<CronSchedule, String> {
        match self {
            Trigger::Crontab {
                minute,
                hour,
                day_of_week,
                day_of_month,
                month,
            } => CronSchedule::parse(minute, hour, day_of_week, day_of_month, month),
            Trigger::Interval { .. } => Err("not a crontab trigger".into()),
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Interval { every_secs } => write!(f, "every {every_secs}s"),
            Trigger::Crontab {
                minute,
                hour,
                day_of_week,
                day_of_month,
                month,
            } => write!(f, "cron {minute} {hour} {day_of_month} {month} {day_of_week}"),
        }
    }
}

/// Declared description of one recurring job, as it appears in a catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub name: String,
    pub trigger: Trigger,
    /// Key into the action registry.
    #[serde(rename = "action")]
    pub action_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ScheduleDefinition {
    pub fn new(name: &str, trigger: Trigger, action_ref: &str) -> Self {
        Self {
            name: name.to_string(),
            trigger,
            action_ref: action_ref.to_string(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }
}

/// Installed state of a task, owned by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub name: String,
    /// Installed trigger; may drift from the catalog until reconciled.
    pub trigger: Trigger,
    pub action_ref: String,
    pub description: Option<String>,
    /// Disabled records are kept but never executed.
    pub enabled: bool,
    /// Successful invocations only.
    pub total_run_count: u64,
    /// Most recent attempt, successful or not.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Set while an executor holds the run claim.
    pub running_since: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Observable run state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Disabled,
    Idle,
    Due,
    Running,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Disabled => write!(f, "disabled"),
            TaskState::Idle => write!(f, "idle"),
            TaskState::Due => write!(f, "due"),
            TaskState::Running => write!(f, "running"),
        }
    }
}

impl TaskRecord {
    /// Next time the trigger is satisfied, counted from the last attempt or registration.
    pub fn next_due_at(&self) -> Option<DateTime<Utc>> {
        self.trigger
            .next_after(self.last_run_at.unwrap_or(self.created_at))
    }

    /// Whether the task should fire at `now`. Ignores any run claim.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_due_at().is_some_and(|next| next <= now)
    }

    /// Whether a run claim exists that is younger than `stale_after`.
    pub fn is_claimed(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        match self.running_since {
            Some(since) => match chrono::Duration::from_std(stale_after) {
                Ok(stale) => now - since < stale,
                Err(_) => true,
            },
            None => false,
        }
    }

    pub fn state(&self, now: DateTime<Utc>) -> TaskState {
        if !self.enabled {
            TaskState::Disabled
        } else if self.running_since.is_some() {
            TaskState::Running
        } else if self.is_due(now) {
            TaskState::Due
        } else {
            TaskState::Idle
        }
    }
}
