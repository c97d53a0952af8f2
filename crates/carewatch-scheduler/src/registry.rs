//! Task registry contract — the single source of truth for installed tasks.

use std::time::Duration;

use chrono::{DateTime, Utc};

use carewatch_core::error::Result;

use crate::tasks::{ScheduleDefinition, TaskRecord};

/// What an upsert did to the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    /// Trigger or action changed.
    Updated,
    /// Trigger and action already matched. Description edits land here too.
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct Upsert {
    pub record: TaskRecord,
    pub outcome: UpsertOutcome,
}

/// Durable store of [`TaskRecord`]s, one per task name.
///
/// Every mutating call is atomic for the record it touches, including
/// across processes sharing the same backing store.
pub trait TaskRegistry: Send + Sync {
    /// Create the record if missing, else update trigger/action/description
    /// in place. Run state and `enabled` are never touched.
    fn upsert(&self, definition: &ScheduleDefinition, now: DateTime<Utc>) -> Result<Upsert>;

    fn get(&self, name: &str) -> Result<Option<TaskRecord>>;

    /// Remove a record and its run history.
    fn delete(&self, name: &str) -> Result<bool>;

    /// Remove every record whose name starts with `prefix`.
    fn delete_all_matching(&self, prefix: &str) -> Result<usize>;

    /// All records ordered by name.
    fn list(&self) -> Result<Vec<TaskRecord>>;

    /// Zero run counters and clear `last_run_at` on every record.
    fn reset_counters(&self) -> Result<usize>;

    /// Count a successful run: `total_run_count += 1`, `last_run_at = at`.
    /// `at` is the claim time; the claim is released only if it is still the
    /// one taken at `at`, so a late finish never frees a newer owner's claim.
    fn record_run(&self, name: &str, at: DateTime<Utc>) -> Result<TaskRecord>;

    /// Note a failed attempt: `last_run_at = at`, counter untouched. Releases
    /// the claim under the same rule as [`record_run`](Self::record_run).
    fn record_failure(&self, name: &str, at: DateTime<Utc>) -> Result<TaskRecord>;

    /// Atomically take the run claim if the record is enabled, due at `now`
    /// and not already claimed (claims older than `stale_after` are ignored).
    fn try_claim(&self, name: &str, now: DateTime<Utc>, stale_after: Duration) -> Result<bool>;

    fn set_enabled(&self, name: &str, enabled: bool, now: DateTime<Utc>) -> Result<TaskRecord>;
}
