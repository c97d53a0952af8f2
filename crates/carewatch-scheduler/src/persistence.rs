//! SQLite-backed task registry.
//! Survives restarts; several processes may share one database file, with
//! every mutation wrapped in an immediate transaction.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};

use carewatch_core::error::{CareError, Result};

use crate::registry::{TaskRegistry, Upsert, UpsertOutcome};
use crate::tasks::{ScheduleDefinition, TaskRecord, Trigger};

const COLUMNS: &str = "name, schedule, action_ref, description, enabled, total_run_count, \
                       last_run_at, running_since, created_at, updated_at";

/// SQLite persistence for [`TaskRecord`]s.
pub struct SqliteRegistry {
    conn: Mutex<Connection>,
}

impl SqliteRegistry {
    /// Open or create the registry database.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(db_err("open"))?;
        conn.busy_timeout(busy_timeout).map_err(db_err("busy timeout"))?;
        let registry = Self {
            conn: Mutex::new(conn),
        };
        registry.migrate()?;
        tracing::debug!("task registry opened at {}", path.display());
        Ok(registry)
    }

    /// Private in-memory registry, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("open"))?;
        let registry = Self {
            conn: Mutex::new(conn),
        };
        registry.migrate()?;
        Ok(registry)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS care_tasks (
                name TEXT PRIMARY KEY,
                schedule TEXT NOT NULL,          -- JSON: {\"kind\":\"interval\",...} or {\"kind\":\"crontab\",...}
                action_ref TEXT NOT NULL,
                description TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                total_run_count INTEGER NOT NULL DEFAULT 0,
                last_run_at TEXT,
                running_since TEXT,              -- run claim held by an executor
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
         ",
            )
            .map_err(db_err("migration"))
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CareError::StorageUnavailable("registry connection lock poisoned".into()))
    }
}

impl TaskRegistry for SqliteRegistry {
    fn upsert(&self, definition: &ScheduleDefinition, now: DateTime<Utc>) -> Result<Upsert> {
        let schedule = serde_json::to_string(&definition.trigger)
            .map_err(|e| CareError::StorageUnavailable(format!("encode schedule: {e}")))?;
        let name = definition.name.as_str();

        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("upsert"))?;

        let outcome = match fetch(&tx, name).map_err(db_err("upsert"))? {
            None => {
                tx.execute(
                    "INSERT INTO care_tasks
                     (name, schedule, action_ref, description, enabled, total_run_count, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 1, 0, ?5, ?5)",
                    params![name, schedule, definition.action_ref, definition.description, ts(now)],
                )
                .map_err(db_err("upsert"))?;
                UpsertOutcome::Created
            }
            Some(prior)
                if prior.trigger == definition.trigger
                    && prior.action_ref == definition.action_ref =>
            {
                if prior.description != definition.description {
                    tx.execute(
                        "UPDATE care_tasks SET description = ?1, updated_at = ?2 WHERE name = ?3",
                        params![definition.description, ts(now), name],
                    )
                    .map_err(db_err("upsert"))?;
                }
                UpsertOutcome::Unchanged
            }
            Some(_) => {
                tx.execute(
                    "UPDATE care_tasks SET schedule = ?1, action_ref = ?2, description = ?3, updated_at = ?4
                     WHERE name = ?5",
                    params![schedule, definition.action_ref, definition.description, ts(now), name],
                )
                .map_err(db_err("upsert"))?;
                UpsertOutcome::Updated
            }
        };

        let record = fetch(&tx, name)
            .map_err(db_err("upsert"))?
            .ok_or_else(|| CareError::NotFound(name.to_string()))?;
        tx.commit().map_err(db_err("upsert"))?;
        Ok(Upsert { record, outcome })
    }

    fn get(&self, name: &str) -> Result<Option<TaskRecord>> {
        let conn = self.conn()?;
        fetch(&conn, name).map_err(db_err("get"))
    }

    fn delete(&self, name: &str) -> Result<bool> {
        let deleted = self
            .conn()?
            .execute("DELETE FROM care_tasks WHERE name = ?1", [name])
            .map_err(db_err("delete"))?;
        Ok(deleted > 0)
    }

    fn delete_all_matching(&self, prefix: &str) -> Result<usize> {
        // substr keeps the prefix literal; LIKE would treat % and _ as wildcards
        self.conn()?
            .execute(
                "DELETE FROM care_tasks WHERE substr(name, 1, length(?1)) = ?1",
                [prefix],
            )
            .map_err(db_err("delete matching"))
    }

    fn list(&self) -> Result<Vec<TaskRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {COLUMNS} FROM care_tasks ORDER BY name"))
            .map_err(db_err("list"))?;
        let rows = stmt.query_map([], row_to_record).map_err(db_err("list"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("list"))
    }

    fn reset_counters(&self) -> Result<usize> {
        self.conn()?
            .execute(
                "UPDATE care_tasks SET total_run_count = 0, last_run_at = NULL",
                [],
            )
            .map_err(db_err("reset counters"))
    }

    fn record_run(&self, name: &str, at: DateTime<Utc>) -> Result<TaskRecord> {
        self.update_one(
            name,
            "record run",
            "UPDATE care_tasks
             SET total_run_count = total_run_count + 1, last_run_at = ?1,
                 running_since = CASE WHEN running_since = ?1 THEN NULL ELSE running_since END
             WHERE name = ?2",
            &ts(at),
        )
    }

    fn record_failure(&self, name: &str, at: DateTime<Utc>) -> Result<TaskRecord> {
        self.update_one(
            name,
            "record failure",
            "UPDATE care_tasks
             SET last_run_at = ?1,
                 running_since = CASE WHEN running_since = ?1 THEN NULL ELSE running_since END
             WHERE name = ?2",
            &ts(at),
        )
    }

    fn try_claim(&self, name: &str, now: DateTime<Utc>, stale_after: Duration) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("claim"))?;

        let Some(record) = fetch(&tx, name).map_err(db_err("claim"))? else {
            return Err(CareError::NotFound(name.to_string()));
        };
        if !record.is_due(now) || record.is_claimed(now, stale_after) {
            return Ok(false);
        }
        if record.running_since.is_some() {
            tracing::warn!(task = name, "taking over stale run claim");
        }

        tx.execute(
            "UPDATE care_tasks SET running_since = ?1 WHERE name = ?2",
            params![ts(now), name],
        )
        .map_err(db_err("claim"))?;
        tx.commit().map_err(db_err("claim"))?;
        Ok(true)
    }

    fn set_enabled(&self, name: &str, enabled: bool, now: DateTime<Utc>) -> Result<TaskRecord> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("set enabled"))?;
        let changed = tx
            .execute(
                "UPDATE care_tasks SET enabled = ?1, updated_at = ?2 WHERE name = ?3",
                params![enabled as i32, ts(now), name],
            )
            .map_err(db_err("set enabled"))?;
        if changed == 0 {
            return Err(CareError::NotFound(name.to_string()));
        }
        let record = fetch(&tx, name)
            .map_err(db_err("set enabled"))?
            .ok_or_else(|| CareError::NotFound(name.to_string()))?;
        tx.commit().map_err(db_err("set enabled"))?;
        Ok(record)
    }
}

impl SqliteRegistry {
    /// Run a single-row update bound to (`?1` = value, `?2` = name) and return the new row.
    fn update_one(&self, name: &str, op: &'static str, sql: &str, value: &str) -> Result<TaskRecord> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err(op))?;
        let changed = tx.execute(sql, params![value, name]).map_err(db_err(op))?;
        if changed == 0 {
            return Err(CareError::NotFound(name.to_string()));
        }
        let record = fetch(&tx, name)
            .map_err(db_err(op))?
            .ok_or_else(|| CareError::NotFound(name.to_string()))?;
        tx.commit().map_err(db_err(op))?;
        Ok(record)
    }
}

fn db_err(op: &'static str) -> impl Fn(rusqlite::Error) -> CareError {
    move |e| CareError::StorageUnavailable(format!("{op}: {e}"))
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn fetch(conn: &Connection, name: &str) -> rusqlite::Result<Option<TaskRecord>> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM care_tasks WHERE name = ?1"),
        [name],
        row_to_record,
    )
    .optional()
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let schedule: String = row.get(1)?;
    let trigger: Trigger = serde_json::from_str(&schedule)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;
    let total_run_count: i64 = row.get(5)?;

    Ok(TaskRecord {
        name: row.get(0)?,
        trigger,
        action_ref: row.get(2)?,
        description: row.get(3)?,
        enabled: row.get::<_, i32>(4)? != 0,
        total_run_count: total_run_count.max(0) as u64,
        last_run_at: parse_opt_ts(row, 6)?,
        running_since: parse_opt_ts(row, 7)?,
        created_at: parse_ts(row, 8)?,
        updated_at: parse_ts(row, 9)?,
    })
}

fn parse_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn hourly(name: &str) -> ScheduleDefinition {
        ScheduleDefinition::new(name, Trigger::every(Duration::from_secs(3600)), "check_stock_levels")
    }

    #[test]
    fn test_open_and_migrate() {
        let dir = std::env::temp_dir().join("carewatch-registry-test");
        std::fs::create_dir_all(&dir).ok();
        let path = dir.join("open.db");
        std::fs::remove_file(&path).ok();

        let registry = SqliteRegistry::open(&path, Duration::from_secs(1)).unwrap();
        assert!(registry.list().unwrap().is_empty());
        registry.upsert(&hourly("healthcare.stock"), t0()).unwrap();
        drop(registry);

        // Reopening keeps the data and re-running migrations is harmless.
        let registry = SqliteRegistry::open(&path, Duration::from_secs(1)).unwrap();
        assert_eq!(registry.list().unwrap().len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_upsert_creates_with_fresh_state() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        let upsert = registry
            .upsert(&hourly("healthcare.stock").with_description("Stock check"), t0())
            .unwrap();

        assert_eq!(upsert.outcome, UpsertOutcome::Created);
        let record = upsert.record;
        assert!(record.enabled);
        assert_eq!(record.total_run_count, 0);
        assert_eq!(record.last_run_at, None);
        assert_eq!(record.running_since, None);
        assert_eq!(record.created_at, t0());
        assert_eq!(record.description.as_deref(), Some("Stock check"));
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        let def = hourly("healthcare.stock");
        for _ in 0..5 {
            registry.upsert(&def, t0()).unwrap();
        }
        let records = registry.list().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            registry.upsert(&def, t0()).unwrap().outcome,
            UpsertOutcome::Unchanged
        );
    }

    #[test]
    fn test_upsert_updates_schedule_and_keeps_run_state() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        registry.upsert(&hourly("healthcare.stock"), t0()).unwrap();
        registry.record_run("healthcare.stock", t0()).unwrap();
        registry.set_enabled("healthcare.stock", false, t0()).unwrap();

        let changed = ScheduleDefinition::new(
            "healthcare.stock",
            Trigger::every(Duration::from_secs(1800)),
            "check_stock_levels",
        );
        let later = t0() + chrono::Duration::hours(1);
        let upsert = registry.upsert(&changed, later).unwrap();

        assert_eq!(upsert.outcome, UpsertOutcome::Updated);
        assert_eq!(upsert.record.trigger, Trigger::every(Duration::from_secs(1800)));
        assert_eq!(upsert.record.total_run_count, 1);
        assert_eq!(upsert.record.last_run_at, Some(t0()));
        assert!(!upsert.record.enabled);
        assert_eq!(upsert.record.created_at, t0());
        assert_eq!(upsert.record.updated_at, later);
    }

    #[test]
    fn test_description_change_is_not_a_reschedule() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        registry.upsert(&hourly("healthcare.stock"), t0()).unwrap();
        let upsert = registry
            .upsert(&hourly("healthcare.stock").with_description("new text"), t0())
            .unwrap();
        assert_eq!(upsert.outcome, UpsertOutcome::Unchanged);
        assert_eq!(upsert.record.description.as_deref(), Some("new text"));
    }

    #[test]
    fn test_delete() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        registry.upsert(&hourly("healthcare.stock"), t0()).unwrap();
        assert!(registry.delete("healthcare.stock").unwrap());
        assert!(!registry.delete("healthcare.stock").unwrap());
        assert!(registry.get("healthcare.stock").unwrap().is_none());
    }

    #[test]
    fn test_delete_all_matching_is_literal_prefix() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        for name in ["healthcare.a", "healthcare.b", "healthcareX", "billing.sync"] {
            registry.upsert(&hourly(name), t0()).unwrap();
        }
        assert_eq!(registry.delete_all_matching("health%").unwrap(), 0);
        assert_eq!(registry.delete_all_matching("healthcare.").unwrap(), 2);

        let names: Vec<String> = registry.list().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["billing.sync", "healthcareX"]);
    }

    #[test]
    fn test_list_is_ordered_by_name() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        for name in ["healthcare.c", "healthcare.a", "healthcare.b"] {
            registry.upsert(&hourly(name), t0()).unwrap();
        }
        let names: Vec<String> = registry.list().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["healthcare.a", "healthcare.b", "healthcare.c"]);
    }

    #[test]
    fn test_reset_counters() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        registry.upsert(&hourly("healthcare.a"), t0()).unwrap();
        registry.upsert(&hourly("healthcare.b"), t0()).unwrap();
        registry.record_run("healthcare.a", t0()).unwrap();
        registry.record_run("healthcare.a", t0()).unwrap();
        registry.set_enabled("healthcare.b", false, t0()).unwrap();

        assert_eq!(registry.reset_counters().unwrap(), 2);
        let a = registry.get("healthcare.a").unwrap().unwrap();
        let b = registry.get("healthcare.b").unwrap().unwrap();
        assert_eq!(a.total_run_count, 0);
        assert_eq!(a.last_run_at, None);
        assert!(a.enabled);
        assert!(!b.enabled);
        assert_eq!(a.trigger, Trigger::every(Duration::from_secs(3600)));
    }

    #[test]
    fn test_record_run_and_failure() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        registry.upsert(&hourly("healthcare.a"), t0()).unwrap();

        let later = t0() + chrono::Duration::minutes(5);
        let rec = registry.record_run("healthcare.a", t0()).unwrap();
        assert_eq!(rec.total_run_count, 1);
        let rec = registry.record_failure("healthcare.a", later).unwrap();
        assert_eq!(rec.total_run_count, 1);
        assert_eq!(rec.last_run_at, Some(later));
    }

    #[test]
    fn test_record_run_missing_task() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        assert!(matches!(
            registry.record_run("healthcare.gone", t0()),
            Err(CareError::NotFound(name)) if name == "healthcare.gone"
        ));
        assert!(matches!(
            registry.set_enabled("healthcare.gone", true, t0()),
            Err(CareError::NotFound(_))
        ));
    }

    #[test]
    fn test_subsecond_timestamps_roundtrip() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        registry.upsert(&hourly("healthcare.a"), t0()).unwrap();
        let at = t0() + chrono::Duration::nanoseconds(123_456_789);
        let rec = registry.record_run("healthcare.a", at).unwrap();
        assert_eq!(rec.last_run_at, Some(at));
    }

    #[test]
    fn test_try_claim() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        registry.upsert(&hourly("healthcare.a"), t0()).unwrap();
        let stale = Duration::from_secs(600);

        // Not due yet.
        assert!(!registry.try_claim("healthcare.a", t0(), stale).unwrap());

        let due = t0() + chrono::Duration::hours(1);
        assert!(registry.try_claim("healthcare.a", due, stale).unwrap());
        assert!(!registry.try_claim("healthcare.a", due, stale).unwrap());

        // An abandoned claim can be taken over.
        let much_later = due + chrono::Duration::minutes(11);
        assert!(registry.try_claim("healthcare.a", much_later, stale).unwrap());

        // A finished run releases the claim and resets the interval.
        registry.record_run("healthcare.a", much_later).unwrap();
        let rec = registry.get("healthcare.a").unwrap().unwrap();
        assert_eq!(rec.running_since, None);
        assert!(!registry.try_claim("healthcare.a", much_later, stale).unwrap());
    }

    #[test]
    fn test_late_finish_keeps_new_owner_claim() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        registry.upsert(&hourly("healthcare.a"), t0()).unwrap();
        let stale = Duration::from_secs(600);

        let first = t0() + chrono::Duration::hours(1);
        assert!(registry.try_claim("healthcare.a", first, stale).unwrap());
        let second = first + chrono::Duration::minutes(11);
        assert!(registry.try_claim("healthcare.a", second, stale).unwrap());

        // The original claimant resumes and finishes after the takeover.
        let rec = registry.record_run("healthcare.a", first).unwrap();
        assert_eq!(rec.running_since, Some(second));
        assert!(!registry.try_claim("healthcare.a", second, stale).unwrap());
        let rec = registry.record_failure("healthcare.a", first).unwrap();
        assert_eq!(rec.running_since, Some(second));

        let rec = registry.record_run("healthcare.a", second).unwrap();
        assert_eq!(rec.running_since, None);
        assert_eq!(rec.last_run_at, Some(second));
    }

    #[test]
    fn test_disabled_cannot_be_claimed() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        registry.upsert(&hourly("healthcare.a"), t0()).unwrap();
        registry.set_enabled("healthcare.a", false, t0()).unwrap();
        let due = t0() + chrono::Duration::hours(2);
        assert!(!registry.try_claim("healthcare.a", due, Duration::from_secs(60)).unwrap());
    }

    #[test]
    fn test_claim_is_shared_between_handles() {
        let dir = std::env::temp_dir().join("carewatch-registry-shared");
        std::fs::create_dir_all(&dir).ok();
        let path = dir.join("shared.db");
        std::fs::remove_file(&path).ok();

        let a = SqliteRegistry::open(&path, Duration::from_secs(2)).unwrap();
        let b = SqliteRegistry::open(&path, Duration::from_secs(2)).unwrap();
        a.upsert(&hourly("healthcare.a"), t0()).unwrap();

        let due = t0() + chrono::Duration::hours(1);
        let stale = Duration::from_secs(600);
        assert!(a.try_claim("healthcare.a", due, stale).unwrap());
        assert!(!b.try_claim("healthcare.a", due, stale).unwrap());

        b.record_run("healthcare.a", due).unwrap();
        assert_eq!(a.get("healthcare.a").unwrap().unwrap().total_run_count, 1);

        drop(a);
        drop(b);
        std::fs::remove_dir_all(&dir).ok();
    }
}
