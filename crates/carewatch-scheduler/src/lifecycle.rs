//! Task lifecycle — installs a catalog into the registry and resets run state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use carewatch_core::error::{CareError, Result};

use crate::actions::ActionRegistry;
use crate::catalog::Catalog;
use crate::clock::Clock;
use crate::registry::{TaskRegistry, UpsertOutcome};
use crate::tasks::{TaskRecord, TaskState};

/// Counts from one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Names upserted, in catalog order.
    pub applied: Vec<String>,
}

/// A record plus its computed status, for operator listings.
#[derive(Debug, Clone, Serialize)]
pub struct TaskOverview {
    pub record: TaskRecord,
    pub state: TaskState,
    pub next_due_at: Option<DateTime<Utc>>,
}

pub struct TaskLifecycleManager {
    registry: Arc<dyn TaskRegistry>,
    actions: Arc<ActionRegistry>,
    clock: Arc<dyn Clock>,
}

impl TaskLifecycleManager {
    pub fn new(
        registry: Arc<dyn TaskRegistry>,
        actions: Arc<ActionRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            actions,
            clock,
        }
    }

    /// Make the registry match `catalog`.
    ///
    /// With `force`, every record in the catalog's namespace is deleted first,
    /// discarding its run history. Entries are then upserted in order; the
    /// first storage failure aborts with the names applied so far.
    pub fn reconcile(&self, catalog: &Catalog, force: bool) -> Result<ReconcileReport> {
        let entries = catalog.validated(&self.actions)?;
        let mut report = ReconcileReport::default();

        if force {
            report.deleted = self
                .registry
                .delete_all_matching(&catalog.namespace)
                .map_err(|e| aborted(&report, e))?;
            tracing::warn!(
                namespace = %catalog.namespace,
                deleted = report.deleted,
                "force reinstall: removed existing tasks and their history"
            );
        }

        for def in entries {
            let upsert = self
                .registry
                .upsert(def, self.clock.now())
                .map_err(|e| aborted(&report, e))?;

            match upsert.outcome {
                UpsertOutcome::Created => {
                    report.created += 1;
                    tracing::info!(task = %def.name, trigger = %def.trigger, "task installed");
                }
                UpsertOutcome::Updated => {
                    report.updated += 1;
                    tracing::info!(task = %def.name, trigger = %def.trigger, "task rescheduled");
                }
                UpsertOutcome::Unchanged => {
                    tracing::debug!(task = %def.name, "task unchanged");
                }
            }
            report.applied.push(def.name.clone());
        }

        tracing::info!(
            created = report.created,
            updated = report.updated,
            deleted = report.deleted,
            "catalog reconciled"
        );
        Ok(report)
    }

    /// Zero every run counter.
    pub fn reset_all(&self) -> Result<usize> {
        let count = self.registry.reset_counters()?;
        tracing::info!(count, "run counters reset");
        Ok(count)
    }

    /// Every record with its current status, ordered by name.
    pub fn list(&self) -> Result<Vec<TaskOverview>> {
        let now = self.clock.now();
        Ok(self
            .registry
            .list()?
            .into_iter()
            .map(|record| TaskOverview {
                state: record.state(now),
                next_due_at: record.next_due_at(),
                record,
            })
            .collect())
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<TaskRecord> {
        let record = self.registry.set_enabled(name, enabled, self.clock.now())?;
        tracing::info!(task = name, enabled, "task enabled flag changed");
        Ok(record)
    }

    /// Delete one task and its history.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let removed = self.registry.delete(name)?;
        if removed {
            tracing::warn!(task = name, "task removed");
        }
        Ok(removed)
    }
}

fn aborted(report: &ReconcileReport, source: CareError) -> CareError {
    tracing::error!(
        applied = report.applied.len(),
        error = %source,
        "reconciliation aborted"
    );
    CareError::ReconcileAborted {
        applied: report.applied.clone(),
        source: Box::new(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::SqliteRegistry;
    use crate::registry::Upsert;
    use crate::tasks::{ScheduleDefinition, Trigger};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).unwrap()
    }

    fn actions() -> Arc<ActionRegistry> {
        let mut actions = ActionRegistry::new();
        for key in ["send_reminders", "check_stock_levels", "cleanup_expired_data"] {
            actions.register_fn(key, |_ctx| async { Ok(()) });
        }
        Arc::new(actions)
    }

    fn manager_with(registry: Arc<dyn TaskRegistry>) -> TaskLifecycleManager {
        TaskLifecycleManager::new(registry, actions(), Arc::new(ManualClock::new(t0())))
    }

    fn def(name: &str, hour: u32) -> ScheduleDefinition {
        ScheduleDefinition::new(name, Trigger::daily_at(hour, 0), "send_reminders")
    }

    fn names(registry: &dyn TaskRegistry) -> Vec<String> {
        registry.list().unwrap().into_iter().map(|r| r.name).collect()
    }

    #[test]
    fn test_medication_reminder_scenario() {
        let registry = Arc::new(SqliteRegistry::open_in_memory().unwrap());
        let manager = manager_with(registry.clone());
        let catalog = Catalog::new(
            "medication-",
            vec![ScheduleDefinition::new(
                "medication-reminder-daily",
                Trigger::crontab("0", "8", "*", "*", "*"),
                "send_reminders",
            )],
        );

        let first = manager.reconcile(&catalog, false).unwrap();
        assert_eq!((first.created, first.updated, first.deleted), (1, 0, 0));
        let records = registry.list().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].enabled);
        assert_eq!(records[0].total_run_count, 0);

        let second = manager.reconcile(&catalog, false).unwrap();
        assert_eq!((second.created, second.updated, second.deleted), (0, 0, 0));
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let registry = Arc::new(SqliteRegistry::open_in_memory().unwrap());
        let manager = manager_with(registry.clone());
        let catalog = Catalog::builtin();

        manager.reconcile(&catalog, false).unwrap();
        let snapshot = registry.list().unwrap();
        let again = manager.reconcile(&catalog, false).unwrap();

        assert_eq!(again.created + again.updated, 0);
        assert_eq!(again.applied.len(), 3);
        assert_eq!(registry.list().unwrap(), snapshot);
    }

    #[test]
    fn test_catalog_order_does_not_matter() {
        let a = Arc::new(SqliteRegistry::open_in_memory().unwrap());
        let b = Arc::new(SqliteRegistry::open_in_memory().unwrap());
        let mut reversed = Catalog::builtin();
        reversed.tasks.reverse();

        manager_with(a.clone()).reconcile(&Catalog::builtin(), false).unwrap();
        manager_with(b.clone()).reconcile(&reversed, false).unwrap();
        assert_eq!(a.list().unwrap(), b.list().unwrap());
    }

    #[test]
    fn test_changed_trigger_counts_as_update() {
        let registry = Arc::new(SqliteRegistry::open_in_memory().unwrap());
        let manager = manager_with(registry.clone());
        manager
            .reconcile(&Catalog::new("healthcare.", vec![def("healthcare.a", 8)]), false)
            .unwrap();
        registry.record_run("healthcare.a", t0()).unwrap();

        let report = manager
            .reconcile(&Catalog::new("healthcare.", vec![def("healthcare.a", 9)]), false)
            .unwrap();
        assert_eq!((report.created, report.updated), (0, 1));
        let rec = registry.get("healthcare.a").unwrap().unwrap();
        assert_eq!(rec.trigger, Trigger::daily_at(9, 0));
        assert_eq!(rec.total_run_count, 1);
    }

    #[test]
    fn test_force_recreate() {
        let registry = Arc::new(SqliteRegistry::open_in_memory().unwrap());
        let manager = manager_with(registry.clone());
        manager
            .reconcile(
                &Catalog::new("healthcare.", vec![def("healthcare.a", 8), def("healthcare.b", 9)]),
                false,
            )
            .unwrap();
        registry.record_run("healthcare.a", t0()).unwrap();
        registry.upsert(&def("billing.sync", 1), t0()).unwrap();

        let report = manager
            .reconcile(
                &Catalog::new("healthcare.", vec![def("healthcare.a", 8), def("healthcare.c", 10)]),
                true,
            )
            .unwrap();

        assert_eq!(report.deleted, 2);
        assert_eq!(report.created, 2);
        assert_eq!(
            names(registry.as_ref()),
            vec!["billing.sync", "healthcare.a", "healthcare.c"]
        );
        let a = registry.get("healthcare.a").unwrap().unwrap();
        assert_eq!(a.total_run_count, 0);
        assert_eq!(a.last_run_at, None);
        assert_eq!(
            registry.get("healthcare.c").unwrap().unwrap().total_run_count,
            0
        );
    }

    #[test]
    fn test_duplicate_trigger_aborts_before_writing() {
        let registry = Arc::new(SqliteRegistry::open_in_memory().unwrap());
        let manager = manager_with(registry.clone());
        let catalog = Catalog::new(
            "healthcare.",
            vec![def("healthcare.a", 8), def("healthcare.b", 8), def("healthcare.a", 9)],
        );
        assert!(matches!(
            manager.reconcile(&catalog, true),
            Err(CareError::DuplicateTrigger(_))
        ));
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn test_reset_all() {
        let registry = Arc::new(SqliteRegistry::open_in_memory().unwrap());
        let manager = manager_with(registry.clone());
        manager.reconcile(&Catalog::builtin(), false).unwrap();
        registry
            .record_run("healthcare.stock-level-alert", t0())
            .unwrap();
        manager.set_enabled("healthcare.data-cleanup-nightly", false).unwrap();

        assert_eq!(manager.reset_all().unwrap(), 3);
        for overview in manager.list().unwrap() {
            assert_eq!(overview.record.total_run_count, 0);
            assert_eq!(overview.record.last_run_at, None);
        }
        let cleanup = registry.get("healthcare.data-cleanup-nightly").unwrap().unwrap();
        assert!(!cleanup.enabled);
    }

    #[test]
    fn test_list_reports_state() {
        let registry = Arc::new(SqliteRegistry::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(t0()));
        let manager = TaskLifecycleManager::new(registry.clone(), actions(), clock.clone());
        manager.reconcile(&Catalog::builtin(), false).unwrap();
        manager.set_enabled("healthcare.data-cleanup-nightly", false).unwrap();

        clock.advance(chrono::Duration::minutes(45));
        let overview = manager.list().unwrap();
        let state = |name: &str| {
            overview
                .iter()
                .find(|o| o.record.name == name)
                .map(|o| o.state)
                .unwrap()
        };
        assert_eq!(state("healthcare.data-cleanup-nightly"), TaskState::Disabled);
        assert_eq!(state("healthcare.stock-level-alert"), TaskState::Due);
        assert_eq!(state("healthcare.medication-reminder-daily"), TaskState::Idle);
    }

    #[test]
    fn test_remove() {
        let registry = Arc::new(SqliteRegistry::open_in_memory().unwrap());
        let manager = manager_with(registry.clone());
        manager.reconcile(&Catalog::builtin(), false).unwrap();
        assert!(manager.remove("healthcare.stock-level-alert").unwrap());
        assert!(!manager.remove("healthcare.stock-level-alert").unwrap());
        assert_eq!(registry.list().unwrap().len(), 2);
    }

    /// Registry whose upserts start failing after a set number of calls.
    struct FlakyRegistry {
        inner: SqliteRegistry,
        upserts_before_failure: usize,
        upserts: AtomicUsize,
    }

    impl TaskRegistry for FlakyRegistry {
        fn upsert(&self, definition: &ScheduleDefinition, now: DateTime<Utc>) -> Result<Upsert> {
            if self.upserts.fetch_add(1, Ordering::SeqCst) >= self.upserts_before_failure {
                return Err(CareError::StorageUnavailable("database is locked".into()));
            }
            self.inner.upsert(definition, now)
        }
        fn get(&self, name: &str) -> Result<Option<TaskRecord>> {
            self.inner.get(name)
        }
        fn delete(&self, name: &str) -> Result<bool> {
            self.inner.delete(name)
        }
        fn delete_all_matching(&self, prefix: &str) -> Result<usize> {
            self.inner.delete_all_matching(prefix)
        }
        fn list(&self) -> Result<Vec<TaskRecord>> {
            self.inner.list()
        }
        fn reset_counters(&self) -> Result<usize> {
            self.inner.reset_counters()
        }
        fn record_run(&self, name: &str, at: DateTime<Utc>) -> Result<TaskRecord> {
            self.inner.record_run(name, at)
        }
        fn record_failure(&self, name: &str, at: DateTime<Utc>) -> Result<TaskRecord> {
            self.inner.record_failure(name, at)
        }
        fn try_claim(&self, name: &str, now: DateTime<Utc>, stale_after: Duration) -> Result<bool> {
            self.inner.try_claim(name, now, stale_after)
        }
        fn set_enabled(&self, name: &str, enabled: bool, now: DateTime<Utc>) -> Result<TaskRecord> {
            self.inner.set_enabled(name, enabled, now)
        }
    }

    #[test]
    fn test_storage_failure_reports_applied_names() {
        let registry = Arc::new(FlakyRegistry {
            inner: SqliteRegistry::open_in_memory().unwrap(),
            upserts_before_failure: 1,
            upserts: AtomicUsize::new(0),
        });
        let manager = manager_with(registry.clone());
        let catalog = Catalog::builtin();

        match manager.reconcile(&catalog, false) {
            Err(CareError::ReconcileAborted { applied, source }) => {
                assert_eq!(applied, vec!["healthcare.medication-reminder-daily"]);
                assert!(matches!(*source, CareError::StorageUnavailable(_)));
            }
            other => panic!("expected ReconcileAborted, got {other:?}"),
        }
        assert_eq!(registry.list().unwrap().len(), 1);
    }
}
