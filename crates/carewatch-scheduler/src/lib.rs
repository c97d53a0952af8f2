//! # CareWatch Scheduler
//!
//! Recurring task orchestration for clinic back-office jobs: medication
//! reminders, stock alerts, nightly data cleanup.
//!
//! ## Design Principles
//! - One SQLite registry is the source of truth, shared by every process
//! - Catalog reconciliation is idempotent and never touches run history
//!   unless a force reinstall is requested
//! - A run is claimed in the registry before it starts, so no task overlaps
//!   itself across workers or processes
//! - Action failures, timeouts and panics are contained and reported
//!
//! ## Architecture
//! ```text
//! Catalog (TOML or builtin)
//!   └── TaskLifecycleManager::reconcile → TaskRegistry (SQLite)
//!
//! Scheduler (tokio interval per worker)
//!   ├── list due records → try_claim
//!   ├── ActionRegistry: "send_reminders" → Action::invoke (timeout, panic guard)
//!   ├── success → record_run (total_run_count += 1)
//!   └── failure → record_failure → ErrorSink
//!                  ├── TracingSink
//!                  └── FailureLog (ring buffer)
//! ```

pub mod actions;
pub mod catalog;
pub mod clock;
pub mod cron;
pub mod engine;
pub mod lifecycle;
pub mod notify;
pub mod persistence;
pub mod registry;
pub mod tasks;

pub use actions::{Action, ActionContext, ActionError, ActionRegistry, CancellationToken};
pub use catalog::Catalog;
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{RunReport, Scheduler};
pub use lifecycle::{ReconcileReport, TaskLifecycleManager, TaskOverview};
pub use notify::{ErrorSink, FailureLog, FailureNotice, FanoutSink, TracingSink};
pub use persistence::SqliteRegistry;
pub use registry::{TaskRegistry, Upsert, UpsertOutcome};
pub use tasks::{ScheduleDefinition, TaskRecord, TaskState, Trigger};
