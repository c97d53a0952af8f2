//! Scheduler engine — polls the registry and fires due tasks.
//! Each worker ticks on a tokio interval; a task only runs after its claim
//! is won in the registry, so workers and processes can share one database.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use carewatch_core::config::SchedulerConfig;
use carewatch_core::error::{CareError, Result};

use crate::actions::{ActionContext, ActionError, ActionRegistry, CancellationToken};
use crate::clock::Clock;
use crate::notify::ErrorSink;
use crate::registry::TaskRegistry;
use crate::tasks::TaskRecord;

/// Floor for the poll period; `tokio::time::interval` rejects zero.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Result of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub task_name: String,
    pub started_at: DateTime<Utc>,
    pub outcome: std::result::Result<(), ActionError>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Fires due tasks from a shared [`TaskRegistry`].
pub struct Scheduler {
    registry: Arc<dyn TaskRegistry>,
    actions: Arc<ActionRegistry>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn ErrorSink>,
    poll_interval: Duration,
    max_run: Duration,
    stale_after: Duration,
    workers: usize,
}

impl Scheduler {
    pub fn new(
        registry: Arc<dyn TaskRegistry>,
        actions: Arc<ActionRegistry>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn ErrorSink>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            actions,
            clock,
            sink,
            poll_interval: config.poll_interval().max(MIN_POLL_INTERVAL),
            max_run: config.max_run_duration(),
            stale_after: config.stale_claim_after(),
            workers: config.workers.max(1),
        }
    }

    pub fn with_poll_interval(mut self, every: Duration) -> Self {
        self.poll_interval = every.max(MIN_POLL_INTERVAL);
        self
    }

    /// Override the per-run time limit. Claims stay exclusive for at least as long.
    pub fn with_max_run(mut self, limit: Duration) -> Self {
        self.max_run = limit;
        self.stale_after = self.stale_after.max(limit);
        self
    }

    /// Fail if any enabled task points at an action this process can't run.
    pub fn ensure_actions(&self) -> Result<()> {
        for record in self.registry.list()? {
            if record.enabled {
                self.actions.ensure_known(&record.name, &record.action_ref)?;
            }
        }
        Ok(())
    }

    /// Run a registry call on the blocking pool. SQLite may wait on another
    /// process's lock for up to the busy timeout.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn TaskRegistry) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        tokio::task::spawn_blocking(move || f(registry.as_ref()))
            .await
            .map_err(|e| CareError::StorageUnavailable(format!("registry call failed: {e}")))?
    }

    /// Claim every due task and start it on `running`.
    /// Returns how many runs were started.
    pub async fn poll(self: &Arc<Self>, running: &mut JoinSet<RunReport>) -> Result<usize> {
        let now = self.clock.now();
        let stale_after = self.stale_after;
        let mut started = 0;

        for record in self.blocking(|registry| registry.list()).await? {
            if !record.is_due(now) {
                continue;
            }
            let name = record.name.clone();
            let claimed = self
                .blocking(move |registry| registry.try_claim(&name, now, stale_after))
                .await;
            match claimed {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(task = %record.name, "claimed elsewhere, skipping");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(task = %record.name, error = %e, "claim failed, skipping");
                    continue;
                }
            }

            let this = Arc::clone(self);
            running.spawn(async move { this.execute(record, now).await });
            started += 1;
        }

        Ok(started)
    }

    /// Fire everything due right now and wait for the results.
    pub async fn run_due(self: &Arc<Self>) -> Result<Vec<RunReport>> {
        let mut running = JoinSet::new();
        self.poll(&mut running).await?;

        let mut reports = Vec::new();
        while let Some(joined) = running.join_next().await {
            if let Some(report) = reaped(joined) {
                reports.push(report);
            }
        }
        Ok(reports)
    }

    /// Start the worker loops. They stop once `shutdown` flips to `true`,
    /// after letting in-flight runs finish.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        tracing::info!(
            "⏰ Scheduler started ({} worker(s), poll every {:?}, max run {:?})",
            self.workers,
            self.poll_interval,
            self.max_run
        );
        (0..self.workers)
            .map(|id| tokio::spawn(Arc::clone(self).worker_loop(id, shutdown.clone())))
            .collect()
    }

    async fn worker_loop(self: Arc<Self>, id: usize, mut shutdown: watch::Receiver<bool>) {
        // Spread workers across the poll period.
        let offset = self.poll_interval.mul_f64(id as f64 / self.workers as f64);
        let mut interval =
            tokio::time::interval_at(tokio::time::Instant::now() + offset, self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut running: JoinSet<RunReport> = JoinSet::new();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.poll(&mut running).await {
                        Ok(0) => {}
                        Ok(started) => tracing::debug!(worker = id, started, "poll started runs"),
                        Err(e) => tracing::warn!(worker = id, error = %e, "poll skipped"),
                    }
                }
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    reaped(joined);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if !running.is_empty() {
            tracing::info!(worker = id, in_flight = running.len(), "waiting for running tasks");
        }
        while let Some(joined) = running.join_next().await {
            reaped(joined);
        }
        tracing::debug!(worker = id, "scheduler worker stopped");
    }

    /// Run one claimed task to completion and record the outcome.
    async fn execute(&self, record: TaskRecord, started_at: DateTime<Utc>) -> RunReport {
        tracing::info!(task = %record.name, action = %record.action_ref, "📣 task fired");

        let outcome = match self.actions.get(&record.action_ref) {
            Some(action) => {
                let token = CancellationToken::new();
                let ctx = ActionContext {
                    task_name: record.name.clone(),
                    action_ref: record.action_ref.clone(),
                    started_at,
                    previous_runs: record.total_run_count,
                    cancellation: token.clone(),
                };
                let mut handle = tokio::spawn(async move { action.invoke(&ctx).await });

                match tokio::time::timeout(self.max_run, &mut handle).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(e)) => Err(join_failure(e)),
                    Err(_) => {
                        token.cancel();
                        handle.abort();
                        Err(ActionError::TimedOut(self.max_run))
                    }
                }
            }
            None => Err(ActionError::Unknown(record.action_ref.clone())),
        };

        if let Err(e) = &outcome {
            self.sink.report(&record.name, e, self.clock.now());
        }
        let name = record.name.clone();
        let succeeded = outcome.is_ok();
        let recorded = self
            .blocking(move |registry| {
                if succeeded {
                    registry.record_run(&name, started_at)
                } else {
                    registry.record_failure(&name, started_at)
                }
            })
            .await;
        match recorded {
            Ok(updated) if outcome.is_ok() => {
                tracing::info!(task = %record.name, runs = updated.total_run_count, "✅ task completed");
            }
            Ok(_) => {}
            Err(e) => warn_unrecorded(&record.name, &e),
        }

        RunReport {
            task_name: record.name,
            started_at,
            outcome,
        }
    }
}

fn warn_unrecorded(task: &str, error: &CareError) {
    tracing::warn!(
        task,
        error = %error,
        "run finished but could not be recorded; claim will expire"
    );
}

fn join_failure(e: JoinError) -> ActionError {
    if e.is_cancelled() {
        return ActionError::Cancelled;
    }
    let payload = e.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into());
    ActionError::Panicked(message)
}

fn reaped(joined: std::result::Result<RunReport, JoinError>) -> Option<RunReport> {
    match joined {
        Ok(report) => Some(report),
        Err(e) => {
            tracing::error!(error = %e, "task executor crashed");
            None
        }
    }
}
