//! Action registry — maps stable action keys to invocable handlers.
//!
//! Catalog entries reference actions by key (`"send_reminders"`). Keys are
//! checked when a catalog is reconciled and when the scheduler starts.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Notify;

use carewatch_core::error::{CareError, Result};

/// Why an invocation failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("{0}")]
    Failed(String),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("cancelled")]
    Cancelled,
    #[error("action panicked: {0}")]
    Panicked(String),
    #[error("no action registered under '{0}'")]
    Unknown(String),
}

/// Cooperative cancellation signal handed to every invocation.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// What an action gets to know about the run it is serving.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub task_name: String,
    pub action_ref: String,
    /// When the executor claimed the run.
    pub started_at: DateTime<Utc>,
    /// Successful runs before this one.
    pub previous_runs: u64,
    pub cancellation: CancellationToken,
}

#[async_trait]
pub trait Action: Send + Sync {
    async fn invoke(&self, ctx: &ActionContext) -> std::result::Result<(), ActionError>;
}

/// Adapter turning an async closure into an [`Action`].
pub struct FnAction<F> {
    f: F,
}

impl<F> FnAction<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Action for FnAction<F>
where
    F: Fn(ActionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), ActionError>> + Send + 'static,
{
    async fn invoke(&self, ctx: &ActionContext) -> std::result::Result<(), ActionError> {
        (self.f)(ctx.clone()).await
    }
}

/// Registry of invocable actions, keyed by `action_ref`.
#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. A second registration under the same key replaces the first.
    pub fn register(&mut self, key: &str, action: Arc<dyn Action>) {
        if self.actions.insert(key.to_string(), action).is_some() {
            tracing::warn!(action = key, "action handler replaced");
        } else {
            tracing::debug!(action = key, "action registered");
        }
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&mut self, key: &str, f: F)
    where
        F: Fn(ActionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), ActionError>> + Send + 'static,
    {
        self.register(key, Arc::new(FnAction::new(f)));
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.actions.contains_key(key)
    }

    /// Fail with `UnknownAction` when `task` points at an unregistered key.
    pub fn ensure_known(&self, task: &str, key: &str) -> Result<()> {
        if self.contains(key) {
            Ok(())
        } else {
            Err(CareError::UnknownAction {
                task: task.to_string(),
                action: key.to_string(),
            })
        }
    }

    /// Resolve and run `key` in one step.
    pub async fn invoke(
        &self,
        key: &str,
        ctx: &ActionContext,
    ) -> std::result::Result<(), ActionError> {
        match self.get(key) {
            Some(action) => action.invoke(ctx).await,
            None => Err(ActionError::Unknown(key.to_string())),
        }
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}
