//! Failure reporting — where the scheduler sends action errors.
//! Delivery to on-call channels happens outside this crate; sinks here log
//! and keep a short in-memory history.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::actions::ActionError;

/// Max notices kept by [`FailureLog`].
const HISTORY_LIMIT: usize = 100;

/// Receives a notice for every failed invocation.
pub trait ErrorSink: Send + Sync {
    fn report(&self, task_name: &str, error: &ActionError, at: DateTime<Utc>);
}

/// One failed invocation.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FailureNotice {
    pub task_name: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Logs failures through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn report(&self, task_name: &str, error: &ActionError, at: DateTime<Utc>) {
        tracing::error!(task = task_name, at = %at, error = %error, "task run failed");
    }
}

/// In-memory ring buffer of recent failures.
#[derive(Debug)]
pub struct FailureLog {
    history: Mutex<VecDeque<FailureNotice>>,
    limit: usize,
}

impl FailureLog {
    pub fn new() -> Self {
        Self::with_limit(HISTORY_LIMIT)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(limit.min(HISTORY_LIMIT))),
            limit: limit.max(1),
        }
    }

    /// Recorded failures, oldest first.
    pub fn history(&self) -> Vec<FailureNotice> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FailureLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorSink for FailureLog {
    fn report(&self, task_name: &str, error: &ActionError, at: DateTime<Utc>) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(FailureNotice {
            task_name: task_name.to_string(),
            error: error.to_string(),
            at,
        });
        while history.len() > self.limit {
            history.pop_front();
        }
    }
}

/// Forwards every notice to each inner sink.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn ErrorSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl ErrorSink for FanoutSink {
    fn report(&self, task_name: &str, error: &ActionError, at: DateTime<Utc>) {
        for sink in &self.sinks {
            sink.report(task_name, error, at);
        }
    }
}
