//! Task catalog — the operator-maintained list of recurring jobs.
//!
//! ```toml
//! namespace = "healthcare."
//!
//! [[task]]
//! name = "healthcare.medication-reminder-daily"
//! action = "send_reminders"
//! description = "Morning medication reminders"
//! trigger = { kind = "crontab", minute = "0", hour = "8" }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use carewatch_core::error::{CareError, Result};

use crate::actions::ActionRegistry;
use crate::tasks::{ScheduleDefinition, Trigger};

/// Desired set of tasks plus the name prefix that marks them as ours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    /// Every task name must start with this. Force reinstall deletes by it.
    pub namespace: String,
    #[serde(default, rename = "task")]
    pub tasks: Vec<ScheduleDefinition>,
}

impl Catalog {
    pub fn new(namespace: &str, tasks: Vec<ScheduleDefinition>) -> Self {
        Self {
            namespace: namespace.to_string(),
            tasks,
        }
    }

    /// Load a catalog from a TOML file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CareError::Config(format!("Failed to read catalog {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| CareError::Config(format!("Failed to parse catalog: {e}")))
    }

    /// The three jobs every deployment runs.
    pub fn builtin() -> Self {
        Self::new(
            "healthcare.",
            vec![
                ScheduleDefinition::new(
                    "healthcare.medication-reminder-daily",
                    Trigger::daily_at(8, 0),
                    "send_reminders",
                )
                .with_description("Send the day's medication reminders to patients"),
                ScheduleDefinition::new(
                    "healthcare.stock-level-alert",
                    Trigger::every(Duration::from_secs(30 * 60)),
                    "check_stock_levels",
                )
                .with_description("Alert pharmacy staff about items below reorder level"),
                ScheduleDefinition::new(
                    "healthcare.data-cleanup-nightly",
                    Trigger::crontab("30", "2", "*", "*", "*"),
                    "cleanup_expired_data",
                )
                .with_description("Purge expired reminder logs and stale alerts"),
            ],
        )
    }

    /// Check the catalog before anything is written and return the entries
    /// to apply, in order, with exact repeats collapsed.
    pub fn validated(&self, actions: &ActionRegistry) -> Result<Vec<&ScheduleDefinition>> {
        if self.namespace.trim().is_empty() {
            return Err(CareError::Config("catalog namespace must not be empty".into()));
        }

        let mut seen: HashMap<&str, &ScheduleDefinition> = HashMap::new();
        let mut entries = Vec::with_capacity(self.tasks.len());

        for def in &self.tasks {
            if !def.name.starts_with(&self.namespace) || def.name.len() == self.namespace.len() {
                return Err(CareError::OutsideNamespace {
                    task: def.name.clone(),
                    namespace: self.namespace.clone(),
                });
            }
            if let Some(previous) = seen.get(def.name.as_str()) {
                if *previous != def {
                    return Err(CareError::DuplicateTrigger(def.name.clone()));
                }
                continue;
            }
            def.trigger
                .validate()
                .map_err(|reason| CareError::InvalidTrigger {
                    task: def.name.clone(),
                    reason,
                })?;
            actions.ensure_known(&def.name, &def.action_ref)?;

            seen.insert(&def.name, def);
            entries.push(def);
        }

        Ok(entries)
    }
}
