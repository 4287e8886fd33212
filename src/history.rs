//! Queries over past executions
//!
//! Everything here reads the lock directory directly. Lock files that cannot
//! be read or decoded are skipped with a warning so one bad file never hides
//! the rest of the history.

use crate::error::Result;
use crate::lock::{keys, ExecutionLock, LockStatus};
use crate::storage::LockDirectory;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// One row of an execution report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub case_name: String,
    pub lock_name: String,
    /// Requested fields, `null` when the lock does not have them
    pub fields: BTreeMap<String, Value>,
    /// Every other non-bookkeeping attribute, rendered as `key: value`
    pub data: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExecutionHistory {
    directory: LockDirectory,
}

impl ExecutionHistory {
    pub fn new(directory: LockDirectory) -> Self {
        Self { directory }
    }

    pub fn directory(&self) -> &LockDirectory {
        &self.directory
    }

    /// Locks oldest first, optionally restricted to one case and to locks not
    /// yet reported
    pub fn executions(
        &self,
        case_name: Option<&str>,
        only_unreported: bool,
    ) -> Result<Vec<ExecutionLock>> {
        let entries = match case_name {
            Some(name) => self.directory.list_for_case(name)?,
            None => self.directory.list()?,
        };

        let mut locks = Vec::new();
        for entry in entries {
            match ExecutionLock::open_entry(&self.directory, &entry) {
                Ok(lock) if only_unreported && lock.is_reported() => {}
                Ok(lock) => locks.push(lock),
                Err(e) => warn!("Skipping lock {}: {}", entry.name, e),
            }
        }
        locks.sort_by(|a, b| a.execution_order().cmp(&b.execution_order()));
        Ok(locks)
    }

    /// Newest lock of `case_name` whose run finished successfully
    pub fn latest_successful(&self, case_name: &str) -> Result<Option<ExecutionLock>> {
        Ok(self
            .executions(Some(case_name), false)?
            .into_iter()
            .rev()
            .find(|lock| lock.status() == Some(LockStatus::Success)))
    }

    /// Build report rows for every unreported lock of `case_names` and mark
    /// those locks reported.
    ///
    /// `fields` are pulled out by name; remaining free-form attributes go to
    /// [`ReportRow::data`].
    pub fn execution_report(&self, fields: &[&str], case_names: &[&str]) -> Result<Vec<ReportRow>> {
        let mut rows = Vec::new();

        for case_name in case_names {
            for mut lock in self.executions(Some(case_name), true)? {
                let selected: BTreeMap<String, Value> = fields
                    .iter()
                    .map(|field| {
                        let value = lock.get_attribute(field).cloned().unwrap_or(Value::Null);
                        (field.to_string(), value)
                    })
                    .collect();

                let data = lock
                    .attributes()
                    .into_iter()
                    .filter(|(key, _)| !fields.contains(&key.as_str()) && key != keys::REPORTED)
                    .map(|(key, value)| format!("{key}: {}", render_value(&value)))
                    .collect();

                rows.push(ReportRow {
                    case_name: lock.case_name().to_string(),
                    lock_name: lock.name().to_string(),
                    fields: selected,
                    data,
                });
                lock.mark_reported()?;
            }
        }

        info!(rows = rows.len(), "Execution report built");
        Ok(rows)
    }

    /// Wipe locks of `exec_id` whose status was never set. Returns how many
    /// were removed.
    pub fn cleanup_unfinished(&self, exec_id: u64) -> Result<usize> {
        let mut removed = 0;
        for mut lock in self.executions(None, false)? {
            if lock.exec_id() == Some(exec_id) && lock.status().is_none() {
                debug!(lock = %lock.name(), "Removing lock that never started");
                lock.wipe()?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
