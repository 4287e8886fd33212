//! Execution locks
//!
//! An execution lock is the persisted bookkeeping of one run of one test
//! case: which steps it declared, which of them started, whether and where
//! it paused or failed, and whatever case attributes were kept at teardown.
//! Locks are named `<uid>_<case name>` and live side by side in the lock
//! directory; a later run finds them by that suffix.

mod status;

pub use status::LockStatus;

use crate::error::{EngineError, Result};
use crate::storage::{LockDirectory, LockEntry, PersistentRecord};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Attribute names used in lock files
pub mod keys {
    pub const STATUS: &str = "status";
    pub const DECLARED_STEPS: &str = "steps";
    pub const RUNNED_STEPS: &str = "runned_steps";
    pub const RUNNED_STEPS_INFO: &str = "runned_steps_info";
    pub const FAILURE_STEP: &str = "failure";
    pub const FAILURE_MESSAGE: &str = "failure_msg";
    pub const PAUSED_STEPS: &str = "pauses";
    pub const TARGET_DATETIME: &str = "target_datetime";
    pub const EXEC_ID: &str = "exec_id";
    pub const PREVIOUS_RUN: &str = "previous_run";
    pub const DATA_FILE_NAME: &str = "data_file_name";
    pub const TEST_DESCRIPTION: &str = "test_description";
    pub const TEST_VIDEO: &str = "test_video";
    pub const REPORTED: &str = "reported";

    /// Never copied from a prior lock into a replayed run
    pub const NOT_IMPORTED: [&str; 4] = [STATUS, DECLARED_STEPS, TARGET_DATETIME, PAUSED_STEPS];

    /// Step and lifecycle bookkeeping owned by the engine
    pub const BOOKKEEPING: [&str; 8] = [
        STATUS,
        DECLARED_STEPS,
        RUNNED_STEPS,
        RUNNED_STEPS_INFO,
        FAILURE_STEP,
        FAILURE_MESSAGE,
        PAUSED_STEPS,
        TARGET_DATETIME,
    ];

    /// Run metadata written by the engine rather than by test cases
    pub const RUN_METADATA: [&str; 6] = [
        EXEC_ID,
        PREVIOUS_RUN,
        DATA_FILE_NAME,
        TEST_DESCRIPTION,
        TEST_VIDEO,
        REPORTED,
    ];

    pub fn is_bookkeeping(key: &str) -> bool {
        BOOKKEEPING.contains(&key)
    }

    pub fn is_engine_owned(key: &str) -> bool {
        is_bookkeeping(key) || RUN_METADATA.contains(&key)
    }
}

/// Split a lock name into its uid and case name at the last `_`
pub fn split_lock_name(name: &str) -> (&str, &str) {
    name.rsplit_once('_').unwrap_or(("", name))
}

/// Persistent bookkeeping for one run of one test case
#[derive(Debug)]
pub struct ExecutionLock {
    record: PersistentRecord,
    dir: PathBuf,
    uid: String,
    case_name: String,
    last_step: Option<String>,
    prior: Option<Box<ExecutionLock>>,
}

impl ExecutionLock {
    pub fn lock_name(uid: &str, case_name: &str) -> String {
        format!("{uid}_{case_name}")
    }

    /// Bind to the lock for `uid` and `case_name`, creating it lazily.
    ///
    /// Nothing is written until the first mutation. If the file already
    /// exists its content is loaded.
    pub fn create(dir: &Path, uid: &str, case_name: &str) -> Result<Self> {
        let name = Self::lock_name(uid, case_name);
        let record = PersistentRecord::open(dir, &name, true)?;
        Ok(Self::from_record(record, dir, uid, case_name))
    }

    /// Open an existing lock by name
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        let record = PersistentRecord::open(dir, name, true)?;
        if !record.is_persisted() {
            return Err(EngineError::not_found(name));
        }
        let (uid, case_name) = split_lock_name(name);
        Ok(Self::from_record(record, dir, uid, case_name))
    }

    pub fn open_entry(directory: &LockDirectory, entry: &LockEntry) -> Result<Self> {
        Self::open(directory.root(), &entry.name)
    }

    fn from_record(record: PersistentRecord, dir: &Path, uid: &str, case_name: &str) -> Self {
        let mut lock = Self {
            record,
            dir: dir.to_path_buf(),
            uid: uid.to_string(),
            case_name: case_name.to_string(),
            last_step: None,
            prior: None,
        };
        lock.last_step = lock.runned_steps().pop();
        lock
    }

    pub fn name(&self) -> &str {
        self.record.name()
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn case_name(&self) -> &str {
        &self.case_name
    }

    pub fn path(&self) -> &Path {
        self.record.path()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_persisted(&self) -> bool {
        self.record.is_persisted()
    }

    /// `None` means the status is unset
    pub fn status(&self) -> Option<LockStatus> {
        self.record
            .get(keys::STATUS)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }

    pub fn set_status(&mut self, status: LockStatus) -> Result<()> {
        debug!(lock = %self.name(), %status, "Lock status changed");
        self.record.replace_or_set(keys::STATUS, status.as_str())
    }

    pub fn declared_steps(&self) -> Vec<String> {
        self.string_list(keys::DECLARED_STEPS)
    }

    pub fn add_declared_step(&mut self, step: &str) -> Result<()> {
        let mut steps = self.declared_steps();
        if steps.iter().any(|s| s == step) {
            return Ok(());
        }
        steps.push(step.to_string());
        self.record.replace_or_set(keys::DECLARED_STEPS, &steps)
    }

    /// Steps that began executing, in order
    pub fn runned_steps(&self) -> Vec<String> {
        self.string_list(keys::RUNNED_STEPS)
    }

    /// Description recorded for each started step
    pub fn runned_steps_info(&self) -> BTreeMap<String, String> {
        match self.record.get(keys::RUNNED_STEPS_INFO) {
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                .collect(),
            _ => BTreeMap::new(),
        }
    }

    /// Record that `step` began executing.
    ///
    /// Returns `false` when the step was already recorded; the list is left
    /// unchanged in that case but the step still becomes the last step.
    pub fn add_runned_step(&mut self, step: &str, description: &str) -> Result<bool> {
        self.last_step = Some(step.to_string());

        let mut runned = self.runned_steps();
        if runned.iter().any(|s| s == step) {
            return Ok(false);
        }
        if !self.declared_steps().iter().any(|s| s == step) {
            warn!(lock = %self.name(), step, "Recording a step that was never declared");
        }

        runned.push(step.to_string());
        let mut info = self.runned_steps_info();
        info.insert(step.to_string(), description.to_string());

        self.record.replace_or_set(keys::RUNNED_STEPS, &runned)?;
        self.record.replace_or_set(keys::RUNNED_STEPS_INFO, &info)?;
        Ok(true)
    }

    /// The step most recently passed to [`add_runned_step`](Self::add_runned_step)
    pub fn last_step(&self) -> Option<&str> {
        self.last_step.as_deref()
    }

    pub fn paused_steps(&self) -> BTreeSet<String> {
        self.string_list(keys::PAUSED_STEPS).into_iter().collect()
    }

    /// Add `step` to the paused steps and mark the lock paused
    pub fn pause_step(&mut self, step: &str) -> Result<()> {
        let mut paused = self.paused_steps();
        if paused.insert(step.to_string()) {
            self.record.replace_or_set(keys::PAUSED_STEPS, &paused)?;
        }
        self.set_status(LockStatus::Paused)
    }

    pub fn failure_step(&self) -> Option<&str> {
        self.record.get(keys::FAILURE_STEP).and_then(Value::as_str)
    }

    pub fn failure_message(&self) -> Option<&str> {
        self.record.get(keys::FAILURE_MESSAGE).and_then(Value::as_str)
    }

    /// Record a failure at `step` and mark the lock failed
    pub fn set_failure(&mut self, step: &str, message: &str) -> Result<()> {
        self.record.replace_or_set(keys::FAILURE_STEP, step)?;
        self.record.replace_or_set(keys::FAILURE_MESSAGE, message)?;
        self.set_status(LockStatus::Failed)
    }

    /// Instant before which a timed pause keeps the run paused
    pub fn target_datetime(&self) -> Result<Option<DateTime<Local>>> {
        match self.record.get(keys::TARGET_DATETIME) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(raw)) => DateTime::parse_from_rfc3339(raw)
                .map(|dt| Some(dt.with_timezone(&Local)))
                .map_err(|e| {
                    EngineError::corrupt(
                        self.path(),
                        format!("invalid target_datetime '{raw}': {e}"),
                    )
                }),
            Some(other) => Err(EngineError::corrupt(
                self.path(),
                format!("target_datetime is not a string: {other}"),
            )),
        }
    }

    /// Store `target` unless a target is already recorded; returns whichever
    /// target is in effect afterwards.
    pub fn set_target_datetime_if_absent(
        &mut self,
        target: DateTime<Local>,
    ) -> Result<DateTime<Local>> {
        if let Some(existing) = self.target_datetime()? {
            return Ok(existing);
        }
        self.record
            .replace_or_set(keys::TARGET_DATETIME, &target.to_rfc3339())?;
        Ok(target)
    }

    pub fn exec_id(&self) -> Option<u64> {
        self.record.get(keys::EXEC_ID).and_then(Value::as_u64)
    }

    /// Sort key that orders locks by when their run started.
    ///
    /// Batches are ordered by exec id. Within one batch every uid extends the
    /// batch uid (`<uid>`, `<uid>-2`, ..., `<uid>-10`), so a shorter uid is an
    /// earlier run; the name breaks the remaining ties.
    pub fn execution_order(&self) -> (Option<u64>, usize, &str) {
        (self.exec_id(), self.uid.len(), self.name())
    }

    pub fn data_file_name(&self) -> Option<&str> {
        self.record.get(keys::DATA_FILE_NAME).and_then(Value::as_str)
    }

    pub fn previous_run(&self) -> Option<&str> {
        self.record.get(keys::PREVIOUS_RUN).and_then(Value::as_str)
    }

    pub fn is_reported(&self) -> bool {
        self.record
            .get(keys::REPORTED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn mark_reported(&mut self) -> Result<()> {
        self.record.replace_or_set(keys::REPORTED, &true)
    }

    pub fn get_attribute(&self, key: &str) -> Option<&Value> {
        self.record.get(key)
    }

    pub fn has_attribute(&self, key: &str) -> bool {
        self.record.has(key)
    }

    pub fn set_attribute<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<()> {
        self.record.replace_or_set(key, value)
    }

    pub fn set_attribute_if_absent<T: Serialize + ?Sized>(
        &mut self,
        key: &str,
        value: &T,
    ) -> Result<()> {
        self.record.set_if_absent(key, value)
    }

    pub fn set_attribute_value(&mut self, key: &str, value: Value) -> Result<()> {
        self.record.insert_value(key, value)
    }

    /// Every attribute that is not step or lifecycle bookkeeping
    pub fn attributes(&self) -> BTreeMap<String, Value> {
        self.record
            .fields()
            .iter()
            .filter(|(key, _)| !keys::is_bookkeeping(key))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Open the lock `prior_name`, remember it as this run's previous run and
    /// return the attributes a replayed run should start from.
    ///
    /// Status, declared steps, target datetime and paused steps are never
    /// imported. The prior lock stays open and is reachable through
    /// [`prior_mut`](Self::prior_mut).
    pub fn import_from_prior_lock(&mut self, prior_name: &str) -> Result<Vec<(String, Value)>> {
        let prior = Self::open(&self.dir, prior_name)?;
        self.record.replace_or_set(keys::PREVIOUS_RUN, prior_name)?;

        let imported: Vec<(String, Value)> = prior
            .record
            .fields()
            .iter()
            .filter(|(key, _)| !keys::NOT_IMPORTED.contains(&key.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        debug!(
            lock = %self.name(),
            prior = prior_name,
            count = imported.len(),
            "Imported attributes from prior lock"
        );
        self.prior = Some(Box::new(prior));
        Ok(imported)
    }

    pub fn prior(&self) -> Option<&ExecutionLock> {
        self.prior.as_deref()
    }

    pub fn prior_mut(&mut self) -> Option<&mut ExecutionLock> {
        self.prior.as_deref_mut()
    }

    /// Re-read the lock file, discarding unsaved state
    pub fn reload(&mut self) -> Result<()> {
        self.record.load()?;
        self.last_step = self.runned_steps().pop();
        Ok(())
    }

    /// Delete the lock file and forget every attribute
    pub fn wipe(&mut self) -> Result<()> {
        self.last_step = None;
        self.record.wipe()
    }

    pub fn snapshot(&self) -> LockSnapshot {
        LockSnapshot {
            name: self.name().to_string(),
            uid: self.uid.clone(),
            case_name: self.case_name.clone(),
            status: self.status(),
            declared_steps: self.declared_steps(),
            runned_steps: self.runned_steps(),
            runned_steps_info: self.runned_steps_info(),
            paused_steps: self.paused_steps(),
            failure_step: self.failure_step().map(str::to_string),
            failure_message: self.failure_message().map(str::to_string),
            target_datetime: self
                .record
                .get(keys::TARGET_DATETIME)
                .and_then(Value::as_str)
                .map(str::to_string),
            attributes: self.attributes(),
        }
    }

    fn string_list(&self, key: &str) -> Vec<String> {
        match self.record.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Read-only view of a lock, handed to report sinks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockSnapshot {
    pub name: String,
    pub uid: String,
    pub case_name: String,
    pub status: Option<LockStatus>,
    pub declared_steps: Vec<String>,
    pub runned_steps: Vec<String>,
    pub runned_steps_info: BTreeMap<String, String>,
    pub paused_steps: BTreeSet<String>,
    pub failure_step: Option<String>,
    pub failure_message: Option<String>,
    pub target_datetime: Option<String>,
    pub attributes: BTreeMap<String, Value>,
}
