//! Per-batch run context
//!
//! One [`RunContext`] exists per execution batch. It owns the batch uid and
//! exec id, hands out lock uids to the cases of the batch and carries the
//! collaborators (clock, evidence sink) every tracker needs.

use crate::config::EngineConfig;
use crate::error::Result;
use crate::history::ExecutionHistory;
use crate::sinks::{EvidenceSink, NoopEvidenceSink};
use crate::storage::LockDirectory;
use chrono::{DateTime, Duration, Local};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Local>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Local>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Local>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Local> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Shared state of one execution batch
pub struct RunContext {
    config: EngineConfig,
    batch_uid: String,
    exec_id: u64,
    directory: LockDirectory,
    evidence: Arc<dyn EvidenceSink>,
    clock: Arc<dyn Clock>,
    instances: Mutex<HashMap<String, usize>>,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("batch_uid", &self.batch_uid)
            .field("exec_id", &self.exec_id)
            .field("lock_dir", &self.directory.root())
            .finish_non_exhaustive()
    }
}

impl RunContext {
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Start a batch: validate the config, create the lock directory, derive
    /// the batch uid from the clock and pick the next exec id.
    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let directory = LockDirectory::new(config.lock_dir.clone());
        directory.ensure_exists()?;

        let exec_id = directory.next_exec_id()?;
        let batch_uid = clock.now().format(&config.timestamp_format).to_string();
        info!(batch = %batch_uid, exec_id, "Execution batch started");

        Ok(Self {
            config,
            batch_uid,
            exec_id,
            directory,
            evidence: Arc::new(NoopEvidenceSink),
            clock,
            instances: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_evidence_sink(mut self, sink: Arc<dyn EvidenceSink>) -> Self {
        self.evidence = sink;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn batch_uid(&self) -> &str {
        &self.batch_uid
    }

    pub fn exec_id(&self) -> u64 {
        self.exec_id
    }

    pub fn lock_dir(&self) -> &Path {
        self.directory.root()
    }

    pub fn directory(&self) -> &LockDirectory {
        &self.directory
    }

    pub fn evidence(&self) -> &Arc<dyn EvidenceSink> {
        &self.evidence
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> DateTime<Local> {
        self.clock.now()
    }

    /// Lock uid for the next run of `case_name` in this batch.
    ///
    /// The first run of a case uses the batch uid; later runs of the same
    /// case (for example one per data file) get `-2`, `-3` and so on.
    pub fn lock_uid_for(&self, case_name: &str) -> String {
        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        let count = instances.entry(case_name.to_string()).or_insert(0);
        *count += 1;
        match *count {
            1 => self.batch_uid.clone(),
            n => format!("{}-{n}", self.batch_uid),
        }
    }

    /// End the batch, wiping locks of this exec id that never got a status.
    ///
    /// Returns how many locks were removed.
    pub fn finish(self) -> Result<usize> {
        let history = ExecutionHistory::new(self.directory.clone());
        let removed = history.cleanup_unfinished(self.exec_id)?;
        info!(batch = %self.batch_uid, exec_id = self.exec_id, removed, "Execution batch finished");
        Ok(removed)
    }
}
