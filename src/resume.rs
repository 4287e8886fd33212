//! Discovery of paused runs and construction of replay jobs
//!
//! A paused lock can be replayed once its pause condition may have cleared.
//! The replay re-declares every step but skips all started steps except the
//! last one, which is re-executed because it may not have completed.

use crate::context::{Clock, RunContext};
use crate::error::Result;
use crate::lock::{ExecutionLock, LockStatus};
use crate::storage::LockDirectory;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Everything a tracker needs to replay a paused run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayJob {
    pub case_name: String,
    /// Every step of the case, in order
    pub step_methods: Vec<String>,
    /// Steps that completed in the source run and are not run again
    pub ignore_steps: Vec<String>,
    pub source_lock_name: String,
    pub data_file: Option<PathBuf>,
    pub exec_id: u64,
}

/// Why a lock is not replayed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResumeIneligible {
    #[error("lock status is {}", status_label(.0))]
    NotPaused(Option<LockStatus>),

    #[error("no step ever started")]
    NothingToResume,

    #[error("pause timer runs until {0}")]
    TimerPending(DateTime<Local>),
}

fn status_label(status: &Option<LockStatus>) -> &'static str {
    status.map_or("unset", |s| s.as_str())
}

/// Decide whether a lock with the given state may be replayed at `now`.
///
/// The status is checked before the step list so that only paused locks are
/// ever reported as having nothing to resume.
pub fn check_eligibility(
    status: Option<LockStatus>,
    runned_steps: &[String],
    target: Option<DateTime<Local>>,
    now: DateTime<Local>,
) -> std::result::Result<(), ResumeIneligible> {
    if status != Some(LockStatus::Paused) {
        return Err(ResumeIneligible::NotPaused(status));
    }
    if runned_steps.is_empty() {
        return Err(ResumeIneligible::NothingToResume);
    }
    if let Some(target) = target {
        if now < target {
            return Err(ResumeIneligible::TimerPending(target));
        }
    }
    Ok(())
}

/// Steps a replay skips: every started step but the last
pub fn ignore_steps_for(runned_steps: &[String]) -> Vec<String> {
    match runned_steps.split_last() {
        Some((_, completed)) => completed.to_vec(),
        None => Vec::new(),
    }
}

/// Pick the data file a replay should use.
///
/// With no candidates the recorded file (if any) is reused. Otherwise the
/// first candidate contained in the recorded file name wins, and a lock with
/// no match is not replayed (`None`).
pub fn match_data_file(recorded: Option<&str>, candidates: &[PathBuf]) -> Option<Option<PathBuf>> {
    if candidates.is_empty() {
        return Some(recorded.map(PathBuf::from));
    }
    let recorded = recorded?;
    candidates
        .iter()
        .find(|candidate| recorded.contains(candidate.to_string_lossy().as_ref()))
        .map(|candidate| Some(candidate.clone()))
}

/// Finds replayable locks and turns them into [`ReplayJob`]s
pub struct ResumeLoader {
    directory: LockDirectory,
    exec_id: u64,
    clock: Arc<dyn Clock>,
}

impl ResumeLoader {
    pub fn new(directory: LockDirectory, exec_id: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            directory,
            exec_id,
            clock,
        }
    }

    pub fn from_context(ctx: &RunContext) -> Self {
        Self::new(ctx.directory().clone(), ctx.exec_id(), Arc::clone(ctx.clock()))
    }

    pub fn lock_dir(&self) -> &Path {
        self.directory.root()
    }

    /// Every readable lock of `case_name`, oldest first
    pub fn find_candidate_locks(&self, case_name: &str) -> Result<Vec<ExecutionLock>> {
        let mut locks = Vec::new();
        for entry in self.directory.list_for_case(case_name)? {
            match ExecutionLock::open_entry(&self.directory, &entry) {
                Ok(lock) => locks.push(lock),
                Err(e) => warn!("Skipping unreadable lock {}: {}", entry.name, e),
            }
        }
        locks.sort_by(|a, b| a.execution_order().cmp(&b.execution_order()));
        Ok(locks)
    }

    /// Build one replay job per eligible paused lock of `case_name`.
    ///
    /// Paused locks that never started a step are wiped on the way. A lock
    /// whose target datetime cannot be read is skipped.
    pub fn build_replay_jobs(
        &self,
        case_name: &str,
        step_methods: &[String],
        data_files: &[PathBuf],
    ) -> Result<Vec<ReplayJob>> {
        let now = self.clock.now();
        let mut jobs = Vec::new();

        for mut lock in self.find_candidate_locks(case_name)? {
            let target = match lock.target_datetime() {
                Ok(target) => target,
                Err(e) => {
                    warn!(lock = %lock.name(), "Skipping lock with unreadable target: {}", e);
                    continue;
                }
            };

            let runned_steps = lock.runned_steps();
            match check_eligibility(lock.status(), &runned_steps, target, now) {
                Ok(()) => {}
                Err(ResumeIneligible::NothingToResume) => {
                    info!(lock = %lock.name(), "Removing paused lock with no started steps");
                    lock.wipe()?;
                    continue;
                }
                Err(reason) => {
                    debug!(lock = %lock.name(), %reason, "Lock not eligible for replay");
                    continue;
                }
            }

            let Some(data_file) = match_data_file(lock.data_file_name(), data_files) else {
                debug!(lock = %lock.name(), "No matching data file, not replaying");
                continue;
            };

            let job = ReplayJob {
                case_name: case_name.to_string(),
                step_methods: step_methods.to_vec(),
                ignore_steps: ignore_steps_for(&runned_steps),
                source_lock_name: lock.name().to_string(),
                data_file,
                exec_id: self.exec_id,
            };
            info!(
                lock = %job.source_lock_name,
                skipped = job.ignore_steps.len(),
                "Replay job created"
            );
            jobs.push(job);
        }

        Ok(jobs)
    }

    /// Mark the job's source lock as resumed so no other discovery pass picks
    /// it up again.
    ///
    /// [`StepTracker`](crate::tracker::StepTracker) claims the source lock
    /// itself when it imports it; this is for jobs queued to run later.
    pub fn claim(&self, job: &ReplayJob) -> Result<()> {
        let mut source = ExecutionLock::open(self.directory.root(), &job.source_lock_name)?;
        source.set_status(LockStatus::Resumed)?;
        debug!(lock = %job.source_lock_name, "Replay job claimed");
        Ok(())
    }
}
