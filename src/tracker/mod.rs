//! Step tracking
//!
//! [`StepTracker`] drives one run of a [`TestCase`]. For every registered
//! step, in order, it:
//!
//! 1. skips the step if a replay marked it as already completed,
//! 2. evaluates the step's pause gate, if any,
//! 3. records the step in the lock and runs its body.
//!
//! The lock status starts out optimistic (`success`), drops to `failed` on
//! the first failing step and to `paused` when a gate stops the run. At the
//! end of the run the case attributes are snapshotted into the lock.

mod state;
mod step;

pub use state::{CaseAttribute, CaseState, Collaborator, Data};
pub use step::{FnStep, ResumeHook, Step, StepBody, StepName, TestCase};

use crate::context::RunContext;
use crate::error::{EngineError, Result};
use crate::lock::{keys, ExecutionLock, LockStatus};
use crate::pause::{GateError, GateOutcome, PauseGate, PauseSignal};
use crate::resume::ReplayJob;
use crate::sinks::EvidenceContext;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Step name recorded when the resume hook fails
pub const RESUME_HOOK_STEP: &str = "on_resume";

/// How a tracker is started
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub data_file: Option<PathBuf>,
    pub replay: Option<ReplayJob>,
}

impl RunOptions {
    pub fn fresh() -> Self {
        Self::default()
    }

    /// Replay a paused run, reusing the job's data file
    pub fn replay(job: ReplayJob) -> Self {
        Self {
            data_file: job.data_file.clone(),
            replay: Some(job),
        }
    }

    pub fn with_data_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_file = Some(path.into());
        self
    }
}

/// A step that failed, with the error its body (or gate condition) returned
#[derive(Debug)]
pub struct StepFailure {
    pub step: String,
    /// Last line of the error chain, as stored in the lock
    pub message: String,
    pub error: anyhow::Error,
}

#[derive(Debug)]
pub enum RunOutcome {
    Success,
    Paused(PauseSignal),
    Failed(StepFailure),
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, Self::Paused(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// What happened to one step during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Executed,
    /// Completed in the prior run; its body was not called
    Skipped,
    Paused,
    Failed,
}

enum StepFlow {
    Continue,
    Stop(RunOutcome),
}

/// Runs the steps of a test case against an execution lock
pub struct StepTracker {
    ctx: Arc<RunContext>,
    case: TestCase,
    lock: ExecutionLock,
    state: CaseState,
    /// Step names in registration order, kept apart from `case.steps` which
    /// is taken out while the steps run
    declared: Vec<String>,
    data_file: Option<PathBuf>,
    ignore_steps: Vec<String>,
    resumed_from: Option<String>,
    current_step: Option<String>,
    recording: bool,
    video: Option<PathBuf>,
    trace: Vec<(String, StepResult)>,
}

impl StepTracker {
    /// Create the lock for this run and declare every step in it.
    ///
    /// With a replay job the prior lock's attributes are loaded into the case
    /// state. Without one, steps behind an unconditional pause are marked
    /// paused right away.
    pub fn new(ctx: Arc<RunContext>, case: TestCase, options: RunOptions) -> Result<Self> {
        case.validate()?;
        if let Some(job) = &options.replay {
            if job.case_name != case.name() {
                return Err(EngineError::invalid_step(format!(
                    "replay job for '{}' cannot drive case '{}'",
                    job.case_name,
                    case.name()
                )));
            }
        }

        let uid = ctx.lock_uid_for(case.name());
        let lock = ExecutionLock::create(ctx.lock_dir(), &uid, case.name())?;

        let declared = case.step_names();
        let mut tracker = Self {
            ctx,
            case,
            lock,
            state: CaseState::new(),
            declared,
            data_file: options.data_file,
            ignore_steps: Vec::new(),
            resumed_from: None,
            current_step: None,
            recording: false,
            video: None,
            trace: Vec::new(),
        };

        tracker.declare()?;
        match options.replay {
            Some(job) => tracker.import_prior(job)?,
            None => tracker.mark_unconditional_pauses()?,
        }
        Ok(tracker)
    }

    pub fn lock(&self) -> &ExecutionLock {
        &self.lock
    }

    pub fn state(&self) -> &CaseState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut CaseState {
        &mut self.state
    }

    pub fn case(&self) -> &TestCase {
        &self.case
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed_from.is_some()
    }

    pub fn resumed_from(&self) -> Option<&str> {
        self.resumed_from.as_deref()
    }

    pub fn ignore_steps(&self) -> &[String] {
        &self.ignore_steps
    }

    /// Step currently executing, or the last one that started
    pub fn current_step(&self) -> Option<&str> {
        self.current_step.as_deref()
    }

    /// Per-step results of the last [`run`](Self::run)
    pub fn trace(&self) -> &[(String, StepResult)] {
        &self.trace
    }

    pub fn into_lock(self) -> ExecutionLock {
        self.lock
    }

    /// Run every step in registration order.
    ///
    /// Step failures and pauses are reported through [`RunOutcome`]; an
    /// `Err` means the lock itself could not be read or written.
    pub async fn run(&mut self) -> Result<RunOutcome> {
        self.trace.clear();
        self.begin().await?;

        let mut outcome = RunOutcome::Success;
        if let Some(failure) = self.run_resume_hook().await? {
            outcome = RunOutcome::Failed(failure);
        }

        if outcome.is_success() {
            let steps = std::mem::take(&mut self.case.steps);
            let mut result = Ok(());
            for step in &steps {
                match self.run_step(step).await {
                    Ok(StepFlow::Continue) => {}
                    Ok(StepFlow::Stop(stopped)) => {
                        outcome = stopped;
                        break;
                    }
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }
            self.case.steps = steps;
            result?;
        }

        if outcome.is_success() && self.lock.status() == Some(LockStatus::Resumed) {
            self.lock.set_status(LockStatus::Success)?;
        }

        self.teardown().await?;
        info!(
            case = %self.case.name(),
            lock = %self.lock.name(),
            status = %self.lock.status().map_or("unset", |s| s.as_str()),
            "Test '{}' finished",
            self.case.name()
        );
        Ok(outcome)
    }

    async fn begin(&mut self) -> Result<()> {
        debug!(case = %self.case.name(), lock = %self.lock.name(), "Test '{}' started", self.case.name());
        if self.lock.status().is_none() {
            self.lock.set_status(LockStatus::Success)?;
        }
        if self.ctx.config().recording_enabled {
            self.start_recording().await?;
        }
        Ok(())
    }

    async fn run_resume_hook(&mut self) -> Result<Option<StepFailure>> {
        if !self.is_resumed() {
            return Ok(None);
        }
        let Some(hook) = &self.case.on_resume else {
            return Ok(None);
        };

        debug!(case = %self.case.name(), "Running resume hook");
        match hook(&mut self.state) {
            Ok(()) => Ok(None),
            Err(e) => Ok(Some(self.fail(RESUME_HOOK_STEP, e).await?)),
        }
    }

    async fn run_step(&mut self, step: &Step) -> Result<StepFlow> {
        let name = step.name.as_str();

        if self.ignore_steps.iter().any(|s| s == name) {
            info!(step = name, "Step skipped: {}", step.description);
            self.trace.push((name.to_string(), StepResult::Skipped));
            return Ok(StepFlow::Continue);
        }

        if let Some(gate) = &step.gate {
            if let Some(stop) = self.check_gate(name, gate).await? {
                return Ok(StepFlow::Stop(stop));
            }
        }

        self.current_step = Some(name.to_string());
        info!(step = name, "{}", step.name.label());
        self.lock.add_runned_step(name, &step.description)?;

        match step.body.execute(&mut self.state).await {
            Ok(()) => {
                self.trace.push((name.to_string(), StepResult::Executed));
                self.capture_evidence(name).await;
                Ok(StepFlow::Continue)
            }
            Err(e) => {
                let failure = self.fail(name, e).await?;
                Ok(StepFlow::Stop(RunOutcome::Failed(failure)))
            }
        }
    }

    /// Evaluate a step's gate. `Some` stops the run.
    async fn check_gate(&mut self, step: &str, gate: &PauseGate) -> Result<Option<RunOutcome>> {
        let resumed = self.is_resumed();
        let was_paused_here = self
            .lock
            .prior()
            .is_some_and(|prior| prior.paused_steps().contains(step));
        if resumed && was_paused_here {
            self.lock.set_status(LockStatus::Resumed)?;
        }

        // a replayed run consults the prior lock
        let now = self.ctx.now();
        let prior = if resumed { self.lock.prior_mut() } else { None };
        let evaluated = match prior {
            Some(prior) => gate.evaluate(step, prior, resumed, &self.state, now),
            None => gate.evaluate(step, &mut self.lock, resumed, &self.state, now),
        };

        match evaluated {
            Ok(GateOutcome::Pause(signal)) => {
                if resumed {
                    // the prior lock carries the pause; this run stays resumed
                    self.lock.set_status(LockStatus::Resumed)?;
                }
                self.trace.push((step.to_string(), StepResult::Paused));
                Ok(Some(RunOutcome::Paused(signal)))
            }
            Ok(GateOutcome::Proceed { wiped }) => {
                if wiped {
                    self.declare()?;
                    self.lock.set_status(LockStatus::Success)?;
                }
                if resumed && self.lock.status() == Some(LockStatus::Resumed) {
                    self.lock.set_status(LockStatus::Success)?;
                }
                Ok(None)
            }
            Err(GateError::Condition(e)) => {
                self.current_step = Some(step.to_string());
                let failure = self.fail(step, e).await?;
                Ok(Some(RunOutcome::Failed(failure)))
            }
            Err(GateError::Storage(e)) => Err(e),
        }
    }

    async fn fail(&mut self, step: &str, error: anyhow::Error) -> Result<StepFailure> {
        let message = failure_message(&error);
        error!(step, "Step failed: {}", message);
        self.lock.set_failure(step, &message)?;
        self.trace.push((step.to_string(), StepResult::Failed));
        self.stop_recording().await?;
        Ok(StepFailure {
            step: step.to_string(),
            message,
            error,
        })
    }

    /// Snapshot case attributes into the lock and stop any recording
    async fn teardown(&mut self) -> Result<()> {
        let mut written = 0;
        for (name, value) in self.state.snapshot() {
            if keys::is_engine_owned(&name) {
                continue;
            }
            let value = value.unwrap_or_else(|e| {
                warn!(attribute = %name, error = %e, "Attribute cannot be stored, writing null instead");
                serde_json::Value::Null
            });
            self.lock.set_attribute_value(&name, value)?;
            written += 1;
        }
        debug!(lock = %self.lock.name(), written, "Case attributes saved");

        self.stop_recording().await
    }

    fn declare(&mut self) -> Result<()> {
        for name in &self.declared {
            self.lock.add_declared_step(name)?;
        }
        self.lock.set_attribute(keys::EXEC_ID, &self.ctx.exec_id())?;
        match &self.video {
            Some(path) => self
                .lock
                .set_attribute(keys::TEST_VIDEO, &path.display().to_string())?,
            None => self.lock.set_attribute_if_absent(keys::TEST_VIDEO, "")?,
        }

        if let Some(description) = self.case.description() {
            self.lock.set_attribute(keys::TEST_DESCRIPTION, description)?;
        }
        if let Some(path) = &self.data_file {
            let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| path.clone());
            self.lock
                .set_attribute(keys::DATA_FILE_NAME, &absolute.display().to_string())?;
            debug!(case = %self.case.name(), "Data set: {}", absolute.display());
        }
        Ok(())
    }

    fn import_prior(&mut self, job: ReplayJob) -> Result<()> {
        for (key, value) in self.lock.import_from_prior_lock(&job.source_lock_name)? {
            self.state.set(key, value);
        }
        if let Some(prior) = self.lock.prior_mut() {
            prior.set_status(LockStatus::Resumed)?;
        }
        info!(
            case = %self.case.name(),
            prior = %job.source_lock_name,
            skipped = job.ignore_steps.len(),
            "Resuming test from {}",
            job.source_lock_name
        );
        self.ignore_steps = job.ignore_steps;
        self.resumed_from = Some(job.source_lock_name);
        Ok(())
    }

    fn mark_unconditional_pauses(&mut self) -> Result<()> {
        let paused: Vec<String> = self
            .case
            .steps
            .iter()
            .filter(|s| s.gate.as_ref().is_some_and(PauseGate::is_unconditional))
            .map(|s| s.name.as_str().to_string())
            .collect();
        for step in paused {
            self.lock.pause_step(&step)?;
        }
        Ok(())
    }

    fn evidence_context(&self, step: Option<&str>) -> EvidenceContext {
        EvidenceContext {
            batch_uid: self.ctx.batch_uid().to_string(),
            case_name: self.case.name().to_string(),
            lock_name: self.lock.name().to_string(),
            step: step.map(str::to_string),
        }
    }

    async fn capture_evidence(&self, step: &str) {
        let ctx = self.evidence_context(Some(step));
        if let Err(e) = self.ctx.evidence().capture_on_step(&ctx).await {
            warn!(step, "Evidence capture failed: {:#}", e);
        }
    }

    async fn start_recording(&mut self) -> Result<()> {
        let ctx = self.evidence_context(None);
        match self.ctx.evidence().start_recording(&ctx).await {
            Ok(path) => {
                self.recording = true;
                self.lock
                    .set_attribute(keys::TEST_VIDEO, &path.display().to_string())?;
                debug!("Evidence: recording started at {}", path.display());
                self.video = Some(path);
            }
            Err(e) => warn!("Evidence: recording could not start: {:#}", e),
        }
        Ok(())
    }

    async fn stop_recording(&mut self) -> Result<()> {
        if !self.recording {
            return Ok(());
        }
        self.recording = false;

        let ctx = self.evidence_context(self.current_step.as_deref());
        match self.ctx.evidence().stop_recording(&ctx).await {
            Ok(meta) => {
                debug!(
                    framerate = meta.framerate,
                    lost_frames = meta.lost_frames,
                    "Evidence: record saved in '{}'",
                    meta.path.display()
                );
            }
            Err(e) => warn!("Evidence: recording could not stop cleanly: {:#}", e),
        }
        Ok(())
    }
}

/// Last non-empty line of the full error chain
fn failure_message(error: &anyhow::Error) -> String {
    let full = format!("{error:#}");
    full.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
        .to_string()
}
