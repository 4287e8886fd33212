//! steplock: resumable step execution for long automated test cases
//!
//! A test case is an ordered list of steps. Every run of a case keeps an
//! execution lock on disk recording which steps started, whether the run
//! failed, and where it paused. A step guarded by a [`PauseGate`] can stop
//! the run early; a later batch uses the [`ResumeLoader`] to find the paused
//! lock and replays the case, skipping the steps that already completed.
//!
//! ```no_run
//! use std::sync::Arc;
//! use steplock::{EngineConfig, PauseGate, RunContext, RunOptions, Step, StepTracker, TestCase};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let ctx = Arc::new(RunContext::new(EngineConfig::load_global()?)?);
//! let case = TestCase::new("Onboarding")
//!     .with_step(Step::from_fn("step_01_create_user", |state| {
//!         state.set("user", "ada".to_string());
//!         Ok(())
//!     }))
//!     .with_step(
//!         Step::from_fn("step_02_confirm_email", |_| Ok(()))
//!             .gate(PauseGate::pause_until(0, 2, 0, "wait for the mail")),
//!     );
//!
//! let mut tracker = StepTracker::new(ctx, case, RunOptions::fresh())?;
//! let outcome = tracker.run().await?;
//! println!("paused: {}", outcome.is_paused());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod history;
pub mod lock;
pub mod logging;
pub mod pause;
pub mod resume;
pub mod sinks;
pub mod storage;
pub mod tracker;

pub use config::EngineConfig;
pub use context::{Clock, FixedClock, RunContext, SystemClock};
pub use error::{EngineError, Result};
pub use history::{ExecutionHistory, ReportRow};
pub use lock::{ExecutionLock, LockSnapshot, LockStatus};
pub use pause::{GateOutcome, PauseGate, PauseSignal};
pub use resume::{ReplayJob, ResumeLoader};
pub use sinks::{CsvReportSink, EvidenceContext, EvidenceSink, NoopEvidenceSink, ReportSink};
pub use storage::{LockDirectory, PersistentRecord};
pub use tracker::{
    CaseState, RunOptions, RunOutcome, Step, StepFailure, StepResult, StepTracker, TestCase,
};
