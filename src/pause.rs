//! Pause gates
//!
//! A gate is attached to a step and evaluated right before the step would
//! run. It either lets the step through or pauses the whole run, recording
//! the step in the lock's paused steps so a later discovery pass can replay
//! the case from where it stopped.
//!
//! On a fresh run a gate that lets the step through also wipes the lock:
//! the run then continues without a resumable record. On a replayed run the
//! gate consults the prior lock instead and never wipes anything.

use crate::error::EngineError;
use crate::lock::ExecutionLock;
use crate::tracker::CaseState;
use chrono::{DateTime, Duration, Local};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

pub type PauseCondition = Box<dyn Fn(&CaseState) -> anyhow::Result<bool> + Send + Sync>;

/// Raised when a gate pauses the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PauseSignal {
    pub step: String,
    pub message: String,
}

impl fmt::Display for PauseSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (at {})", self.message, self.step)
    }
}

/// What the tracker should do after evaluating a gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// Run the step. `wiped` is set when the gate deleted the lock file.
    Proceed { wiped: bool },
    Pause(PauseSignal),
}

#[derive(Debug, Error)]
pub enum GateError {
    /// The user condition failed; the error is passed through unchanged
    #[error(transparent)]
    Condition(anyhow::Error),

    #[error(transparent)]
    Storage(#[from] EngineError),
}

/// A pause policy attached to a step
pub enum PauseGate {
    /// Always pause
    Pause { reason: String },
    /// Pause while `condition` holds
    PauseIf {
        condition: PauseCondition,
        reason: String,
    },
    /// Pause until `offset` after the first evaluation
    PauseUntil { offset: Duration, reason: String },
}

impl fmt::Debug for PauseGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pause { reason } => f.debug_struct("Pause").field("reason", reason).finish(),
            Self::PauseIf { reason, .. } => f
                .debug_struct("PauseIf")
                .field("reason", reason)
                .finish_non_exhaustive(),
            Self::PauseUntil { offset, reason } => f
                .debug_struct("PauseUntil")
                .field("offset", offset)
                .field("reason", reason)
                .finish(),
        }
    }
}

impl PauseGate {
    pub fn pause(reason: impl Into<String>) -> Self {
        Self::Pause {
            reason: reason.into(),
        }
    }

    pub fn pause_if<F>(condition: F, reason: impl Into<String>) -> Self
    where
        F: Fn(&CaseState) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Self::PauseIf {
            condition: Box::new(condition),
            reason: reason.into(),
        }
    }

    pub fn pause_until(days: i64, hours: i64, minutes: i64, reason: impl Into<String>) -> Self {
        Self::PauseUntil {
            offset: Duration::days(days) + Duration::hours(hours) + Duration::minutes(minutes),
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Pause { reason } | Self::PauseIf { reason, .. } | Self::PauseUntil { reason, .. } => {
                reason
            }
        }
    }

    /// Whether the gate pauses regardless of state or time
    pub fn is_unconditional(&self) -> bool {
        matches!(self, Self::Pause { .. })
    }

    /// Evaluate the gate for `step` against `lock`.
    ///
    /// `lock` is the run's own lock on a fresh run and the prior lock on a
    /// replayed run (`resumed`). Condition errors come back as
    /// [`GateError::Condition`] with the original error intact.
    pub fn evaluate(
        &self,
        step: &str,
        lock: &mut ExecutionLock,
        resumed: bool,
        state: &CaseState,
        now: DateTime<Local>,
    ) -> Result<GateOutcome, GateError> {
        match self {
            Self::Pause { reason } => {
                let signal = pause(step, lock, format!("Paused: {reason}"))?;
                Ok(GateOutcome::Pause(signal))
            }
            Self::PauseIf { condition, reason } => {
                let should_pause = condition(state).map_err(GateError::Condition)?;
                if should_pause {
                    let signal = pause(step, lock, format!("Paused: {reason}"))?;
                    return Ok(GateOutcome::Pause(signal));
                }
                debug!(step, "Pause condition cleared");
                proceed(lock, resumed)
            }
            Self::PauseUntil { offset, reason } => {
                let target = match lock.target_datetime()? {
                    Some(target) => target,
                    None => lock.set_target_datetime_if_absent(now + *offset)?,
                };

                if now < target {
                    let mut message = format!("Paused until: {}", target.to_rfc3339());
                    if !reason.is_empty() {
                        message.push_str(&format!(" ({reason})"));
                    }
                    let signal = pause(step, lock, message)?;
                    return Ok(GateOutcome::Pause(signal));
                }
                debug!(step, target = %target.to_rfc3339(), "Pause timer elapsed");
                proceed(lock, resumed)
            }
        }
    }
}

fn pause(step: &str, lock: &mut ExecutionLock, message: String) -> Result<PauseSignal, EngineError> {
    lock.pause_step(step)?;
    info!(step, lock = %lock.name(), "{}", message);
    Ok(PauseSignal {
        step: step.to_string(),
        message,
    })
}

fn proceed(lock: &mut ExecutionLock, resumed: bool) -> Result<GateOutcome, GateError> {
    if resumed {
        return Ok(GateOutcome::Proceed { wiped: false });
    }
    lock.wipe()?;
    Ok(GateOutcome::Proceed { wiped: true })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockStatus;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn lock_in(dir: &TempDir) -> ExecutionLock {
        let mut lock = ExecutionLock::create(dir.path(), "uid", "Approval").unwrap();
        lock.add_declared_step("step_01_submit").unwrap();
        lock.add_declared_step("step_02_approve").unwrap();
        lock.add_runned_step("step_01_submit", "submit").unwrap();
        lock
    }

    fn at(hour: u32, minute: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 10, 16, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_unconditional_pause() {
        let temp_dir = TempDir::new().unwrap();
        let mut lock = lock_in(&temp_dir);
        let gate = PauseGate::pause("manual approval");

        let outcome = gate
            .evaluate("step_02_approve", &mut lock, false, &CaseState::new(), at(9, 0))
            .unwrap();

        match outcome {
            GateOutcome::Pause(signal) => {
                assert_eq!(signal.step, "step_02_approve");
                assert_eq!(signal.message, "Paused: manual approval");
            }
            other => panic!("expected pause, got {other:?}"),
        }
        assert_eq!(lock.status(), Some(LockStatus::Paused));
        assert!(lock.paused_steps().contains("step_02_approve"));
    }

    #[test]
    fn test_pause_if_false_on_fresh_run_wipes() {
        let temp_dir = TempDir::new().unwrap();
        let mut lock = lock_in(&temp_dir);
        let gate = PauseGate::pause_if(|_| Ok(false), "no token");

        let outcome = gate
            .evaluate("step_02_approve", &mut lock, false, &CaseState::new(), at(9, 0))
            .unwrap();

        assert_eq!(outcome, GateOutcome::Proceed { wiped: true });
        assert!(!lock.is_persisted());
    }

    #[test]
    fn test_pause_if_false_on_replay_keeps_lock() {
        let temp_dir = TempDir::new().unwrap();
        let mut lock = lock_in(&temp_dir);
        let gate = PauseGate::pause_if(|_| Ok(false), "no token");

        let outcome = gate
            .evaluate("step_02_approve", &mut lock, true, &CaseState::new(), at(9, 0))
            .unwrap();

        assert_eq!(outcome, GateOutcome::Proceed { wiped: false });
        assert!(lock.is_persisted());
    }

    #[test]
    fn test_pause_if_reads_case_state() {
        let temp_dir = TempDir::new().unwrap();
        let mut lock = lock_in(&temp_dir);
        let gate = PauseGate::pause_if(
            |state| Ok(state.get::<String>("token").is_none()),
            "waiting for token",
        );

        let mut state = CaseState::new();
        let outcome = gate
            .evaluate("step_02_approve", &mut lock, false, &state, at(9, 0))
            .unwrap();
        assert!(matches!(outcome, GateOutcome::Pause(_)));

        state.set("token", "t-1".to_string());
        let outcome = gate
            .evaluate("step_02_approve", &mut lock, false, &state, at(9, 5))
            .unwrap();
        assert_eq!(outcome, GateOutcome::Proceed { wiped: true });
        // the stale pause is gone with the file
        assert!(!lock.is_persisted());
        assert!(lock.paused_steps().is_empty());
    }

    #[test]
    fn test_pause_if_condition_error_passes_through() {
        let temp_dir = TempDir::new().unwrap();
        let mut lock = lock_in(&temp_dir);
        let gate = PauseGate::pause_if(|_| Err(anyhow::anyhow!("inbox unreachable")), "mail");

        let err = gate
            .evaluate("step_02_approve", &mut lock, false, &CaseState::new(), at(9, 0))
            .unwrap_err();

        match err {
            GateError::Condition(e) => assert_eq!(e.to_string(), "inbox unreachable"),
            other => panic!("expected condition error, got {other:?}"),
        }
        assert_eq!(lock.status(), None);
    }

    #[test]
    fn test_pause_until_sets_target_once() {
        let temp_dir = TempDir::new().unwrap();
        let mut lock = lock_in(&temp_dir);
        let gate = PauseGate::pause_until(0, 1, 30, "");

        let outcome = gate
            .evaluate("step_02_approve", &mut lock, false, &CaseState::new(), at(9, 0))
            .unwrap();
        assert!(matches!(outcome, GateOutcome::Pause(_)));
        assert_eq!(lock.target_datetime().unwrap(), Some(at(10, 30)));

        // re-evaluating later does not push the target out
        let outcome = gate
            .evaluate("step_02_approve", &mut lock, false, &CaseState::new(), at(10, 0))
            .unwrap();
        match outcome {
            GateOutcome::Pause(signal) => {
                assert_eq!(signal.message, format!("Paused until: {}", at(10, 30).to_rfc3339()));
            }
            other => panic!("expected pause, got {other:?}"),
        }
        assert_eq!(lock.target_datetime().unwrap(), Some(at(10, 30)));
    }

    #[test]
    fn test_pause_until_elapsed() {
        let temp_dir = TempDir::new().unwrap();
        let mut lock = lock_in(&temp_dir);
        lock.set_target_datetime_if_absent(at(8, 0)).unwrap();
        let gate = PauseGate::pause_until(1, 0, 0, "cool-off");

        let outcome = gate
            .evaluate("step_02_approve", &mut lock, true, &CaseState::new(), at(9, 0))
            .unwrap();
        assert_eq!(outcome, GateOutcome::Proceed { wiped: false });
        assert_eq!(lock.target_datetime().unwrap(), Some(at(8, 0)));
    }

    #[test]
    fn test_pause_until_on_replay_without_target_sets_one() {
        let temp_dir = TempDir::new().unwrap();
        let mut prior = lock_in(&temp_dir);
        let gate = PauseGate::pause_until(0, 0, 10, "cool-off");

        let outcome = gate
            .evaluate("step_02_approve", &mut prior, true, &CaseState::new(), at(9, 0))
            .unwrap();
        assert!(matches!(outcome, GateOutcome::Pause(_)));
        assert_eq!(prior.target_datetime().unwrap(), Some(at(9, 10)));
        assert_eq!(prior.status(), Some(LockStatus::Paused));
    }
}
