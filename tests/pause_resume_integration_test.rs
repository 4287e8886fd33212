//! Integration tests for pausing a run and replaying it in a later batch
//!
//! These tests verify that:
//! 1. A paused run leaves a lock that a later batch discovers
//! 2. The replay skips completed steps and retries the last attempted one
//! 3. Gates on a replay consult the prior lock
//! 4. Case attributes survive from the paused run into the replay

use anyhow::Result;
use chrono::{DateTime, Duration, Local, TimeZone};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use steplock::tracker::StepResult;
use steplock::{
    EngineConfig, ExecutionHistory, ExecutionLock, FixedClock, LockStatus, PauseGate,
    ResumeLoader, RunContext, RunOptions, RunOutcome, Step, StepTracker, TestCase,
};
use tempfile::TempDir;

const STEPS: [&str; 4] = [
    "step_01_open_app",
    "step_02_login",
    "step_03_approve",
    "step_04_logout",
];

fn start() -> DateTime<Local> {
    Local.with_ymd_and_hms(2026, 10, 16, 10, 0, 0).unwrap()
}

fn batch(dir: &TempDir, at: DateTime<Local>) -> Result<(Arc<RunContext>, Arc<FixedClock>)> {
    let clock = Arc::new(FixedClock::new(at));
    let config = EngineConfig::default().with_lock_dir(dir.path().join("locks"));
    let ctx = RunContext::with_clock(config, clock.clone())?;
    Ok((Arc::new(ctx), clock))
}

struct Counters {
    calls: Vec<Arc<AtomicUsize>>,
}

impl Counters {
    fn new() -> Self {
        Self {
            calls: STEPS.iter().map(|_| Arc::new(AtomicUsize::new(0))).collect(),
        }
    }

    fn get(&self, index: usize) -> usize {
        self.calls[index].load(Ordering::SeqCst)
    }
}

/// Four-step login flow; step 3 pauses while `token_missing` is set
fn login_flow(token_missing: &Arc<AtomicBool>, counters: &Counters) -> TestCase {
    let mut case = TestCase::new("LoginFlow");
    for (index, name) in STEPS.iter().enumerate() {
        let counter = Arc::clone(&counters.calls[index]);
        let mut step = Step::from_fn(name, move |state| {
            counter.fetch_add(1, Ordering::SeqCst);
            if index == 1 {
                state.set("username", "qa-user".to_string());
            }
            Ok(())
        });
        if index == 2 {
            let flag = Arc::clone(token_missing);
            step = step.gate(PauseGate::pause_if(
                move |_| Ok(flag.load(Ordering::SeqCst)),
                "waiting for approval token",
            ));
        }
        case = case.with_step(step);
    }
    case
}

fn step_names() -> Vec<String> {
    STEPS.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_pause_then_resume_completes_run() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let token_missing = Arc::new(AtomicBool::new(true));

    // Run 1: pauses at step 3
    let first_counters = Counters::new();
    let (ctx, _) = batch(&temp_dir, start())?;
    let mut tracker = StepTracker::new(
        ctx,
        login_flow(&token_missing, &first_counters),
        RunOptions::fresh(),
    )?;
    let outcome = tracker.run().await?;

    assert!(outcome.is_paused());
    assert_eq!(first_counters.get(2), 0);
    let first_lock = tracker.into_lock();
    assert_eq!(first_lock.status(), Some(LockStatus::Paused));
    assert_eq!(first_lock.runned_steps(), vec![STEPS[0], STEPS[1]]);
    assert!(first_lock.paused_steps().contains(STEPS[2]));
    assert_eq!(
        first_lock.get_attribute("username"),
        Some(&serde_json::json!("qa-user"))
    );

    // Run 2: the token has arrived
    token_missing.store(false, Ordering::SeqCst);
    let second_counters = Counters::new();
    let (ctx, _) = batch(&temp_dir, start() + Duration::minutes(5))?;
    assert_eq!(ctx.exec_id(), 1);

    let loader = ResumeLoader::from_context(&ctx);
    let jobs = loader.build_replay_jobs("LoginFlow", &step_names(), &[])?;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].source_lock_name, first_lock.name());
    assert_eq!(jobs[0].ignore_steps, vec![STEPS[0]]);
    loader.claim(&jobs[0])?;

    let mut tracker = StepTracker::new(
        ctx,
        login_flow(&token_missing, &second_counters),
        RunOptions::replay(jobs[0].clone()),
    )?;
    assert_eq!(
        tracker.state().get_as::<String>("username").as_deref(),
        Some("qa-user")
    );
    let outcome = tracker.run().await?;

    assert!(outcome.is_success());
    assert_eq!(second_counters.get(0), 0);
    assert_eq!(second_counters.get(1), 1);
    assert_eq!(second_counters.get(2), 1);
    assert_eq!(second_counters.get(3), 1);
    assert_eq!(
        tracker.trace(),
        &[
            (STEPS[0].to_string(), StepResult::Skipped),
            (STEPS[1].to_string(), StepResult::Executed),
            (STEPS[2].to_string(), StepResult::Executed),
            (STEPS[3].to_string(), StepResult::Executed),
        ]
    );

    let second_lock = tracker.into_lock();
    assert_eq!(second_lock.status(), Some(LockStatus::Success));
    assert_eq!(second_lock.runned_steps(), vec![STEPS[1], STEPS[2], STEPS[3]]);
    assert_eq!(second_lock.previous_run(), Some(first_lock.name()));
    assert_eq!(second_lock.exec_id(), Some(1));

    // the source lock stays claimed and nothing is left to replay
    let source = ExecutionLock::open(first_lock.dir(), first_lock.name())?;
    assert_eq!(source.status(), Some(LockStatus::Resumed));
    assert!(loader
        .build_replay_jobs("LoginFlow", &step_names(), &[])?
        .is_empty());
    Ok(())
}

#[tokio::test]
async fn test_replay_that_pauses_again_keeps_prior_lock_resumable() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let token_missing = Arc::new(AtomicBool::new(true));
    let counters = Counters::new();

    let (ctx, _) = batch(&temp_dir, start())?;
    let mut tracker = StepTracker::new(
        ctx,
        login_flow(&token_missing, &counters),
        RunOptions::fresh(),
    )?;
    assert!(tracker.run().await?.is_paused());
    let first_name = tracker.lock().name().to_string();

    let (ctx, _) = batch(&temp_dir, start() + Duration::minutes(5))?;
    let loader = ResumeLoader::from_context(&ctx);
    let job = loader
        .build_replay_jobs("LoginFlow", &step_names(), &[])?
        .remove(0);
    loader.claim(&job)?;

    let mut tracker = StepTracker::new(
        ctx,
        login_flow(&token_missing, &counters),
        RunOptions::replay(job),
    )?;
    match tracker.run().await? {
        RunOutcome::Paused(signal) => assert_eq!(signal.step, STEPS[2]),
        other => panic!("expected pause, got {other:?}"),
    }
    assert_eq!(tracker.lock().status(), Some(LockStatus::Resumed));
    assert_eq!(
        tracker.lock().prior().and_then(|p| p.status()),
        Some(LockStatus::Paused)
    );

    // a third batch finds the original lock again, not the replay's lock
    let (ctx, _) = batch(&temp_dir, start() + Duration::minutes(10))?;
    let jobs = ResumeLoader::from_context(&ctx).build_replay_jobs("LoginFlow", &step_names(), &[])?;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].source_lock_name, first_name);
    Ok(())
}

#[tokio::test]
async fn test_timed_pause_waits_for_target() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let released = Arc::new(AtomicUsize::new(0));

    let timed_case = |released: &Arc<AtomicUsize>| {
        let released = Arc::clone(released);
        TestCase::new("Settlement")
            .with_step(Step::from_fn("step_01_submit", |_| Ok(())))
            .with_step(
                Step::from_fn("step_02_settle", move |_| {
                    released.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .gate(PauseGate::pause_until(0, 0, 30, "bank cut-off")),
            )
    };

    let (ctx, _) = batch(&temp_dir, start())?;
    let mut tracker = StepTracker::new(ctx, timed_case(&released), RunOptions::fresh())?;
    assert!(tracker.run().await?.is_paused());
    assert_eq!(
        tracker.lock().target_datetime()?,
        Some(start() + Duration::minutes(30))
    );

    let steps = vec!["step_01_submit".to_string(), "step_02_settle".to_string()];

    // too early: the lock is left alone
    let (ctx, _) = batch(&temp_dir, start() + Duration::minutes(10))?;
    assert!(ResumeLoader::from_context(&ctx)
        .build_replay_jobs("Settlement", &steps, &[])?
        .is_empty());

    let (ctx, _) = batch(&temp_dir, start() + Duration::minutes(31))?;
    let loader = ResumeLoader::from_context(&ctx);
    let job = loader.build_replay_jobs("Settlement", &steps, &[])?.remove(0);
    assert!(job.ignore_steps.is_empty());
    loader.claim(&job)?;

    let mut tracker = StepTracker::new(ctx, timed_case(&released), RunOptions::replay(job))?;
    assert!(tracker.run().await?.is_success());
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert_eq!(tracker.lock().status(), Some(LockStatus::Success));
    // the timer lives on the prior lock only
    assert_eq!(tracker.lock().target_datetime()?, None);
    Ok(())
}

#[tokio::test]
async fn test_resume_hook_runs_only_on_replay() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let token_missing = Arc::new(AtomicBool::new(true));
    let hook_calls = Arc::new(AtomicUsize::new(0));

    let with_hook = |counters: &Counters| {
        let calls = Arc::clone(&hook_calls);
        login_flow(&token_missing, counters).on_resume(move |state| {
            calls.fetch_add(1, Ordering::SeqCst);
            anyhow::ensure!(state.contains("username"), "username not imported");
            Ok(())
        })
    };

    let (ctx, _) = batch(&temp_dir, start())?;
    let mut tracker = StepTracker::new(ctx, with_hook(&Counters::new()), RunOptions::fresh())?;
    tracker.run().await?;
    assert_eq!(hook_calls.load(Ordering::SeqCst), 0);

    token_missing.store(false, Ordering::SeqCst);
    let (ctx, _) = batch(&temp_dir, start() + Duration::minutes(1))?;
    let loader = ResumeLoader::from_context(&ctx);
    let job = loader
        .build_replay_jobs("LoginFlow", &step_names(), &[])?
        .remove(0);
    let mut tracker = StepTracker::new(ctx, with_hook(&Counters::new()), RunOptions::replay(job))?;
    assert!(tracker.run().await?.is_success());
    assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_batch_finish_removes_unstarted_locks() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let token_missing = Arc::new(AtomicBool::new(false));

    let (ctx, _) = batch(&temp_dir, start())?;
    let mut finished = StepTracker::new(
        Arc::clone(&ctx),
        login_flow(&token_missing, &Counters::new()),
        RunOptions::fresh(),
    )?;
    assert!(finished.run().await?.is_success());

    let never_run = StepTracker::new(
        Arc::clone(&ctx),
        login_flow(&token_missing, &Counters::new()),
        RunOptions::fresh(),
    )?;
    let orphan_path = never_run.lock().path().to_path_buf();
    assert!(orphan_path.exists());
    drop(never_run);
    drop(finished);

    let ctx = Arc::try_unwrap(ctx).expect("no other context handles");
    assert_eq!(ctx.finish()?, 1);
    assert!(!orphan_path.exists());

    let history = ExecutionHistory::new(steplock::LockDirectory::new(temp_dir.path().join("locks")));
    let latest = history.latest_successful("LoginFlow")?.expect("successful run");
    assert_eq!(latest.status(), Some(LockStatus::Success));
    Ok(())
}

#[tokio::test]
async fn test_replay_claims_its_source_lock() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let token_missing = Arc::new(AtomicBool::new(true));

    let (ctx, _) = batch(&temp_dir, start())?;
    let mut tracker = StepTracker::new(
        ctx,
        login_flow(&token_missing, &Counters::new()),
        RunOptions::fresh(),
    )?;
    assert!(tracker.run().await?.is_paused());
    let source_name = tracker.lock().name().to_string();

    // replay straight from discovery, without a separate claim
    token_missing.store(false, Ordering::SeqCst);
    let (ctx, _) = batch(&temp_dir, start() + Duration::minutes(5))?;
    let job = ResumeLoader::from_context(&ctx)
        .build_replay_jobs("LoginFlow", &step_names(), &[])?
        .remove(0);
    let mut replay = StepTracker::new(
        ctx,
        login_flow(&token_missing, &Counters::new()),
        RunOptions::replay(job),
    )?;
    assert!(replay.run().await?.is_success());

    let (ctx, _) = batch(&temp_dir, start() + Duration::minutes(10))?;
    assert!(ResumeLoader::from_context(&ctx)
        .build_replay_jobs("LoginFlow", &step_names(), &[])?
        .is_empty());
    let source = ExecutionLock::open(&temp_dir.path().join("locks"), &source_name)?;
    assert_eq!(source.status(), Some(LockStatus::Resumed));
    Ok(())
}
