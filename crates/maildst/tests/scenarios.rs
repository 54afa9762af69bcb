//! End-to-end runs against the in-process loopback environment.

mod common;

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use maildst::{
    action::{from_fn, FnValidator},
    actions::default_actions,
    ActionOutcome, FailureKind, Verdict,
};
use testresult::TestResult;

use common::{failing_on, local_config, simulation, succeeding};

#[test_log::test]
fn single_action_seed_42_passes() -> TestResult {
    let dir = tempfile::tempdir()?;
    let sim = simulation(
        vec![succeeding("Succeed", 1.0, Duration::ZERO)],
        local_config(dir.path(), 4),
    );
    let report = sim.run(42, 5)?;
    assert!(report.passed(), "{:?}", report.verdict);
    assert_eq!(report.completed, 5);
    assert_eq!(report.validations_resolved, 5);
    assert_eq!(report.trace, vec!["Succeed"; 5]);
    // the clock store is gone after teardown
    assert!(!sim.config().clock_store().exists());
    Ok(())
}

#[test_log::test]
fn failing_third_invocation_fails_the_run() -> TestResult {
    let dir = tempfile::tempdir()?;
    let (action, calls) = failing_on("Flaky", 3);
    let sim = simulation(vec![action], local_config(dir.path(), 1));
    let report = sim.run(42, 5)?;

    let Verdict::Failed(failure) = &report.verdict else {
        panic!("expected failure, got {:?}", report.verdict);
    };
    assert_eq!(failure.kind, FailureKind::Action);
    assert_eq!(failure.name, "Flaky");
    assert!(failure.reason.contains("invocation 3"));
    assert!(report.completed <= 5);
    assert!(calls.load(Ordering::SeqCst) >= 3);
    Ok(())
}

#[test_log::test]
fn weighted_selection_over_1000_steps() -> TestResult {
    let dir = tempfile::tempdir()?;
    let sim = simulation(
        vec![
            from_fn("Heavy", 9.0, |_| Ok(ActionOutcome::Completed)),
            from_fn("Light", 1.0, |_| Ok(ActionOutcome::Completed)),
        ],
        local_config(dir.path(), 4),
    );
    let report = sim.run(7, 1_000)?;
    assert!(report.passed());
    let heavy = report.distribution.get("Heavy").copied().unwrap_or_default();
    let light = report.distribution.get("Light").copied().unwrap_or_default();
    assert_eq!(heavy + light, 1_000);
    // binomial sd is ~9.5, allow five of them
    assert!((852..=948).contains(&heavy), "heavy selected {heavy} times");
    Ok(())
}

#[test_log::test]
fn no_submissions_after_failure() -> TestResult {
    let dir = tempfile::tempdir()?;
    let mut config = local_config(dir.path(), 1);
    config.pacing.min_delay_ms = 2;
    config.pacing.max_delay_ms = 2;
    let (action, calls) = failing_on("FailsFirst", 1);
    let sim = simulation(vec![action], config);
    let report = sim.run(1, 500)?;

    assert!(!report.passed());
    assert!(report.trace.len() < 500);
    // skipped submissions never reach the action
    assert!(calls.load(Ordering::SeqCst) <= report.trace.len() as u64);
    assert_eq!(report.started, calls.load(Ordering::SeqCst));
    Ok(())
}

#[test_log::test]
fn identical_seeds_select_identical_sequences() -> TestResult {
    let dir = tempfile::tempdir()?;
    let actions = || {
        vec![
            succeeding("A", 1.0, Duration::ZERO),
            succeeding("B", 0.3, Duration::from_millis(5)),
            from_fn("C", 0.7, |_| Ok(ActionOutcome::Completed)),
        ]
    };
    let first = simulation(actions(), local_config(dir.path(), 8)).run(99, 300)?;
    let second = simulation(actions(), local_config(dir.path(), 8)).run(99, 300)?;
    assert_eq!(first.trace.len(), 300);
    assert_eq!(first.trace, second.trace);
    assert_eq!(first.distribution, second.distribution);
    assert_eq!(first.initial_time, second.initial_time);
    Ok(())
}

#[test_log::test]
fn validators_wait_for_simulated_time() -> TestResult {
    let dir = tempfile::tempdir()?;
    let early = Arc::new(AtomicU64::new(0));
    let seen = early.clone();
    let action = from_fn("Defer", 1.0, move |ctx| {
        let produced_at = ctx.controller.get_time()?;
        let seen = seen.clone();
        Ok(ActionOutcome::deferred(FnValidator::new(
            "ElapsedCheck",
            Duration::from_secs(5),
            move |controller| {
                let now = controller.get_time()?;
                if now - produced_at < chrono::TimeDelta::seconds(5) {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
                Ok(true)
            },
        )))
    });
    let sim = simulation(vec![action], local_config(dir.path(), 2));
    let report = sim.run(5, 10)?;
    assert!(report.passed());
    // every validator resolved through the drain fast-forward
    assert_eq!(report.validations_resolved, 10);
    assert_eq!(early.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test_log::test]
fn failing_validator_fails_the_run() -> TestResult {
    let dir = tempfile::tempdir()?;
    let action = from_fn("Send", 1.0, |_| {
        Ok(ActionOutcome::deferred(FnValidator::new(
            "NeverDelivered",
            Duration::from_millis(100),
            |_| Ok(false),
        )))
    });
    let report = simulation(vec![action], local_config(dir.path(), 2)).run(3, 3)?;
    let Verdict::Failed(failure) = report.verdict else {
        panic!("validator failure must fail the run");
    };
    assert_eq!(failure.kind, FailureKind::Validation);
    assert_eq!(failure.name, "NeverDelivered");
    Ok(())
}

#[test_log::test]
fn mail_pipeline_delivers_locally() -> TestResult {
    let dir = tempfile::tempdir()?;
    let config = local_config(dir.path(), 1);
    let sim = simulation(default_actions(&config), config);
    let report = sim.run(2024, 40)?;
    assert!(report.passed(), "{:?}", report.verdict);
    assert_eq!(report.completed, 40);

    let sent = report.distribution.get("SendEmail").copied().unwrap_or_default();
    let delivered = walk(&sim.config().environment.artifact_dir());
    assert_eq!(delivered, sent as usize);
    assert_eq!(report.validations_resolved, sent);
    Ok(())
}

fn walk(dir: &std::path::Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                walk(&path)
            } else {
                1
            }
        })
        .sum()
}
