//! Twin-run verification against the loopback environment.

mod common;

use std::{
    fs,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use maildst::{
    action::from_fn, actions::default_actions, determinism::snapshot_dir, ActionOutcome,
    DeterminismOutcome,
};
use testresult::TestResult;

use common::{failing_on, local_config, simulation, succeeding};

/// Writes one artifact per step whose content is derived from the step RNG.
fn writer() -> Arc<dyn maildst::Action> {
    from_fn("WriteArtifact", 1.0, |ctx| {
        let dir = ctx.controller.artifact_dir().join("notes");
        fs::create_dir_all(&dir).map_err(|err| maildst::ActionError::other(err.to_string()))?;
        fs::write(
            dir.join(format!("{}.txt", ctx.step)),
            ctx.rng.gen_u64().to_le_bytes(),
        )
        .map_err(|err| maildst::ActionError::other(err.to_string()))?;
        Ok(ActionOutcome::Completed)
    })
}

#[test_log::test]
fn identical_twin_runs_pass() -> TestResult {
    let dir = tempfile::tempdir()?;
    let config = local_config(dir.path(), 4);
    let snapshot_root = config.environment.snapshot_root();
    let sim = simulation(
        vec![writer(), succeeding("Idle", 0.5, Duration::ZERO)],
        config,
    );

    let report = sim.run_with_determinism_check(42, 25)?;
    assert_eq!(report.outcome, DeterminismOutcome::Identical);
    assert!(report.passed());
    assert_eq!(report.snapshot, snapshot_dir(&snapshot_root, 42, 25));
    assert!(report.snapshot.join("notes").is_dir());
    Ok(())
}

#[test_log::test]
fn one_differing_byte_is_a_violation() -> TestResult {
    let dir = tempfile::tempdir()?;
    let runs = Arc::new(AtomicU64::new(0));
    let counter = runs.clone();
    // the last byte differs between the two runs
    let leaky = from_fn("Leaky", 1.0, move |ctx| {
        if ctx.step == 1 {
            let run = counter.fetch_add(1, Ordering::SeqCst) as u8;
            fs::write(ctx.controller.artifact_dir().join("leak.bin"), [0, 0, run])
                .map_err(|err| maildst::ActionError::other(err.to_string()))?;
        }
        Ok(ActionOutcome::Completed)
    });
    let sim = simulation(vec![leaky], local_config(dir.path(), 1));

    let report = sim.run_with_determinism_check(7, 3)?;
    assert!(report.is_violation());
    let DeterminismOutcome::Violation { artifacts, trace } = report.outcome else {
        unreachable!();
    };
    assert_eq!(artifacts.changed, vec![std::path::PathBuf::from("leak.bin")]);
    assert!(artifacts.only_in_first.is_empty());
    assert!(trace.is_none());
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test_log::test]
fn failed_first_run_skips_comparison() -> TestResult {
    let dir = tempfile::tempdir()?;
    let (action, calls) = failing_on("Broken", 1);
    let sim = simulation(vec![action], local_config(dir.path(), 1));
    let report = sim.run_with_determinism_check(1, 5)?;
    assert_eq!(report.outcome, DeterminismOutcome::RunFailed { run: 1 });
    assert!(report.second.is_none());
    assert!(!report.is_violation());
    // the second run never started
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test_log::test]
fn sequential_mail_pipeline_is_reproducible() -> TestResult {
    let dir = tempfile::tempdir()?;
    let config = local_config(dir.path(), 1);
    let sim = simulation(default_actions(&config), config);
    let report = sim.run_with_determinism_check(1234, 30)?;
    assert!(report.passed(), "{:?}", report.outcome);
    Ok(())
}
