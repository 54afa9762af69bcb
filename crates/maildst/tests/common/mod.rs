//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::{
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use maildst::{
    action::{from_fn, FnValidator},
    controller::LocalEnvironment,
    progress::NoProgress,
    Action, ActionOutcome, ActionSet, Simulation, SimulationConfig,
};

/// Local, loopback configuration rooted at `dir` with no pacing delay.
pub fn local_config(dir: &Path, pool_size: usize) -> SimulationConfig {
    let mut config = SimulationConfig::local(dir);
    config.pool_size = pool_size;
    config.pacing.min_delay_ms = 0;
    config.pacing.max_delay_ms = 0;
    config.validation.poll_interval_ms = 1;
    config
}

pub fn simulation(actions: Vec<Arc<dyn Action>>, config: SimulationConfig) -> Simulation {
    let environment = Arc::new(LocalEnvironment::new(&config));
    let actions = ActionSet::new(actions).expect("valid action set");
    Simulation::new(actions, environment, config)
        .expect("valid configuration")
        .with_progress(NoProgress)
}

/// Always succeeds and defers a validator that always passes after `timeout`.
pub fn succeeding(name: &str, weight: f64, timeout: Duration) -> Arc<dyn Action> {
    from_fn(name, weight, move |_| {
        Ok(ActionOutcome::deferred(FnValidator::new(
            "AlwaysValid",
            timeout,
            |_| Ok(true),
        )))
    })
}

/// Fails on its `fail_on`-th invocation (1-based), succeeds otherwise.
pub fn failing_on(name: &str, fail_on: u64) -> (Arc<dyn Action>, Arc<AtomicU64>) {
    let calls = Arc::new(AtomicU64::new(0));
    let counter = calls.clone();
    let action = from_fn(name, 1.0, move |_| {
        let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if call == fail_on {
            Ok(ActionOutcome::failed(format!("refused on invocation {call}")))
        } else {
            Ok(ActionOutcome::Completed)
        }
    });
    (action, calls)
}
