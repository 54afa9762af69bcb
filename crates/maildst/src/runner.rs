//! The run coordinator.
//!
//! One [`Simulation::run`] seeds the RNG, brings the environment up, runs the
//! scheduler and the validation worker side by side, waits for both to settle
//! and tears the environment down again, on every exit path.

use std::{
    collections::BTreeMap,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use serde::Serialize;

use crate::{
    action::ActionSet,
    clock::{self, ClockError, Timestamp},
    config::{ConfigError, SimulationConfig},
    controller::{Controller, ControllerError, Environment, StartContext},
    determinism::ArtifactError,
    generator::DataGenerator,
    progress::{ProgressObserver, TracingProgress},
    rng::SimulationRng,
    scheduler::{Schedule, Scheduler},
    state::{RunFailure, RunState, StopSignal},
    validation::{ValidationQueue, ValidationWorker},
};

#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("clock unavailable: {0}")]
    ClockUnavailable(#[from] ClockError),
    #[error("environment failed: {0}")]
    Environment(ControllerError),
    #[error("failed capturing artifacts: {0}")]
    Artifacts(#[from] ArtifactError),
    #[error("failed spawning {0} thread: {1}")]
    Spawn(&'static str, #[source] std::io::Error),
}

impl From<ControllerError> for SimulationError {
    fn from(err: ControllerError) -> Self {
        match err {
            ControllerError::Clock(err) => Self::ClockUnavailable(err),
            other => Self::Environment(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    Failed(RunFailure),
}

impl Verdict {
    pub fn passed(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub seed: u64,
    pub steps: u64,
    pub started: u64,
    pub completed: u64,
    pub validations_resolved: u64,
    pub verdict: Verdict,
    pub trace: Vec<String>,
    pub distribution: BTreeMap<String, u64>,
    pub initial_time: Timestamp,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.verdict.passed()
    }
}

pub struct Simulation {
    actions: ActionSet,
    environment: Arc<dyn Environment>,
    config: SimulationConfig,
    progress: Arc<dyn ProgressObserver>,
    interrupt: StopSignal,
}

impl Simulation {
    pub fn new(
        actions: ActionSet,
        environment: Arc<dyn Environment>,
        config: SimulationConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            actions,
            environment,
            config,
            progress: Arc::new(TracingProgress),
            interrupt: StopSignal::new(),
        })
    }

    pub fn with_progress(mut self, progress: impl ProgressObserver + 'static) -> Self {
        self.progress = Arc::new(progress);
        self
    }

    /// Stop signal raised from outside, e.g. by a Ctrl-C handler.
    pub fn with_interrupt(mut self, interrupt: StopSignal) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn actions(&self) -> &ActionSet {
        &self.actions
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub(crate) fn environment(&self) -> &dyn Environment {
        self.environment.as_ref()
    }

    /// Runs `steps` actions for `seed`. A failed action or validation is a
    /// `Failed` verdict in the report; clock, environment and configuration
    /// problems are errors.
    pub fn run(&self, seed: u64, steps: u64) -> Result<RunReport, SimulationError> {
        let wall_start = Instant::now();
        let rng = SimulationRng::new(seed);
        let clock_config = &self.config.clock;
        let initial_time = clock::random_start(&rng, clock_config.start_year, clock_config.end_year)
            .ok_or(ConfigError::ClockRange {
                start: clock_config.start_year,
                end: clock_config.end_year,
            })?;
        tracing::info!(
            seed,
            steps,
            %initial_time,
            actions = ?self.actions,
            "Initial simulation time"
        );
        self.progress.run_started(seed, steps);

        let controller = self.environment.start(&StartContext {
            seed,
            initial_time,
            rng: &rng,
        })?;
        let teardown = TeardownGuard::new(controller.as_ref());

        let generator = DataGenerator::new();
        generator.populate(&rng);
        let state = RunState::new(steps, self.interrupt.clone());
        let validations = ValidationQueue::new();

        let schedule = self.drive(&rng, &state, &validations, controller.as_ref(), &generator);

        let torn_down = teardown.finish();
        if let Some(err) = state.take_fatal() {
            return Err(err.into());
        }
        torn_down?;
        let schedule = schedule?;

        let verdict = match state.failure() {
            Some(failure) => Verdict::Failed(failure),
            None => Verdict::Passed,
        };
        let report = RunReport {
            seed,
            steps,
            started: state.started(),
            completed: state.completed(),
            validations_resolved: state.validations_resolved(),
            verdict,
            trace: schedule.trace,
            distribution: schedule.distribution,
            initial_time,
            elapsed: wall_start.elapsed(),
        };
        self.progress.run_finished(&report);
        Ok(report)
    }

    fn drive(
        &self,
        rng: &SimulationRng,
        state: &RunState,
        validations: &ValidationQueue,
        controller: &dyn Controller,
        generator: &DataGenerator,
    ) -> Result<Schedule, SimulationError> {
        let poll_interval = self.config.validation.poll_interval();
        thread::scope(|s| {
            let worker = ValidationWorker {
                queue: validations,
                state,
                controller,
                progress: self.progress.as_ref(),
                poll_interval,
            };
            let validation = thread::Builder::new()
                .name("validation".into())
                .spawn_scoped(s, move || worker.run())
                .map_err(|err| SimulationError::Spawn("validation", err))?;

            let scheduler = Scheduler {
                actions: &self.actions,
                pool_size: self.config.pool_size,
                pacing: self.config.pacing,
                rng,
                state,
                validations,
                controller,
                generator,
                progress: self.progress.as_ref(),
            };
            let scheduled = thread::Builder::new()
                .name("scheduler".into())
                .spawn_scoped(s, move || scheduler.run());
            let schedule = match scheduled {
                Ok(handle) => handle.join().unwrap_or_else(|_| {
                    state.fail_action(RunFailure::action("scheduler", 0, "scheduler panicked"));
                    Schedule::default()
                }),
                Err(err) => {
                    state.raise_stop();
                    return Err(SimulationError::Spawn("scheduler", err));
                }
            };
            state.mark_actions_drained();
            tracing::debug!(
                outstanding = validations.outstanding(),
                "Action phase drained"
            );

            if !state.has_action_failure() {
                while !validations.is_resolved() && !state.should_stop() {
                    thread::sleep(poll_interval);
                }
            }
            state.raise_stop();
            if validation.join().is_err() {
                state.fail_validation(RunFailure::validation(
                    "validation worker",
                    0,
                    "validation worker panicked",
                ));
            }
            Ok(schedule)
        })
    }
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("actions", &self.actions)
            .field("config", &self.config)
            .finish()
    }
}

/// Tears the controller down exactly once: explicitly through
/// [`TeardownGuard::finish`], or on drop while unwinding.
struct TeardownGuard<'a> {
    controller: &'a dyn Controller,
    done: bool,
}

impl<'a> TeardownGuard<'a> {
    fn new(controller: &'a dyn Controller) -> Self {
        Self {
            controller,
            done: false,
        }
    }

    fn finish(mut self) -> Result<(), ControllerError> {
        self.done = true;
        self.controller.teardown()
    }
}

impl Drop for TeardownGuard<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if let Err(err) = self.controller.teardown() {
            tracing::error!(%err, "Teardown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        action::{from_fn, ActionError, ActionOutcome, FnValidator},
        clock::{MemoryClockStore, VirtualClock},
        controller::{MailQueue, OutgoingMessage},
        progress::NoProgress,
        state::FailureKind,
    };
    use std::{
        path::{Path, PathBuf},
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    struct Counted {
        clock: VirtualClock,
        teardowns: Arc<AtomicU32>,
    }

    impl Controller for Counted {
        fn clock(&self) -> &VirtualClock {
            &self.clock
        }

        fn artifact_dir(&self) -> &Path {
            Path::new(".")
        }

        fn submit_message(&self, _: &OutgoingMessage) -> Result<(), ControllerError> {
            Ok(())
        }

        fn queue_depth(&self, _: MailQueue) -> Result<usize, ControllerError> {
            Ok(0)
        }

        fn teardown(&self) -> Result<(), ControllerError> {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountedEnvironment {
        teardowns: Arc<AtomicU32>,
    }

    impl Environment for CountedEnvironment {
        fn start(&self, ctx: &StartContext<'_>) -> Result<Box<dyn Controller>, ControllerError> {
            Ok(Box::new(Counted {
                clock: VirtualClock::new(MemoryClockStore::new(ctx.initial_time)),
                teardowns: self.teardowns.clone(),
            }))
        }

        fn artifact_dir(&self) -> PathBuf {
            PathBuf::from("unused")
        }

        fn snapshot_root(&self) -> PathBuf {
            PathBuf::from("unused-snapshots")
        }
    }

    fn fast_config() -> SimulationConfig {
        let mut config = SimulationConfig::default();
        config.pacing.min_delay_ms = 0;
        config.pacing.max_delay_ms = 1;
        config.validation.poll_interval_ms = 1;
        config
    }

    fn simulation(actions: ActionSet) -> (Simulation, Arc<AtomicU32>) {
        let env = CountedEnvironment::default();
        let teardowns = env.teardowns.clone();
        let sim = Simulation::new(actions, Arc::new(env), fast_config())
            .unwrap()
            .with_progress(NoProgress);
        (sim, teardowns)
    }

    fn noop() -> ActionSet {
        ActionSet::new(vec![from_fn("noop", 1.0, |_| Ok(ActionOutcome::Completed))]).unwrap()
    }

    #[test_log::test]
    fn passing_run_tears_down_once() {
        let actions = noop();
        let (sim, teardowns) = simulation(actions);
        let report = sim.run(42, 5).unwrap();
        assert!(report.passed());
        assert_eq!(report.completed, 5);
        assert_eq!(report.trace.len(), 5);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn failing_action_tears_down_once() {
        let actions = ActionSet::new(vec![from_fn("fails", 1.0, |ctx| {
            if ctx.step == 2 {
                return Err(ActionError::other("refused"));
            }
            Ok(ActionOutcome::Completed)
        })])
        .unwrap();
        let (sim, teardowns) = simulation(actions);
        let report = sim.run(8, 20).unwrap();
        match report.verdict {
            Verdict::Failed(failure) => assert_eq!(failure.kind, FailureKind::Action),
            Verdict::Passed => panic!("failing action must fail the run"),
        }
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn failing_validator_tears_down_once() {
        let actions = ActionSet::new(vec![from_fn("deferred", 1.0, |_| {
            Ok(ActionOutcome::deferred(FnValidator::new(
                "rejects",
                Duration::from_millis(10),
                |_| Ok(false),
            )))
        })])
        .unwrap();
        let (sim, teardowns) = simulation(actions);
        let report = sim.run(8, 4).unwrap();
        match report.verdict {
            Verdict::Failed(failure) => assert_eq!(failure.kind, FailureKind::Validation),
            Verdict::Passed => panic!("failing validator must fail the run"),
        }
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn clock_failure_is_an_error_after_teardown() {
        let actions = ActionSet::new(vec![from_fn("broken-clock", 1.0, |_| {
            Err(ClockError::Overflow.into())
        })])
        .unwrap();
        let (sim, teardowns) = simulation(actions);
        let err = sim.run(1, 3).unwrap_err();
        assert!(matches!(err, SimulationError::ClockUnavailable(_)));
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn interrupt_yields_interrupted_verdict() {
        let interrupt = StopSignal::new();
        interrupt.raise();
        let actions = noop();
        let (sim, teardowns) = simulation(actions);
        let report = sim.with_interrupt(interrupt).run(5, 100).unwrap();
        match report.verdict {
            Verdict::Failed(failure) => assert_eq!(failure.kind, FailureKind::Interrupted),
            Verdict::Passed => panic!("interrupted run must not pass"),
        }
        assert_eq!(report.started, 0);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn verdict_serializes_with_status_tag() -> testresult::TestResult {
        let passed = serde_json::to_value(Verdict::Passed)?;
        assert_eq!(passed, serde_json::json!({"status": "passed"}));
        let failure = RunFailure::action("SendEmail", 3, "x");
        let failed = serde_json::to_value(Verdict::Failed(failure))?;
        assert_eq!(failed["status"], "failed");
        assert_eq!(failed["kind"], "action");
        assert_eq!(failed["step"], 3);
        Ok(())
    }
}
