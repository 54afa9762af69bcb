//! Weighted action scheduler.
//!
//! The scheduler thread picks an action and a pacing delay from the run RNG
//! for every step, in submission order, and hands the step to a fixed pool
//! of worker threads. It does not wait for a step to complete before
//! submitting the next one; it only stops submitting once `steps` have been
//! submitted or the run is asked to stop, then waits for the pool to drain.

use std::{
    collections::BTreeMap,
    panic::{catch_unwind, AssertUnwindSafe},
    thread,
    time::{Duration, Instant},
};

use crossbeam::channel;

use crate::{
    action::{ActionOutcome, ActionSet, StepContext},
    config::PacingConfig,
    controller::Controller,
    generator::DataGenerator,
    progress::{ProgressObserver, StepEvent},
    rng::SimulationRng,
    state::{RunFailure, RunState},
    validation::{panic_message, PendingValidation, ValidationQueue},
};

/// What the scheduler dispatched during one run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Schedule {
    /// Action name per submitted step, in selection order.
    pub trace: Vec<String>,
    /// Number of submissions per action name.
    pub distribution: BTreeMap<String, u64>,
}

impl Schedule {
    fn record(&mut self, action: &str) {
        self.trace.push(action.to_owned());
        *self.distribution.entry(action.to_owned()).or_default() += 1;
    }
}

struct Job {
    step: u64,
    index: usize,
}

pub(crate) struct Scheduler<'a> {
    pub actions: &'a ActionSet,
    pub pool_size: usize,
    pub pacing: PacingConfig,
    pub rng: &'a SimulationRng,
    pub state: &'a RunState,
    pub validations: &'a ValidationQueue,
    pub controller: &'a dyn Controller,
    pub generator: &'a DataGenerator,
    pub progress: &'a dyn ProgressObserver,
}

impl Scheduler<'_> {
    /// Submits up to `state.steps` steps and returns once every submitted
    /// step has either run or been skipped.
    pub fn run(&self) -> Schedule {
        let (tx, rx) = channel::unbounded::<Job>();
        let mut schedule = Schedule::default();

        thread::scope(|s| {
            for worker in 0..self.pool_size {
                let rx = rx.clone();
                let spawned = thread::Builder::new()
                    .name(format!("pool-{worker}"))
                    .spawn_scoped(s, move || {
                        for job in rx.iter() {
                            self.execute(job);
                        }
                    });
                if let Err(err) = spawned {
                    tracing::error!(%err, worker, "Failed to spawn pool worker");
                    if worker == 0 {
                        self.state
                            .fail_action(RunFailure::action("scheduler", 0, err.to_string()));
                        return;
                    }
                }
            }
            drop(rx);

            for step in 1..=self.state.steps {
                if self.state.should_stop() {
                    tracing::info!(step, "Stop raised, no further submissions");
                    break;
                }
                let index = self.actions.pick(self.rng);
                let delay = self
                    .rng
                    .gen_millis(self.pacing.min_delay_ms, self.pacing.max_delay_ms);
                if let Some(action) = self.actions.get(index) {
                    schedule.record(action.name());
                }
                if tx.send(Job { step, index }).is_err() {
                    break;
                }
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
            }
            drop(tx);
        });

        tracing::debug!(submitted = schedule.trace.len(), "Action pool drained");
        schedule
    }

    fn execute(&self, job: Job) {
        let Some(action) = self.actions.get(job.index) else {
            return;
        };
        if self.state.should_stop() {
            tracing::debug!(step = job.step, action = action.name(), "Skipping step");
            return;
        }
        let event = StepEvent {
            step: job.step,
            total: self.state.steps,
            action: action.name(),
            weight: action.weight(),
        };
        self.state.step_started();
        self.progress.step_started(&event);

        let ctx = StepContext {
            step: job.step,
            controller: self.controller,
            generator: self.generator,
            rng: self.rng.child_with_index(job.step),
        };
        let started = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| action.execute(&ctx)));
        let elapsed = started.elapsed();

        let failure = |reason: String| RunFailure::action(action.name(), job.step, reason);
        match result {
            Ok(Ok(ActionOutcome::Completed)) => self.completed(&event, elapsed),
            Ok(Ok(ActionOutcome::Deferred(validator))) => {
                // the validation clock starts when the action returns
                match self.controller.clock().get() {
                    Ok(started_at) => {
                        self.validations.push(PendingValidation {
                            validator,
                            started_at,
                            step: job.step,
                        });
                        self.completed(&event, elapsed);
                    }
                    Err(err) => self.state.fail_fatal(err),
                }
            }
            Ok(Ok(ActionOutcome::Failed(reason))) => self.state.fail_action(failure(reason)),
            Ok(Err(err)) => match err.into_clock_error() {
                Ok(clock) => self.state.fail_fatal(clock),
                Err(err) => self.state.fail_action(failure(err.to_string())),
            },
            Err(panic) => self
                .state
                .fail_action(failure(panic_message(panic.as_ref()))),
        }
    }

    fn completed(&self, event: &StepEvent<'_>, elapsed: Duration) {
        self.state.step_completed();
        self.progress.step_completed(event, elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        action::{from_fn, ActionError, FnValidator},
        clock::{MemoryClockStore, VirtualClock},
        controller::{ControllerError, MailQueue, OutgoingMessage},
        progress::NoProgress,
        state::{FailureKind, StopSignal},
    };
    use std::{
        path::Path,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
    };

    struct ClockOnly(VirtualClock);

    impl Controller for ClockOnly {
        fn clock(&self) -> &VirtualClock {
            &self.0
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
            Ok(())
        }
    }

    fn controller() -> ClockOnly {
        let start = chrono::NaiveDate::from_ymd_opt(2023, 3, 3)
            .unwrap()
            .and_hms_opt(3, 3, 3)
            .unwrap();
        ClockOnly(VirtualClock::new(MemoryClockStore::new(start)))
    }

    fn schedule(actions: &ActionSet, seed: u64, state: &RunState) -> (Schedule, ValidationQueue) {
        let controller = controller();
        let rng = SimulationRng::new(seed);
        let generator = DataGenerator::new();
        let validations = ValidationQueue::new();
        let schedule = Scheduler {
            actions,
            pool_size: 4,
            pacing: PacingConfig {
                min_delay_ms: 0,
                max_delay_ms: 0,
            },
            rng: &rng,
            state,
            validations: &validations,
            controller: &controller,
            generator: &generator,
            progress: &NoProgress,
        }
        .run();
        (schedule, validations)
    }

    #[test]
    fn trace_is_a_function_of_the_seed() {
        let actions = ActionSet::new(vec![
            from_fn("a", 1.0, |_| Ok(ActionOutcome::Completed)),
            from_fn("b", 0.5, |_| Ok(ActionOutcome::Completed)),
            from_fn("c", 0.1, |_| Ok(ActionOutcome::Completed)),
        ])
        .unwrap();
        let run = |seed| {
            let state = RunState::new(200, StopSignal::new());
            let (schedule, _) = schedule(&actions, seed, &state);
            assert_eq!(state.completed(), 200);
            schedule
        };
        let first = run(7);
        assert_eq!(first.trace.len(), 200);
        assert_eq!(first, run(7));
        assert_ne!(first.trace, run(8).trace);
        assert_eq!(first.distribution.values().sum::<u64>(), 200);
    }

    #[test]
    fn step_rng_does_not_depend_on_the_worker() {
        let seen = Arc::new(parking_lot::Mutex::new(BTreeMap::new()));
        let record = seen.clone();
        let actions = ActionSet::new(vec![from_fn("draw", 1.0, move |ctx| {
            record.lock().insert(ctx.step, ctx.rng.gen_u64());
            Ok(ActionOutcome::Completed)
        })])
        .unwrap();
        let state = RunState::new(50, StopSignal::new());
        schedule(&actions, 3, &state);
        let first = std::mem::take(&mut *seen.lock());
        let state = RunState::new(50, StopSignal::new());
        schedule(&actions, 3, &state);
        assert_eq!(first, *seen.lock());
    }

    #[test]
    fn failure_stops_submissions() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let actions = ActionSet::new(vec![from_fn("flaky", 1.0, move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(ActionOutcome::failed("refused"))
            } else {
                Ok(ActionOutcome::Completed)
            }
        })])
        .unwrap();
        let state = RunState::new(1_000, StopSignal::new());
        let (schedule, _) = {
            let controller = controller();
            let rng = SimulationRng::new(1);
            let generator = DataGenerator::new();
            let validations = ValidationQueue::new();
            let schedule = Scheduler {
                actions: &actions,
                pool_size: 1,
                pacing: PacingConfig {
                    min_delay_ms: 1,
                    max_delay_ms: 1,
                },
                rng: &rng,
                state: &state,
                validations: &validations,
                controller: &controller,
                generator: &generator,
                progress: &NoProgress,
            }
            .run();
            (schedule, validations)
        };
        let failure = state.failure().unwrap();
        assert_eq!(failure.kind, FailureKind::Action);
        assert_eq!(failure.step, Some(1));
        assert!(schedule.trace.len() < 1_000);
        assert!(state.started() <= schedule.trace.len() as u64);
    }

    #[test]
    fn errors_and_panics_fail_the_run() {
        let erroring = ActionSet::new(vec![from_fn("err", 1.0, |_| {
            Err(ActionError::other("no route to host"))
        })])
        .unwrap();
        let state = RunState::new(5, StopSignal::new());
        schedule(&erroring, 1, &state);
        assert!(state.failure().unwrap().reason.contains("no route"));

        let panicking = ActionSet::new(vec![from_fn("panic", 1.0, |_| panic!("boom"))]).unwrap();
        let state = RunState::new(5, StopSignal::new());
        schedule(&panicking, 1, &state);
        let failure = state.failure().unwrap();
        assert_eq!(failure.name, "panic");
        assert!(failure.reason.contains("boom"));
    }

    #[test]
    fn deferred_outcomes_are_queued() {
        let actions = ActionSet::new(vec![from_fn("defer", 1.0, |_| {
            Ok(ActionOutcome::deferred(FnValidator::new(
                "check",
                Duration::from_secs(1),
                |_| Ok(true),
            )))
        })])
        .unwrap();
        let state = RunState::new(6, StopSignal::new());
        let (_, validations) = schedule(&actions, 1, &state);
        assert_eq!(validations.outstanding(), 6);
        assert_eq!(state.completed(), 6);
    }
}
