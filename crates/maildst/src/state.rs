//! Shared state of a single run.
//!
//! Pool workers, the validation worker and the coordinator all read and
//! write this concurrently. Invariant: the stop flag only ever goes from
//! `false` to `true`, and each latch keeps the first value written to it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::clock::ClockError;

/// Write-once cell: the first `set` wins, later ones are no-ops.
#[derive(Debug)]
pub struct Latch<T> {
    value: Mutex<Option<T>>,
}

impl<T> Default for Latch<T> {
    fn default() -> Self {
        Self {
            value: Mutex::new(None),
        }
    }
}

impl<T> Latch<T> {
    /// Stores `value` if the latch is still empty. Returns whether it was stored.
    pub fn set(&self, value: T) -> bool {
        let mut slot = self.value.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        true
    }

    pub fn is_set(&self) -> bool {
        self.value.lock().is_some()
    }

    pub fn take(&self) -> Option<T> {
        self.value.lock().take()
    }
}

impl<T: Clone> Latch<T> {
    pub fn get(&self) -> Option<T> {
        self.value.lock().clone()
    }
}

/// Cooperative stop flag, cheap to clone and share with signal handlers.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// An action reported failure, returned an error or panicked.
    Action,
    /// A deferred postcondition resolved false or errored.
    Validation,
    /// The run was stopped from outside before it could finish.
    Interrupted,
}

/// Why a run failed, as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunFailure {
    pub kind: FailureKind,
    /// Name of the failed action or validator.
    pub name: String,
    pub step: Option<u64>,
    pub reason: String,
}

impl RunFailure {
    pub fn action(name: impl Into<String>, step: u64, reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Action,
            name: name.into(),
            step: Some(step),
            reason: reason.into(),
        }
    }

    pub fn validation(name: impl Into<String>, step: u64, reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Validation,
            name: name.into(),
            step: Some(step),
            reason: reason.into(),
        }
    }

    pub fn interrupted() -> Self {
        Self {
            kind: FailureKind::Interrupted,
            name: "run".to_owned(),
            step: None,
            reason: "stop requested".to_owned(),
        }
    }
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            FailureKind::Action => write!(f, "action {} failed", self.name)?,
            FailureKind::Validation => write!(f, "validation failed for {}", self.name)?,
            FailureKind::Interrupted => write!(f, "{} interrupted", self.name)?,
        }
        if let Some(step) = self.step {
            write!(f, " at step {step}")?;
        }
        write!(f, ": {}", self.reason)
    }
}

/// Counters, latches and the stop signal of one run.
#[derive(Debug)]
pub struct RunState {
    pub steps: u64,
    started: AtomicU64,
    completed: AtomicU64,
    validations_resolved: AtomicU64,
    stop: StopSignal,
    interrupt: StopSignal,
    action_failure: Latch<RunFailure>,
    validation_failure: Latch<RunFailure>,
    fatal: Latch<ClockError>,
    actions_drained: AtomicBool,
}

impl RunState {
    pub fn new(steps: u64, interrupt: StopSignal) -> Self {
        Self {
            steps,
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            validations_resolved: AtomicU64::new(0),
            stop: StopSignal::new(),
            interrupt,
            action_failure: Latch::default(),
            validation_failure: Latch::default(),
            fatal: Latch::default(),
            actions_drained: AtomicBool::new(false),
        }
    }

    /// True once the run must not dispatch new work, whether it was raised
    /// internally or by an external interrupt.
    pub fn should_stop(&self) -> bool {
        self.stop.is_raised() || self.interrupt.is_raised()
    }

    pub fn raise_stop(&self) {
        self.stop.raise();
    }

    pub fn interrupted(&self) -> bool {
        self.interrupt.is_raised()
    }

    pub fn fail_action(&self, failure: RunFailure) {
        if self.action_failure.set(failure.clone()) {
            tracing::error!(%failure, "Action failed, stopping run");
        }
        self.raise_stop();
    }

    pub fn fail_validation(&self, failure: RunFailure) {
        if self.validation_failure.set(failure.clone()) {
            tracing::error!(%failure, "Validation failed, stopping run");
        }
        self.raise_stop();
    }

    pub fn fail_fatal(&self, error: ClockError) {
        tracing::error!(%error, "Clock unavailable, aborting run");
        self.fatal.set(error);
        self.raise_stop();
    }

    /// Any latched error, including a fatal one.
    pub fn has_failed(&self) -> bool {
        self.action_failure.is_set() || self.validation_failure.is_set() || self.fatal.is_set()
    }

    pub fn has_action_failure(&self) -> bool {
        self.action_failure.is_set()
    }

    pub fn step_started(&self) -> u64 {
        self.started.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn step_completed(&self) -> u64 {
        self.completed.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn validation_resolved(&self) {
        self.validations_resolved.fetch_add(1, Ordering::AcqRel);
    }

    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn validations_resolved(&self) -> u64 {
        self.validations_resolved.load(Ordering::Acquire)
    }

    pub fn mark_actions_drained(&self) {
        self.actions_drained.store(true, Ordering::Release);
    }

    /// True once the pool is drained and no action can touch the clock anymore.
    pub fn actions_drained(&self) -> bool {
        self.actions_drained.load(Ordering::Acquire)
    }

    pub(crate) fn take_fatal(&self) -> Option<ClockError> {
        self.fatal.take()
    }

    /// The verdict: the action failure wins over a validation failure, an
    /// external interrupt is reported only if nothing else failed.
    pub(crate) fn failure(&self) -> Option<RunFailure> {
        self.action_failure
            .get()
            .or_else(|| self.validation_failure.get())
            .or_else(|| self.interrupted().then(RunFailure::interrupted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_keeps_first_value() {
        let latch = Latch::default();
        assert!(latch.set(1));
        assert!(!latch.set(2));
        assert_eq!(latch.get(), Some(1));
    }

    #[test]
    fn concurrent_failures_keep_the_first_writer() {
        let state = RunState::new(10, StopSignal::new());
        std::thread::scope(|s| {
            for i in 0..8 {
                let state = &state;
                s.spawn(move || state.fail_action(RunFailure::action(format!("a{i}"), i, "boom")));
            }
        });
        let failure = state.failure().unwrap();
        assert_eq!(failure.kind, FailureKind::Action);
        assert!(state.should_stop());
        // whichever thread won, the value stays stable
        assert_eq!(state.failure(), Some(failure));
    }

    #[test]
    fn action_failure_wins_over_validation_failure() {
        let state = RunState::new(1, StopSignal::new());
        state.fail_validation(RunFailure::validation("EmailValidator", 1, "missing"));
        state.fail_action(RunFailure::action("SendEmail", 2, "refused"));
        assert_eq!(state.failure().unwrap().kind, FailureKind::Action);
    }

    #[test]
    fn external_interrupt_stops_without_latching() {
        let interrupt = StopSignal::new();
        let state = RunState::new(1, interrupt.clone());
        assert!(!state.should_stop());
        interrupt.raise();
        assert!(state.should_stop());
        assert!(!state.has_failed());
        assert_eq!(state.failure().unwrap().kind, FailureKind::Interrupted);
    }

    #[test]
    fn failure_display_names_the_culprit() {
        let failure = RunFailure::action("RemoveUser", 3, "empty pool");
        assert_eq!(
            failure.to_string(),
            "action RemoveUser failed at step 3: empty pool"
        );
    }
}
