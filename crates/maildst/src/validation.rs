//! Deferred validation queue.
//!
//! Pool workers push [`PendingValidation`]s; a single worker thread drains
//! the queue once per pass, evaluates what is due in simulated time and
//! re-queues the rest. The outstanding counter includes items the worker is
//! holding mid-pass, so an empty channel alone never means "resolved".

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::Duration,
};

use chrono::TimeDelta;
use crossbeam::channel::{self, Receiver, Sender};

use crate::{
    action::Validator,
    clock::Timestamp,
    controller::Controller,
    progress::ProgressObserver,
    state::{RunFailure, RunState},
};

/// A validator waiting for its timeout to elapse.
pub struct PendingValidation {
    pub validator: Box<dyn Validator>,
    /// Simulated time at which the producing action returned.
    pub started_at: Timestamp,
    pub step: u64,
}

impl PendingValidation {
    /// Simulated time from which the validator may be evaluated.
    pub fn deadline(&self) -> Timestamp {
        TimeDelta::from_std(self.validator.timeout())
            .ok()
            .and_then(|timeout| self.started_at.checked_add_signed(timeout))
            .unwrap_or(Timestamp::MAX)
    }

    pub fn is_due(&self, now: Timestamp) -> bool {
        now >= self.deadline()
    }
}

impl std::fmt::Debug for PendingValidation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingValidation")
            .field("validator", &self.validator.name())
            .field("started_at", &self.started_at)
            .field("step", &self.step)
            .finish()
    }
}

pub struct ValidationQueue {
    tx: Sender<PendingValidation>,
    rx: Receiver<PendingValidation>,
    outstanding: AtomicUsize,
}

impl Default for ValidationQueue {
    fn default() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            tx,
            rx,
            outstanding: AtomicUsize::new(0),
        }
    }
}

impl ValidationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, pending: PendingValidation) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        self.requeue(pending);
    }

    /// Validators pushed and not yet resolved, including those mid-pass.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn is_resolved(&self) -> bool {
        self.outstanding() == 0
    }

    fn requeue(&self, pending: PendingValidation) {
        // the queue owns both ends, sending cannot fail
        let _ = self.tx.send(pending);
    }

    fn drain(&self) -> Vec<PendingValidation> {
        self.rx.try_iter().collect()
    }

    fn resolve(&self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for ValidationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationQueue")
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

pub(crate) struct ValidationWorker<'a> {
    pub queue: &'a ValidationQueue,
    pub state: &'a RunState,
    pub controller: &'a dyn Controller,
    pub progress: &'a dyn ProgressObserver,
    pub poll_interval: Duration,
}

enum Pass {
    /// Nothing left to do until the next poll.
    Idle,
    /// Nothing was due; earliest deadline among the re-queued items.
    Waiting(Timestamp),
    Evaluated,
    Abort,
}

impl ValidationWorker<'_> {
    pub fn run(&self) {
        tracing::debug!("Validation worker started");
        loop {
            if self.state.has_failed() || self.state.interrupted() {
                break;
            }
            if self.state.should_stop() && self.queue.is_resolved() {
                break;
            }
            match self.pass() {
                Pass::Abort => break,
                Pass::Waiting(deadline) if self.state.actions_drained() => {
                    // no action can move the clock anymore
                    if let Err(err) = self.controller.clock().advance_to(deadline) {
                        self.state.fail_fatal(err);
                        break;
                    }
                    continue;
                }
                Pass::Idle | Pass::Waiting(_) | Pass::Evaluated => {}
            }
            thread::sleep(self.poll_interval);
        }
        tracing::debug!(
            outstanding = self.queue.outstanding(),
            "Validation worker stopped"
        );
    }

    fn pass(&self) -> Pass {
        let batch = self.queue.drain();
        if batch.is_empty() {
            return Pass::Idle;
        }
        let now = match self.controller.clock().get() {
            Ok(now) => now,
            Err(err) => {
                self.state.fail_fatal(err);
                return Pass::Abort;
            }
        };

        let mut evaluated = false;
        let mut earliest: Option<Timestamp> = None;
        for pending in batch {
            if self.state.has_failed() {
                return Pass::Abort;
            }
            if pending.is_due(now) {
                evaluated = true;
                self.evaluate(pending);
            } else {
                let deadline = pending.deadline();
                earliest = Some(earliest.map_or(deadline, |e| e.min(deadline)));
                self.queue.requeue(pending);
            }
        }

        match earliest {
            _ if self.state.has_failed() => Pass::Abort,
            _ if evaluated => Pass::Evaluated,
            Some(deadline) => Pass::Waiting(deadline),
            None => Pass::Idle,
        }
    }

    fn evaluate(&self, pending: PendingValidation) {
        let name = pending.validator.name().to_owned();
        let step = pending.step;
        let result = catch_unwind(AssertUnwindSafe(|| {
            pending.validator.validate(self.controller)
        }));
        let passed = match result {
            Ok(Ok(true)) => true,
            Ok(Ok(false)) => {
                self.state.fail_validation(RunFailure::validation(
                    &name,
                    step,
                    "postcondition does not hold",
                ));
                false
            }
            Ok(Err(err)) => {
                match err.into_clock_error() {
                    Ok(clock) => self.state.fail_fatal(clock),
                    Err(err) => self.state.fail_validation(RunFailure::validation(
                        &name,
                        step,
                        err.to_string(),
                    )),
                }
                false
            }
            Err(panic) => {
                self.state.fail_validation(RunFailure::validation(
                    &name,
                    step,
                    panic_message(panic.as_ref()),
                ));
                false
            }
        };
        self.state.validation_resolved();
        self.queue.resolve();
        self.progress.validation_resolved(&name, step, passed);
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_owned()
    }
}
