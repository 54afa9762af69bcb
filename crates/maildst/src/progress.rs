//! Progress reporting hooks.

use std::time::Duration;

use crate::runner::{RunReport, Verdict};

/// A step as seen by a [`ProgressObserver`].
#[derive(Debug, Clone, Copy)]
pub struct StepEvent<'a> {
    pub step: u64,
    pub total: u64,
    pub action: &'a str,
    pub weight: f64,
}

/// Callbacks fired from the scheduler, pool and validation threads.
/// Implementations must not block.
pub trait ProgressObserver: Send + Sync {
    fn run_started(&self, _seed: u64, _steps: u64) {}

    fn step_started(&self, _event: &StepEvent<'_>) {}

    fn step_completed(&self, _event: &StepEvent<'_>, _elapsed: Duration) {}

    fn validation_resolved(&self, _validator: &str, _step: u64, _passed: bool) {}

    fn run_finished(&self, _report: &RunReport) {}
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {}

/// Renders progress through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressObserver for TracingProgress {
    fn run_started(&self, seed: u64, steps: u64) {
        tracing::info!(seed, steps, "Starting simulation");
    }

    fn step_started(&self, event: &StepEvent<'_>) {
        tracing::debug!(
            step = event.step,
            total = event.total,
            action = event.action,
            weight = event.weight,
            "Step started"
        );
    }

    fn step_completed(&self, event: &StepEvent<'_>, elapsed: Duration) {
        tracing::info!(
            step = event.step,
            total = event.total,
            action = event.action,
            elapsed_ms = elapsed.as_millis() as u64,
            "[{}/{}] {}",
            event.step,
            event.total,
            event.action
        );
    }

    fn validation_resolved(&self, validator: &str, step: u64, passed: bool) {
        tracing::debug!(validator, step, passed, "Validation resolved");
    }

    fn run_finished(&self, report: &RunReport) {
        tracing::info!(
            seed = report.seed,
            completed = report.completed,
            steps = report.steps,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Simulation finished"
        );
        let mut distribution: Vec<_> = report.distribution.iter().collect();
        distribution.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
        let total = report.trace.len().max(1) as f64;
        for (action, count) in distribution {
            tracing::info!(
                action = action.as_str(),
                count,
                "{action}: {count} ({:.1}%)",
                *count as f64 * 100.0 / total
            );
        }
        match &report.verdict {
            Verdict::Passed => tracing::info!(seed = report.seed, "Simulation passed"),
            Verdict::Failed(failure) => {
                tracing::error!(seed = report.seed, %failure, "Simulation failed")
            }
        }
    }
}
