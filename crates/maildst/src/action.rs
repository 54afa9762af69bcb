//! The capability contract between the engine and the units of work it runs.
//!
//! An [`Action`] is a weighted unit of work. When its effect only becomes
//! observable after some simulated delay it hands back a [`Validator`] which
//! the validation queue evaluates once that delay has elapsed.

use std::{sync::Arc, time::Duration};

use rand::distributions::{Distribution, WeightedIndex};

use crate::{
    clock::ClockError,
    config::ConfigError,
    controller::{Controller, ControllerError},
    generator::{DataGenerator, GeneratorError},
    rng::SimulationRng,
};

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error(transparent)]
    Generator(#[from] GeneratorError),
    #[error("{0}")]
    Other(String),
}

impl ActionError {
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// The clock error behind this failure, if any. Those abort the run
    /// instead of being reported as an ordinary action failure.
    pub fn into_clock_error(self) -> Result<ClockError, Self> {
        match self {
            Self::Controller(ControllerError::Clock(err)) => Ok(err),
            other => Err(other),
        }
    }
}

impl From<ClockError> for ActionError {
    fn from(err: ClockError) -> Self {
        Self::Controller(ControllerError::Clock(err))
    }
}

/// Result of a single action execution.
pub enum ActionOutcome {
    /// The work is done and its effect was checked (or needs no check).
    Completed,
    /// The work was requested, its effect is checked later by the validator.
    Deferred(Box<dyn Validator>),
    /// The action observed that its work did not happen.
    Failed(String),
}

impl ActionOutcome {
    pub fn deferred(validator: impl Validator + 'static) -> Self {
        Self::Deferred(Box::new(validator))
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

impl std::fmt::Debug for ActionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "Completed"),
            Self::Deferred(v) => write!(f, "Deferred({})", v.name()),
            Self::Failed(reason) => write!(f, "Failed({reason})"),
        }
    }
}

/// Everything an action may touch while executing one step.
pub struct StepContext<'a> {
    /// 1-based step number, in submission order.
    pub step: u64,
    pub controller: &'a dyn Controller,
    pub generator: &'a DataGenerator,
    /// Generator derived from the run seed and the step number.
    pub rng: SimulationRng,
}

pub trait Action: Send + Sync {
    /// Identity used in traces, distribution statistics and failure reports.
    fn name(&self) -> &str;

    /// Relative selection likelihood. Must be finite and non-negative.
    fn weight(&self) -> f64 {
        1.0
    }

    fn execute(&self, ctx: &StepContext<'_>) -> Result<ActionOutcome, ActionError>;
}

/// Deferred postcondition produced by an action.
pub trait Validator: Send {
    fn name(&self) -> &str;

    /// Simulated time that must elapse after the producing action returned
    /// before the postcondition is evaluated.
    fn timeout(&self) -> Duration;

    fn validate(&self, controller: &dyn Controller) -> Result<bool, ActionError>;
}

/// Action backed by a closure.
pub struct FnAction<F> {
    name: String,
    weight: f64,
    f: F,
}

impl<F> Action for FnAction<F>
where
    F: Fn(&StepContext<'_>) -> Result<ActionOutcome, ActionError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn execute(&self, ctx: &StepContext<'_>) -> Result<ActionOutcome, ActionError> {
        (self.f)(ctx)
    }
}

pub fn from_fn<F>(name: impl Into<String>, weight: f64, f: F) -> Arc<dyn Action>
where
    F: Fn(&StepContext<'_>) -> Result<ActionOutcome, ActionError> + Send + Sync + 'static,
{
    Arc::new(FnAction {
        name: name.into(),
        weight,
        f,
    })
}

/// Validator backed by a closure.
pub struct FnValidator<F> {
    name: String,
    timeout: Duration,
    f: F,
}

impl<F> FnValidator<F>
where
    F: Fn(&dyn Controller) -> Result<bool, ActionError> + Send,
{
    pub fn new(name: impl Into<String>, timeout: Duration, f: F) -> Self {
        Self {
            name: name.into(),
            timeout,
            f,
        }
    }
}

impl<F> Validator for FnValidator<F>
where
    F: Fn(&dyn Controller) -> Result<bool, ActionError> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn validate(&self, controller: &dyn Controller) -> Result<bool, ActionError> {
        (self.f)(controller)
    }
}

/// The registry of actions a simulation picks from.
///
/// Weights are checked once here; a set that cannot be sampled is a
/// configuration error and no run is started with it.
#[derive(Clone)]
pub struct ActionSet {
    actions: Vec<Arc<dyn Action>>,
    index: WeightedIndex<f64>,
    total_weight: f64,
}

impl ActionSet {
    pub fn new(actions: Vec<Arc<dyn Action>>) -> Result<Self, ConfigError> {
        if actions.is_empty() {
            return Err(ConfigError::NoActions);
        }
        for action in &actions {
            let weight = action.weight();
            if !weight.is_finite() || weight < 0.0 {
                return Err(ConfigError::InvalidWeight {
                    action: action.name().to_owned(),
                    weight,
                });
            }
        }
        let total_weight: f64 = actions.iter().map(|a| a.weight()).sum();
        if total_weight <= 0.0 {
            return Err(ConfigError::ZeroTotalWeight);
        }
        let index = WeightedIndex::new(actions.iter().map(|a| a.weight()))
            .map_err(|err| ConfigError::Weights(err.to_string()))?;
        Ok(Self {
            actions,
            index,
            total_weight,
        })
    }

    /// Picks the next action; probability is `weight / total_weight`.
    pub fn pick(&self, rng: &SimulationRng) -> usize {
        self.index.sample(&mut *rng.lock())
    }

    pub fn get(&self, index: usize) -> Option<&Arc<dyn Action>> {
        self.actions.get(index)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Action>> {
        self.actions.iter()
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    pub fn normalized_weight(&self, index: usize) -> Option<f64> {
        self.get(index).map(|a| a.weight() / self.total_weight)
    }
}

impl std::fmt::Debug for ActionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.actions.iter().map(|a| (a.name(), a.weight())))
            .finish()
    }
}
