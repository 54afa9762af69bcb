//! Deterministic simulation testing for a two-MTA mail pipeline.
//!
//! A [`Simulation`] draws a seed-determined sequence of weighted
//! [`Action`]s, runs them concurrently against a [`Controller`] that owns a
//! shared [`VirtualClock`], checks deferred postconditions once enough
//! simulated time has passed, and can replay a seed to verify that the run's
//! artifacts are reproducible.

pub mod action;
pub mod actions;
pub mod clock;
pub mod config;
pub mod controller;
pub mod determinism;
pub mod generator;
pub mod progress;
pub mod rng;
pub mod runner;
mod scheduler;
pub mod state;
pub mod validation;

pub use action::{Action, ActionError, ActionOutcome, ActionSet, StepContext, Validator};
pub use clock::{ClockError, Timestamp, VirtualClock};
pub use config::{ConfigError, SimulationConfig};
pub use controller::{Controller, ControllerError, Environment};
pub use determinism::{DeterminismOutcome, DeterminismReport};
pub use generator::DataGenerator;
pub use progress::{ProgressObserver, StepEvent};
pub use rng::SimulationRng;
pub use runner::{RunReport, Simulation, SimulationError, Verdict};
pub use scheduler::Schedule;
pub use state::{FailureKind, RunFailure, StopSignal};
