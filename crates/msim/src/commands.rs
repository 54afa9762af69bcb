use std::{fs, path::Path, process::ExitCode};

use anyhow::Context;
use maildst::{
    actions::default_action_set,
    config::SimulationConfig,
    controller::environment_from_config,
    determinism::DeterminismOutcome,
    RunReport, Simulation, StopSignal, Verdict,
};
use prettytable::{Cell, Row, Table};
use rand::Rng;
use serde::Serialize;

use crate::config::{Config, RunConfig, SubCommand};

const MAX_RANDOM_SEED: u64 = 1_000_000_000;

/// Process outcome, mapped onto the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Passed,
    Failed,
    DeterminismViolation,
}

impl From<Status> for ExitCode {
    fn from(status: Status) -> Self {
        match status {
            Status::Passed => ExitCode::SUCCESS,
            Status::Failed => ExitCode::from(1),
            Status::DeterminismViolation => ExitCode::from(2),
        }
    }
}

pub fn execute(config: Config) -> anyhow::Result<Status> {
    let sim_config = load_config(config.config.as_deref())?;
    match config.sub_command {
        SubCommand::Run(run_config) => run(sim_config, run_config),
        SubCommand::Actions => list_actions(&sim_config),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SimulationConfig> {
    match path {
        Some(path) => SimulationConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(SimulationConfig::default()),
    }
}

fn run(mut sim_config: SimulationConfig, run_config: RunConfig) -> anyhow::Result<Status> {
    if let Some(kind) = run_config.environment {
        sim_config.environment.kind = kind;
    }
    let seed = run_config
        .seed
        .unwrap_or_else(|| rand::thread_rng().gen_range(1..=MAX_RANDOM_SEED));
    tracing::info!(
        seed,
        steps = run_config.steps,
        environment = %sim_config.environment.kind,
        "Random seed: {seed}"
    );

    let interrupt = StopSignal::new();
    let handler_signal = interrupt.clone();
    ctrlc::set_handler(move || {
        tracing::warn!("Interrupted, stopping after in-flight actions");
        handler_signal.raise();
    })
    .context("installing the Ctrl-C handler")?;

    let actions = default_action_set(&sim_config)?;
    let environment = environment_from_config(&sim_config);
    let simulation =
        Simulation::new(actions, environment, sim_config)?.with_interrupt(interrupt);

    if run_config.single {
        let report = simulation.run(seed, run_config.steps)?;
        print_summary(&report);
        write_report(run_config.report.as_deref(), &report)?;
        return Ok(if report.passed() {
            Status::Passed
        } else {
            Status::Failed
        });
    }

    let report = simulation.run_with_determinism_check(seed, run_config.steps)?;
    print_summary(report.second.as_ref().unwrap_or(&report.first));
    write_report(run_config.report.as_deref(), &report)?;
    let status = match &report.outcome {
        DeterminismOutcome::Identical => {
            println!("Seed {seed} is reproducible");
            Status::Passed
        }
        DeterminismOutcome::RunFailed { run } => {
            println!("Run {run} of seed {seed} failed");
            Status::Failed
        }
        DeterminismOutcome::Violation { artifacts, trace } => {
            println!("Determinism violation for seed {seed}");
            for path in &artifacts.changed {
                println!("  changed: {}", path.display());
            }
            for path in &artifacts.only_in_first {
                println!("  only in first run: {}", path.display());
            }
            for path in &artifacts.only_in_second {
                println!("  only in second run: {}", path.display());
            }
            if let Some(trace) = trace {
                println!(
                    "  traces diverge at step {}: {:?} vs {:?}",
                    trace.index + 1,
                    trace.first,
                    trace.second
                );
            }
            Status::DeterminismViolation
        }
    };
    Ok(status)
}

fn print_summary(report: &RunReport) {
    let mut table = Table::new();
    table.add_row(Row::new(vec![
        Cell::new("Action"),
        Cell::new("Count"),
        Cell::new("Share"),
    ]));
    let total = report.trace.len().max(1) as f64;
    for (action, count) in &report.distribution {
        table.add_row(Row::new(vec![
            Cell::new(action),
            Cell::new(&count.to_string()),
            Cell::new(&format!("{:.1}%", *count as f64 * 100.0 / total)),
        ]));
    }
    println!(
        "\n=== Seed {} ({}/{} steps completed in {:.2?}) ===",
        report.seed, report.completed, report.steps, report.elapsed
    );
    table.printstd();
    match &report.verdict {
        Verdict::Passed => println!("Simulation passed"),
        Verdict::Failed(failure) => println!("Simulation failed: {failure}"),
    }
}

fn write_report(path: Option<&Path>, report: &impl Serialize) -> anyhow::Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let json = serde_json::to_string_pretty(report)?;
    fs::write(path, json).with_context(|| format!("writing report to {}", path.display()))?;
    tracing::info!(path = %path.display(), "Wrote run report");
    Ok(())
}

fn list_actions(sim_config: &SimulationConfig) -> anyhow::Result<Status> {
    let actions = default_action_set(sim_config)?;
    let mut table = Table::new();
    table.add_row(Row::new(vec![
        Cell::new("Action"),
        Cell::new("Weight"),
        Cell::new("Probability"),
    ]));
    for (index, action) in actions.iter().enumerate() {
        let probability = actions.normalized_weight(index).unwrap_or_default();
        table.add_row(Row::new(vec![
            Cell::new(action.name()),
            Cell::new(&format!("{:.2}", action.weight())),
            Cell::new(&format!("{:.1}%", probability * 100.0)),
        ]));
    }
    table.printstd();
    Ok(Status::Passed)
}
