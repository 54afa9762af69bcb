use std::path::PathBuf;

use maildst::config::EnvironmentKind;

#[derive(clap::Parser, Clone, Debug)]
#[clap(name = "msim")]
#[clap(about = "Deterministic simulation testing for a two-MTA mail pipeline")]
#[clap(version)]
pub struct Config {
    /// Simulation configuration file (TOML). Built-in defaults are used if omitted.
    #[arg(long, env = "MSIM_CONFIG", global = true)]
    pub config: Option<PathBuf>,
    #[clap(subcommand)]
    pub sub_command: SubCommand,
}

#[derive(clap::Subcommand, Clone, Debug)]
pub enum SubCommand {
    /// Runs a seed, by default twice with a determinism check.
    Run(RunConfig),
    /// Lists the registered actions and their selection weights.
    Actions,
}

#[derive(clap::Parser, Clone, Debug)]
pub struct RunConfig {
    /// Seed for the run. A random one in 1..=1000000000 is drawn if omitted.
    #[arg(long, env = "MSIM_SEED")]
    pub seed: Option<u64>,
    /// Number of actions to submit.
    #[arg(long, env = "MSIM_STEPS", default_value_t = 20)]
    pub steps: u64,
    /// Run once, skipping the twin run and the artifact comparison.
    #[arg(long)]
    pub single: bool,
    /// Overrides the environment kind of the configuration file.
    #[arg(long, value_parser = parse_environment)]
    pub environment: Option<EnvironmentKind>,
    /// Writes the JSON run report to this file.
    #[arg(long)]
    pub report: Option<PathBuf>,
}

fn parse_environment(value: &str) -> Result<EnvironmentKind, String> {
    value.parse()
}
