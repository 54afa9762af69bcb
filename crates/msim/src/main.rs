use std::process::ExitCode;

use clap::Parser;

mod commands;
mod config;

use crate::config::Config;

fn main() -> ExitCode {
    let config = Config::parse();
    maildst::config::set_logger(None);
    match commands::execute(config) {
        Ok(status) => status.into(),
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
