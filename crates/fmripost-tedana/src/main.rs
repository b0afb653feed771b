mod cli;
mod collect;
mod config;
mod derivatives;
mod filters;
mod logging;
mod run;
mod tedana;

use anyhow::Result;
use clap::Parser;

use crate::cli::Cli;
use crate::config::{Context, Settings};

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose.max(logging::env_verbosity()));
    let settings = Settings::from_cli(cli)?;
    let ctx = Context::init(settings)?;
    run::run(&ctx)
}
