//! plancrawl CLI: resumable two-phase crawler for plan catalogs.
//!
//! Reads an ordered list of zipcodes, collects plan listings per zipcode,
//! then fetches each plan's details, saving progress as it goes.

mod commands;
mod input;
mod progress;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
