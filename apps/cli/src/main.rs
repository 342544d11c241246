//! LeadGarage CLI: validate, route, and repair lead records.
//!
//! Pulls invalid company/person records from the local store, dispatches them
//! to enrichment spokes under budget limits, and keeps an append-only routing
//! log of every cycle.

mod commands;

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
