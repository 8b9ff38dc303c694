//! Pedia CLI: a self-growing, cross-linked encyclopedia.
//!
//! Generates articles from queries and runs the background pipeline that
//! extracts entities, links them into a knowledge graph and writes articles
//! for the salient ones.

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
