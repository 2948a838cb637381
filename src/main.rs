use anyhow::Result;
use clap::Parser;
use rust_tick_stream::chart;
use rust_tick_stream::cli::{self, Cli};
use rust_tick_stream::pipeline;
use rust_tick_stream::seed;

#[tokio::main]
async fn main() -> Result<()> {
    match Cli::parse().command() {
        cli::Command::Run(args) => pipeline::run(args.into_config()).await,
        cli::Command::Seed(args) => seed::run(args).await,
        cli::Command::Chart(args) => chart::run(args),
    }
}
