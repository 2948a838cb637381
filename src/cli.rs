use std::net::SocketAddr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::chart::ChartArgs;
use crate::pipeline::PipelineConfig;
use crate::seed::SeedArgs;

#[derive(Debug, Parser)]
#[command(author, version, about = "Streaming tick generator and enrichment pipeline")]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

impl Cli {
    pub fn command(self) -> Command {
        self.command.unwrap_or_default()
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the generator, enrichment workers and gateway
    Run(RunArgs),
    /// Backfill historical ticks through the pipeline and summarise the store
    Seed(SeedArgs),
    /// Generate a historical series and render an ASCII price chart
    Chart(ChartArgs),
}

impl Default for Command {
    fn default() -> Self {
        Command::Run(RunArgs::default())
    }
}

/// Overrides for the pipeline defaults; anything left out keeps its default.
#[derive(Debug, Args, Clone, Default)]
pub struct RunArgs {
    /// Comma-separated symbol universe (e.g. AAPL,MSFT)
    #[arg(long, value_delimiter = ',')]
    pub symbols: Vec<String>,

    /// Generation cadence in milliseconds
    #[arg(long)]
    pub interval_ms: Option<u64>,

    /// Per-step volatility of the random walk
    #[arg(long)]
    pub volatility: Option<f64>,

    /// Number of records enriched concurrently (capped at the partition count,
    /// since each partition is drained in order by one task)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Days of history to backfill before live generation starts
    #[arg(long)]
    pub history_days: Option<u32>,

    /// Seed for reproducible price paths
    #[arg(long)]
    pub seed: Option<u64>,

    /// Stop after this many generated ticks
    #[arg(long)]
    pub max_ticks: Option<usize>,

    /// Gateway bind address
    #[arg(long)]
    pub gateway_addr: Option<SocketAddr>,

    /// Do not start the HTTP/websocket gateway
    #[arg(long)]
    pub no_gateway: bool,
}

impl RunArgs {
    pub fn into_config(self) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        if !self.symbols.is_empty() {
            config.symbols = self.symbols;
        }
        if let Some(interval_ms) = self.interval_ms {
            config.tick_interval = Duration::from_millis(interval_ms);
        }
        if let Some(volatility) = self.volatility {
            config.volatility = volatility;
        }
        if let Some(workers) = self.workers {
            config.worker_count = workers;
        }
        if let Some(days) = self.history_days {
            config.history_days = days;
        }
        if let Some(addr) = self.gateway_addr {
            config.gateway_addr = addr;
        }
        config.rng_seed = self.seed;
        config.max_ticks = self.max_ticks;
        config.enable_gateway = !self.no_gateway;
        config
    }
}
