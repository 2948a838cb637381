use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use clap::Args;

use crate::logging;
use crate::pipeline::{self, PipelineConfig};
use crate::store::TickStore;

#[derive(Debug, Args, Clone)]
pub struct SeedArgs {
    /// Trading days to backfill (8 hours of minute ticks each)
    #[arg(short, long, default_value_t = 1)]
    pub days: u32,

    /// Comma-separated symbols; defaults to the standard universe
    #[arg(long, value_delimiter = ',')]
    pub symbols: Vec<String>,

    /// Seed for reproducible history
    #[arg(long)]
    pub seed: Option<u64>,

    /// Give up waiting for persistence after this many seconds
    #[arg(long, default_value_t = 60)]
    pub timeout_secs: u64,
}

pub async fn run(args: SeedArgs) -> Result<()> {
    if args.days == 0 {
        bail!("--days must be at least 1");
    }

    let mut config = PipelineConfig::default();
    if !args.symbols.is_empty() {
        config.symbols = args.symbols;
    }
    config.rng_seed = args.seed;

    logging::set_silent(true);
    let pipeline = pipeline::backfill(
        config,
        args.days,
        Duration::from_secs(args.timeout_secs),
    )
    .await;
    logging::set_silent(false);
    let pipeline = pipeline?;

    println!("Stored {} ticks", pipeline.store.count_all()?);
    println!(
        "{:>8} | {:>6} | {:>10} | {:>10} | {:>10} | {:>10}",
        "symbol", "rows", "first", "last", "min", "max"
    );

    let from = DateTime::<Utc>::MIN_UTC;
    let to = Utc::now();
    for symbol in &pipeline.config.symbols {
        let rows = pipeline.store.range_by_symbol(symbol, from, to)?;
        let (Some(first), Some(last)) = (rows.first(), rows.last()) else {
            println!("{symbol:>8} | {:>6} | no data", 0);
            continue;
        };
        let min = rows.iter().map(|t| t.price).min().unwrap_or(first.price);
        let max = rows.iter().map(|t| t.price).max().unwrap_or(first.price);
        println!(
            "{:>8} | {:>6} | {:>10} | {:>10} | {:>10} | {:>10}",
            symbol,
            rows.len(),
            first.price,
            last.price,
            min,
            max
        );
    }
    Ok(())
}
