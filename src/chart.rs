use anyhow::{bail, Result};
use chrono::Utc;
use clap::Args;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rust_decimal::prelude::ToPrimitive;
use textplots::{Chart, Plot, Shape};

use crate::constants::{DEFAULT_INITIAL_PRICE, DEFAULT_VOLATILITY};
use crate::generator::HistoricalSeeder;
use crate::store::candles;
use crate::tick::{normalize_symbol, Tick};

#[derive(Debug, Args, Clone)]
pub struct ChartArgs {
    /// Symbol to plot
    #[arg(short, long, default_value = "AAPL")]
    pub symbol: String,

    /// Trading days of minute history to generate
    #[arg(short, long, default_value_t = 1)]
    pub days: u32,

    /// Seed for a reproducible path
    #[arg(long)]
    pub seed: Option<u64>,

    /// Chart width in characters
    #[arg(long, default_value_t = 120)]
    pub width: u32,

    /// Chart height in characters
    #[arg(long, default_value_t = 30)]
    pub height: u32,
}

pub fn run(args: ChartArgs) -> Result<()> {
    let symbol = normalize_symbol(&args.symbol);
    if symbol.is_empty() {
        bail!("symbol must not be empty");
    }
    if args.days == 0 {
        bail!("--days must be at least 1");
    }

    let rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut seeder = HistoricalSeeder::new(DEFAULT_VOLATILITY, DEFAULT_INITIAL_PRICE, rng)?;
    let ticks = seeder.generate(std::slice::from_ref(&symbol), args.days, Utc::now())?;

    let points = chart_points(&ticks);
    if points.len() < 2 {
        bail!("not enough data points to render a chart");
    }

    render_chart(&symbol, &ticks, points, args.width, args.height);
    Ok(())
}

/// `(hours since first tick, price)` pairs.
fn chart_points(ticks: &[Tick]) -> Vec<(f32, f32)> {
    let Some(first) = ticks.first() else {
        return Vec::new();
    };
    ticks
        .iter()
        .filter_map(|tick| {
            let hours = (tick.timestamp - first.timestamp).num_seconds() as f32 / 3600.0;
            tick.price.to_f32().map(|price| (hours, price))
        })
        .collect()
}

fn render_chart(symbol: &str, ticks: &[Tick], points: Vec<(f32, f32)>, width: u32, height: u32) {
    println!("Rendering chart for {symbol} ({} minute ticks)", points.len());

    let daily = candles(ticks, chrono::Duration::days(1));
    for bar in &daily {
        println!(
            "{}  O {:>8}  H {:>8}  L {:>8}  C {:>8}  V {}",
            bar.bucket_start.format("%Y-%m-%d %H:%M"),
            bar.open,
            bar.high,
            bar.low,
            bar.close,
            bar.volume
        );
    }

    let max_time = points.last().map(|(t, _)| *t).unwrap_or(1.0).max(1e-3);
    Chart::new(width.max(40), height.max(10), 0.0, max_time)
        .lineplot(&Shape::Lines(&points))
        .display();
    println!();
}
