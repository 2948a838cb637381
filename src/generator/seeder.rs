use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use rust_decimal::Decimal;

use super::{walk, GeneratorError};
use crate::constants::HISTORY_VOLATILITY_MULTIPLIER;
use crate::tick::{round_price, to_decimal, Tick};

pub const TRADING_HOURS: u32 = 8;
pub const MINUTES_PER_HOUR: u32 = 60;

/// Backdated minute bars for bootstrap and backtesting.
///
/// Runs its own per-symbol price walk at a wider volatility than live
/// generation and never touches the live generator's state. Every symbol gets
/// `days × 8 × 60` ticks, one per simulated trading minute.
pub struct HistoricalSeeder<R = StdRng> {
    rng: R,
    volatility: f64,
    initial_price: f64,
}

impl<R: Rng> HistoricalSeeder<R> {
    /// `base_volatility` is the live setting; the seeder widens it itself.
    pub fn new(base_volatility: f64, initial_price: f64, rng: R) -> Result<Self, GeneratorError> {
        if !base_volatility.is_finite() || base_volatility < 0.0 {
            return Err(GeneratorError::InvalidVolatility(base_volatility));
        }
        if !initial_price.is_finite() || initial_price <= 0.0 {
            return Err(GeneratorError::InvalidPrice(initial_price));
        }
        Ok(Self {
            rng,
            volatility: base_volatility * HISTORY_VOLATILITY_MULTIPLIER,
            initial_price,
        })
    }

    pub fn ticks_per_symbol(days: u32) -> usize {
        (days * TRADING_HOURS * MINUTES_PER_HOUR) as usize
    }

    /// Builds the full backfill ending before `anchor`, ordered minute by minute
    /// with every symbol's tick for a minute adjacent.
    ///
    /// Each symbol walks on its own RNG forked from the seeder's, so series are
    /// generated in parallel yet reproducible from one seed.
    pub fn generate(
        &mut self,
        symbols: &[String],
        days: u32,
        anchor: DateTime<Utc>,
    ) -> Result<Vec<Tick>, GeneratorError> {
        let forks: Vec<u64> = symbols.iter().map(|_| self.rng.gen()).collect();
        let volatility = self.volatility;
        let initial_price = self.initial_price;

        let series: Vec<Vec<Tick>> = symbols
            .par_iter()
            .zip(forks.par_iter())
            .map(|(symbol, fork)| {
                let mut rng = StdRng::seed_from_u64(*fork);
                symbol_series(symbol, days, anchor, volatility, initial_price, &mut rng)
            })
            .collect::<Result<Vec<_>, GeneratorError>>()?;

        let per_symbol = Self::ticks_per_symbol(days);
        let mut interleaved = Vec::with_capacity(per_symbol * symbols.len());
        for minute in 0..per_symbol {
            for ticks in &series {
                interleaved.push(ticks[minute].clone());
            }
        }
        Ok(interleaved)
    }
}

fn symbol_series(
    symbol: &str,
    days: u32,
    anchor: DateTime<Utc>,
    volatility: f64,
    initial_price: f64,
    rng: &mut StdRng,
) -> Result<Vec<Tick>, GeneratorError> {
    let start = initial_price * (0.5 + rng.gen::<f64>());
    let mut price = to_decimal(start).ok_or(GeneratorError::InvalidPrice(start))?;
    let mut ticks = Vec::with_capacity(HistoricalSeeder::<StdRng>::ticks_per_symbol(days));

    for day in (1..=days).rev() {
        let session_open = anchor - Duration::days(day as i64);
        for hour in 0..TRADING_HOURS {
            for minute in 0..MINUTES_PER_HOUR {
                let change = volatility * rng.sample::<f64, _>(StandardNormal);
                price = walk(price, change, rng)?;

                let timestamp = session_open
                    + Duration::hours(hour as i64)
                    + Duration::minutes(minute as i64);
                let open = scaled(price, rng.gen_range(0.995..1.005))?;
                // the sampled bar must still contain its open
                let high = scaled(price, rng.gen_range(1.001..1.011))?.max(open);
                let low = scaled(price, rng.gen_range(0.98..0.99))?.min(open);
                ticks.push(Tick {
                    symbol: symbol.to_string(),
                    price,
                    open,
                    high,
                    low,
                    close: price,
                    volume: rng.gen_range(50_000..150_000),
                    timestamp,
                    change_amount: None,
                    change_percent: None,
                    processed_timestamp: None,
                    processing_latency: None,
                });
            }
        }
    }

    Ok(ticks)
}

fn scaled(price: Decimal, factor: f64) -> Result<Decimal, GeneratorError> {
    let factor = to_decimal(factor).ok_or(GeneratorError::Unrepresentable(factor))?;
    Ok(round_price(price * factor))
}
