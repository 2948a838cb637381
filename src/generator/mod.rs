//! Per-symbol random-walk tick generation.
//!
//! Each step moves the last price by `volatility × N(0, 1)` of itself, widens the
//! running high/low and jitters volume. A walk that drops under one dollar restarts
//! from a fresh price in `[1.00, 2.00)` instead of being clamped.

mod seeder;
mod state;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

use crate::tick::{normalize_symbol, round_price, to_decimal, Tick};

pub use seeder::HistoricalSeeder;
pub use state::GeneratorStateStore;

const MIN_VOLUME: i64 = 1_000;
const VOLUME_JITTER: i64 = 5_000;
const MIN_PRICE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

#[derive(Debug, Error, PartialEq)]
pub enum GeneratorError {
    #[error("no generator state for symbol {0}; seed it first")]
    UnknownSymbol(String),
    #[error("symbol must not be empty")]
    EmptySymbol,
    #[error("volatility must be finite and non-negative, got {0}")]
    InvalidVolatility(f64),
    #[error("base price must be finite and round to at least 0.01, got {0}")]
    InvalidPrice(f64),
    #[error("price move of {0} is not representable")]
    Unrepresentable(f64),
}

pub struct PriceSeriesGenerator<R = StdRng> {
    state: GeneratorStateStore,
    rng: R,
    volatility: f64,
}

impl<R: Rng> PriceSeriesGenerator<R> {
    pub fn new(volatility: f64, rng: R) -> Result<Self, GeneratorError> {
        if !volatility.is_finite() || volatility < 0.0 {
            return Err(GeneratorError::InvalidVolatility(volatility));
        }
        Ok(Self {
            state: GeneratorStateStore::new(),
            rng,
            volatility,
        })
    }

    pub fn volatility(&self) -> f64 {
        self.volatility
    }

    pub fn state(&self) -> &GeneratorStateStore {
        &self.state
    }

    /// Creates (or restarts) `symbol` at `base_price` and returns the opening tick.
    pub fn seed(&mut self, symbol: &str, base_price: f64) -> Result<Tick, GeneratorError> {
        let symbol = normalize_symbol(symbol);
        if symbol.is_empty() {
            return Err(GeneratorError::EmptySymbol);
        }
        if !base_price.is_finite() || base_price <= 0.0 {
            return Err(GeneratorError::InvalidPrice(base_price));
        }

        let price = round_price(
            to_decimal(base_price).ok_or(GeneratorError::InvalidPrice(base_price))?,
        );
        if price < MIN_PRICE {
            return Err(GeneratorError::InvalidPrice(base_price));
        }
        let tick = Tick {
            symbol,
            price,
            open: price,
            high: round_price(price * Decimal::new(101, 2)),
            low: round_price(price * Decimal::new(99, 2)),
            close: price,
            volume: self.rng.gen_range(100_000..1_000_000),
            timestamp: Utc::now(),
            change_amount: Some(Decimal::ZERO),
            change_percent: Some(Decimal::ZERO),
            processed_timestamp: None,
            processing_latency: None,
        };

        self.state.put(tick.clone());
        Ok(tick)
    }

    /// Seeds every symbol at `initial_price × U[0.5, 1.5)`.
    pub fn seed_universe(
        &mut self,
        symbols: &[String],
        initial_price: f64,
    ) -> Result<Vec<Tick>, GeneratorError> {
        symbols
            .iter()
            .map(|symbol| {
                let base = initial_price * (0.5 + self.rng.gen::<f64>());
                self.seed(symbol, base)
            })
            .collect()
    }

    /// Advances an already seeded symbol by one random-walk step.
    pub fn step(&mut self, symbol: &str) -> Result<Tick, GeneratorError> {
        let symbol = normalize_symbol(symbol);
        let last = self
            .state
            .get(&symbol)
            .ok_or_else(|| GeneratorError::UnknownSymbol(symbol.clone()))?;

        let relative_change = self.volatility * self.rng.sample::<f64, _>(StandardNormal);
        let price = walk(last.price, relative_change, &mut self.rng)?;
        let volume = (last.volume as i64 + self.rng.gen_range(-VOLUME_JITTER..VOLUME_JITTER))
            .max(MIN_VOLUME) as u64;

        let tick = Tick {
            symbol: last.symbol.clone(),
            price,
            open: last.open,
            high: price.max(last.high),
            low: price.min(last.low),
            close: price,
            volume,
            timestamp: Utc::now().max(last.timestamp),
            change_amount: None,
            change_percent: None,
            processed_timestamp: None,
            processing_latency: None,
        };

        self.state.put(tick.clone());
        Ok(tick)
    }

    /// One cadence tick: every seeded symbol steps with probability `probability`.
    pub fn tick_active(&mut self, probability: f64) -> Vec<Tick> {
        let probability = probability.clamp(0.0, 1.0);
        let mut ticks = Vec::with_capacity(self.state.len());
        for symbol in self.state.symbols() {
            if !self.rng.gen_bool(probability) {
                continue;
            }
            match self.step(&symbol) {
                Ok(tick) => ticks.push(tick),
                Err(err) => crate::logging::warn(
                    "generator.step_failed",
                    "Skipping symbol for this tick",
                    serde_json::json!({ "symbol": symbol, "error": err.to_string() }),
                ),
            }
        }
        ticks
    }
}

/// Applies a relative move to `previous`, rounded to cents, restarting the walk
/// from `[1.00, 2.00)` when the result falls under one dollar.
pub(crate) fn walk<R: Rng + ?Sized>(
    previous: Decimal,
    relative_change: f64,
    rng: &mut R,
) -> Result<Decimal, GeneratorError> {
    let factor =
        to_decimal(relative_change).ok_or(GeneratorError::Unrepresentable(relative_change))?;
    let price = round_price(previous + previous * factor);
    if price < Decimal::ONE {
        return floor_reset(rng);
    }
    Ok(price)
}

fn floor_reset<R: Rng + ?Sized>(rng: &mut R) -> Result<Decimal, GeneratorError> {
    let sample = 1.0 + rng.gen::<f64>();
    let price = to_decimal(sample).ok_or(GeneratorError::Unrepresentable(sample))?;
    Ok(price.round_dp_with_strategy(2, RoundingStrategy::ToZero))
}
