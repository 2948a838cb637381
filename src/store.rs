use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use crate::tick::Tick;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("tick store unavailable: {0}")]
    Unavailable(String),
}

/// Append-only time-series storage for enriched ticks.
pub trait TickStore: Send + Sync {
    fn append(&self, tick: Tick) -> Result<(), StoreError>;

    /// Latest row for `symbol` by timestamp.
    fn most_recent_by_symbol(&self, symbol: &str) -> Result<Option<Tick>, StoreError>;

    /// Rows with `from <= timestamp <= to`, ascending by timestamp.
    fn range_by_symbol(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Tick>, StoreError>;

    fn count_all(&self) -> Result<u64, StoreError>;

    fn symbols(&self) -> Result<Vec<String>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryTickStore {
    rows: RwLock<HashMap<String, Vec<Tick>>>,
    total: AtomicU64,
}

impl InMemoryTickStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Vec<Tick>>>, StoreError> {
        self.rows
            .read()
            .map_err(|_| StoreError::Unavailable("tick store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Vec<Tick>>>, StoreError> {
        self.rows
            .write()
            .map_err(|_| StoreError::Unavailable("tick store lock poisoned".into()))
    }
}

impl TickStore for InMemoryTickStore {
    fn append(&self, tick: Tick) -> Result<(), StoreError> {
        let mut rows = self.write()?;
        let series = rows.entry(tick.symbol.clone()).or_default();
        // backfilled rows arrive older than live ones; keep each series sorted
        let position = series.partition_point(|row| row.timestamp <= tick.timestamp);
        series.insert(position, tick);
        self.total.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn most_recent_by_symbol(&self, symbol: &str) -> Result<Option<Tick>, StoreError> {
        Ok(self
            .read()?
            .get(symbol)
            .and_then(|series| series.last().cloned()))
    }

    fn range_by_symbol(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Tick>, StoreError> {
        let rows = self.read()?;
        let Some(series) = rows.get(symbol) else {
            return Ok(Vec::new());
        };
        let start = series.partition_point(|row| row.timestamp < from);
        let end = series.partition_point(|row| row.timestamp <= to);
        Ok(series
            .get(start..end.max(start))
            .map(<[Tick]>::to_vec)
            .unwrap_or_default())
    }

    fn count_all(&self) -> Result<u64, StoreError> {
        Ok(self.total.load(Ordering::Relaxed))
    }

    fn symbols(&self) -> Result<Vec<String>, StoreError> {
        let mut symbols: Vec<String> = self.read()?.keys().cloned().collect();
        symbols.sort();
        Ok(symbols)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub bucket_start: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
}

/// Groups ascending ticks into epoch-aligned buckets of width `bucket`:
/// first/max/min/last price and summed volume per bucket.
pub fn candles(ticks: &[Tick], bucket: Duration) -> Vec<Candle> {
    let width = bucket.num_milliseconds().max(1);
    let mut out: Vec<Candle> = Vec::new();

    for tick in ticks {
        let millis = tick.timestamp.timestamp_millis();
        let start_ms = millis.div_euclid(width) * width;
        let Some(bucket_start) = Utc.timestamp_millis_opt(start_ms).single() else {
            continue;
        };

        match out.last_mut() {
            Some(candle) if candle.bucket_start == bucket_start => {
                candle.high = candle.high.max(tick.price);
                candle.low = candle.low.min(tick.price);
                candle.close = tick.price;
                candle.volume = candle.volume.saturating_add(tick.volume);
            }
            _ => out.push(Candle {
                bucket_start,
                open: tick.price,
                high: tick.price,
                low: tick.price,
                close: tick.price,
                volume: tick.volume,
            }),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick_at(symbol: &str, minute: i64, cents: i64) -> Tick {
        let price = Decimal::new(cents, 2);
        Tick {
            symbol: symbol.into(),
            price,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 1_000,
            timestamp: Utc.timestamp_opt(1_699_999_800 + minute * 60, 0).unwrap(),
            change_amount: None,
            change_percent: None,
            processed_timestamp: None,
            processing_latency: None,
        }
    }

    #[test]
    fn out_of_order_appends_are_kept_sorted() {
        let store = InMemoryTickStore::new();
        store.append(tick_at("AAPL", 5, 10_500)).unwrap();
        store.append(tick_at("AAPL", 1, 10_100)).unwrap();
        store.append(tick_at("AAPL", 3, 10_300)).unwrap();

        let latest = store.most_recent_by_symbol("AAPL").unwrap().unwrap();
        assert_eq!(latest.price, Decimal::new(10_500, 2));

        let all = store
            .range_by_symbol(
                "AAPL",
                Utc.timestamp_opt(0, 0).unwrap(),
                Utc.timestamp_opt(2_000_000_000, 0).unwrap(),
            )
            .unwrap();
        let prices: Vec<_> = all.iter().map(|t| t.price).collect();
        assert_eq!(
            prices,
            vec![
                Decimal::new(10_100, 2),
                Decimal::new(10_300, 2),
                Decimal::new(10_500, 2)
            ]
        );
        assert_eq!(store.count_all().unwrap(), 3);
    }

    #[test]
    fn range_is_inclusive_and_symbol_scoped() {
        let store = InMemoryTickStore::new();
        for minute in 0..10 {
            store.append(tick_at("MSFT", minute, 30_000 + minute)).unwrap();
        }
        store.append(tick_at("AAPL", 4, 15_000)).unwrap();

        let from = tick_at("MSFT", 2, 0).timestamp;
        let to = tick_at("MSFT", 5, 0).timestamp;
        let window = store.range_by_symbol("MSFT", from, to).unwrap();
        assert_eq!(window.len(), 4);
        assert!(window.iter().all(|t| t.symbol == "MSFT"));
        assert!(store.range_by_symbol("NONE", from, to).unwrap().is_empty());
        assert!(store.most_recent_by_symbol("NONE").unwrap().is_none());
        assert_eq!(store.symbols().unwrap(), vec!["AAPL", "MSFT"]);
    }

    #[test]
    fn candles_bucket_by_interval() {
        let ticks: Vec<Tick> = [(0, 100), (1, 120), (2, 90), (5, 200), (6, 210)]
            .iter()
            .map(|(minute, cents)| tick_at("AAPL", *minute, *cents))
            .collect();
        let bars = candles(&ticks, Duration::minutes(5));
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].open, Decimal::new(100, 2));
        assert_eq!(bars[0].high, Decimal::new(120, 2));
        assert_eq!(bars[0].low, Decimal::new(90, 2));
        assert_eq!(bars[0].close, Decimal::new(90, 2));
        assert_eq!(bars[0].volume, 3_000);
        assert_eq!(bars[1].volume, 2_000);
        assert_eq!(bars.last().unwrap().close, Decimal::new(210, 2));
    }
}
