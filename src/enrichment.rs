//! Raw tick → enriched tick.
//!
//! For every consumed record the processor looks up the symbol's last persisted
//! tick, derives the change against it, appends the enriched row, republishes it
//! on the processed topic, pushes it to fan-out subscribers and reports the
//! processing latency. Any failure drops that one tick after logging it.
//!
//! The lookup and the append are not one transaction: two workers enriching the
//! same symbol at once can both compute against the same previous price. Records
//! for a symbol share a partition and each partition is drained in order, which
//! keeps that from happening inside one pipeline.

use std::sync::Arc;

use anyhow::Result;
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::json;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};

use crate::bus::{BusError, PartitionConsumer, Record, Topic};
use crate::fanout::FanOut;
use crate::logging;
use crate::metrics::MetricsAggregator;
use crate::pipeline::ShutdownSignal;
use crate::store::{StoreError, TickStore};
use crate::tick::Tick;

#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("failed to decode record at partition {partition} offset {offset}: {source}")]
    Decode {
        partition: usize,
        offset: u64,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Publish(#[from] BusError),
}

/// Millisecond wall clock, swappable in tests.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// `(current − previous, that change as a percentage of previous)`; the
/// percentage is rounded to four places and zero when `previous` is not positive.
pub fn price_change(previous: Decimal, current: Decimal) -> (Decimal, Decimal) {
    let amount = current - previous;
    let percent = if previous > Decimal::ZERO {
        (amount / previous * Decimal::ONE_HUNDRED)
            .round_dp_with_strategy(4, RoundingStrategy::MidpointAwayFromZero)
    } else {
        Decimal::ZERO
    };
    (amount, percent)
}

pub struct EnrichmentProcessor {
    store: Arc<dyn TickStore>,
    processed: Topic,
    fanout: FanOut,
    metrics: Arc<MetricsAggregator>,
    clock: Arc<dyn Clock>,
}

impl EnrichmentProcessor {
    pub fn new(
        store: Arc<dyn TickStore>,
        processed: Topic,
        fanout: FanOut,
        metrics: Arc<MetricsAggregator>,
    ) -> Self {
        Self::with_clock(store, processed, fanout, metrics, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn TickStore>,
        processed: Topic,
        fanout: FanOut,
        metrics: Arc<MetricsAggregator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            processed,
            fanout,
            metrics,
            clock,
        }
    }

    pub fn process(&self, mut tick: Tick) -> Result<Tick, EnrichmentError> {
        let ingest_ms = self.clock.now_ms();

        let (amount, percent) = match self.store.most_recent_by_symbol(&tick.symbol)? {
            Some(previous) => price_change(previous.price, tick.price),
            None => (Decimal::ZERO, Decimal::ZERO),
        };
        tick.change_amount = Some(amount);
        tick.change_percent = Some(percent);

        self.store.append(tick.clone())?;

        let processed_ms = self.clock.now_ms().max(ingest_ms);
        tick.processed_timestamp = Some(processed_ms);
        tick.processing_latency = Some(processed_ms - ingest_ms);

        self.processed.publish(&tick.symbol, &tick).observe()?;
        self.fanout.forward(&tick);
        self.metrics
            .record_latency(&tick.symbol, (processed_ms - ingest_ms) as f64);

        Ok(tick)
    }

    /// Decodes and processes one record, logging the outcome. Failed ticks are
    /// dropped; nothing is retried.
    pub fn handle(&self, record: &Record) -> Option<Tick> {
        let outcome = record
            .decode::<Tick>()
            .map_err(|source| EnrichmentError::Decode {
                partition: record.partition,
                offset: record.offset,
                source,
            })
            .and_then(|tick| self.process(tick));

        match outcome {
            Ok(tick) => {
                logging::info(
                    "enrichment.processed",
                    "Processed stock price",
                    json!({
                        "symbol": tick.symbol,
                        "latency_ms": tick.processing_latency,
                        "partition": record.partition,
                        "offset": record.offset,
                    }),
                );
                Some(tick)
            }
            Err(err) => {
                logging::error(
                    "enrichment.failed",
                    "Dropping tick after processing error",
                    json!({
                        "symbol": record.key,
                        "partition": record.partition,
                        "offset": record.offset,
                        "error": err.to_string(),
                    }),
                );
                None
            }
        }
    }
}

/// Drains every partition on its own task, at most `worker_count` records being
/// enriched at any moment. Each partition is handled strictly in order.
pub async fn run_workers(
    processor: Arc<EnrichmentProcessor>,
    consumers: Vec<PartitionConsumer>,
    worker_count: usize,
    shutdown: watch::Receiver<ShutdownSignal>,
) -> Result<()> {
    let permits = Arc::new(Semaphore::new(worker_count.max(1)));
    logging::info(
        "enrichment.start",
        "Enrichment workers started",
        json!({ "partitions": consumers.len(), "workers": worker_count.max(1) }),
    );

    let handles: Vec<_> = consumers
        .into_iter()
        .map(|consumer| {
            tokio::spawn(drain_partition(
                Arc::clone(&processor),
                consumer,
                Arc::clone(&permits),
                shutdown.clone(),
            ))
        })
        .collect();

    for handle in handles {
        handle.await??;
    }

    logging::info_simple("enrichment.stop", "Enrichment workers stopped");
    Ok(())
}

async fn drain_partition(
    processor: Arc<EnrichmentProcessor>,
    mut consumer: PartitionConsumer,
    permits: Arc<Semaphore>,
    mut shutdown: watch::Receiver<ShutdownSignal>,
) -> Result<()> {
    loop {
        tokio::select! {
            maybe_record = consumer.recv() => {
                let Some(record) = maybe_record else {
                    break;
                };
                let _permit = permits.acquire().await?;
                processor.handle(&record);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || !matches!(*shutdown.borrow(), ShutdownSignal::None) {
                    break;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryTickStore;
    use chrono::Utc;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct SteppingClock {
        now: AtomicI64,
        step: i64,
    }

    impl Clock for SteppingClock {
        fn now_ms(&self) -> i64 {
            self.now.fetch_add(self.step, Ordering::SeqCst)
        }
    }

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("decimal")
    }

    fn raw(symbol: &str, price: &str) -> Tick {
        let price = dec(price);
        Tick {
            symbol: symbol.into(),
            price,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 10_000,
            timestamp: Utc::now(),
            change_amount: None,
            change_percent: None,
            processed_timestamp: None,
            processing_latency: None,
        }
    }

    fn processor(clock: Arc<dyn Clock>) -> (EnrichmentProcessor, Arc<InMemoryTickStore>) {
        let store = Arc::new(InMemoryTickStore::new());
        let processor = EnrichmentProcessor::with_clock(
            store.clone(),
            Topic::new("processed", 1, 16),
            FanOut::new("/topic", 16),
            Arc::new(MetricsAggregator::new()),
            clock,
        );
        (processor, store)
    }

    #[test]
    fn price_change_matches_reference_values() {
        assert_eq!(
            price_change(dec("100.00"), dec("101.50")),
            (dec("1.50"), dec("1.5000"))
        );
        assert_eq!(
            price_change(dec("3.00"), dec("2.00")),
            (dec("-1.00"), dec("-33.3333"))
        );
        assert_eq!(
            price_change(Decimal::ZERO, dec("5.00")),
            (dec("5.00"), Decimal::ZERO)
        );
    }

    #[test]
    fn first_tick_for_a_symbol_has_zero_change() {
        let (processor, store) = processor(Arc::new(SystemClock));
        let enriched = processor.process(raw("AAPL", "150.00")).expect("process");
        assert_eq!(enriched.change_amount, Some(Decimal::ZERO));
        assert_eq!(enriched.change_percent, Some(Decimal::ZERO));
        assert_eq!(store.count_all().expect("count"), 1);
    }

    #[test]
    fn follow_up_tick_is_measured_against_the_stored_price() {
        let (processor, _store) = processor(Arc::new(SystemClock));
        processor.process(raw("AAPL", "100.00")).expect("first");
        let enriched = processor.process(raw("AAPL", "101.50")).expect("second");
        assert_eq!(enriched.change_amount, Some(dec("1.50")));
        assert_eq!(enriched.change_percent, Some(dec("1.50")));
    }

    #[test]
    fn latency_is_processed_minus_ingest() {
        let clock = Arc::new(SteppingClock {
            now: AtomicI64::new(1_000),
            step: 7,
        });
        let (processor, _store) = processor(clock);
        let enriched = processor.process(raw("MSFT", "300.00")).expect("process");
        assert_eq!(enriched.processed_timestamp, Some(1_007));
        assert_eq!(enriched.processing_latency, Some(7));
        assert!(enriched.is_enriched());
    }

    #[test]
    fn closed_processed_topic_drops_the_tick_before_fan_out() {
        let store = Arc::new(InMemoryTickStore::new());
        let processed = Topic::new("processed", 1, 16);
        let fanout = FanOut::new("/topic", 16);
        let metrics = Arc::new(MetricsAggregator::new());
        let processor = EnrichmentProcessor::new(
            store.clone(),
            processed.clone(),
            fanout.clone(),
            metrics.clone(),
        );
        processed.close();

        let err = processor
            .process(raw("AAPL", "10.00"))
            .expect_err("publish must fail");
        assert!(matches!(err, EnrichmentError::Publish(BusError::Closed { .. })));
        assert_eq!(processed.failed_publishes(), 1);
        assert_eq!(metrics.message_count("AAPL"), 0);
    }

    #[test]
    fn undecodable_record_is_dropped() {
        let (processor, store) = processor(Arc::new(SystemClock));
        let record = Record {
            key: "AAPL".into(),
            partition: 0,
            offset: 0,
            payload: "{\"symbol\":\"AAPL\"}".into(),
        };
        assert!(processor.handle(&record).is_none());
        assert_eq!(store.count_all().expect("count"), 0);
    }
}
