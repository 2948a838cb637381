use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Result;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::constants::{
    FAST_LATENCY_THRESHOLD_MS, LATENCY_SAMPLE_CAPACITY, LATENCY_SAMPLE_LOW_WATERMARK,
};
use crate::logging;
use crate::pipeline::ShutdownSignal;
use crate::store::{StoreError, TickStore};

/// Read surface returned by [`MetricsAggregator::snapshot`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    pub total_data_points: u64,
    pub average_query_time_ms: f64,
    pub average_latency_ms: f64,
    pub sub_fifty_ms_percentage: f64,
    pub active_subscriber_count: usize,
    pub messages_per_second: u64,
    pub cpu_usage_percent: f64,
    pub memory_usage_mb: f64,
}

/// Throughput counters and a bounded window of processing latencies.
///
/// Writers never wait on readers for long: counters are sharded atomics and the
/// sample buffer is held only for a push. A snapshot is not atomic across the two.
pub struct MetricsAggregator {
    counters: DashMap<String, AtomicU64>,
    samples: Mutex<VecDeque<f64>>,
    capacity: usize,
    low_watermark: usize,
    last_window: AtomicU64,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::with_bounds(LATENCY_SAMPLE_CAPACITY, LATENCY_SAMPLE_LOW_WATERMARK)
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bounds(capacity: usize, low_watermark: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            counters: DashMap::new(),
            samples: Mutex::new(VecDeque::with_capacity(capacity + 1)),
            capacity,
            low_watermark: low_watermark.min(capacity),
            last_window: AtomicU64::new(0),
        }
    }

    fn samples(&self) -> MutexGuard<'_, VecDeque<f64>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_latency(&self, symbol: &str, latency_ms: f64) {
        match self.counters.get(symbol) {
            Some(counter) => {
                counter.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.counters
                    .entry(symbol.to_string())
                    .or_default()
                    .fetch_add(1, Ordering::Relaxed);
            }
        }

        let mut samples = self.samples();
        samples.push_back(latency_ms);
        if samples.len() > self.capacity {
            let excess = samples.len() - self.low_watermark;
            samples.drain(..excess);
        }
    }

    /// Zeroes every counter and returns how many messages they held in total.
    /// The total is also kept as the last completed window for snapshots.
    pub fn reset_counters(&self) -> u64 {
        let drained = self
            .counters
            .iter()
            .map(|counter| counter.swap(0, Ordering::AcqRel))
            .sum();
        self.last_window.store(drained, Ordering::Release);
        drained
    }

    pub fn message_count(&self, symbol: &str) -> u64 {
        self.counters
            .get(symbol)
            .map(|counter| counter.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Messages counted since the last reset, across symbols.
    pub fn pending_messages(&self) -> u64 {
        self.counters
            .iter()
            .map(|counter| counter.load(Ordering::Acquire))
            .sum()
    }

    pub fn messages_last_window(&self) -> u64 {
        self.last_window.load(Ordering::Acquire)
    }

    pub fn sample_count(&self) -> usize {
        self.samples().len()
    }

    pub fn average_latency_ms(&self) -> f64 {
        let samples = self.samples();
        if samples.is_empty() {
            return 0.0;
        }
        samples.iter().sum::<f64>() / samples.len() as f64
    }

    pub fn sub_fifty_ms_percentage(&self) -> f64 {
        let samples = self.samples();
        if samples.is_empty() {
            return 0.0;
        }
        let fast = samples
            .iter()
            .filter(|latency| **latency < FAST_LATENCY_THRESHOLD_MS)
            .count();
        fast as f64 / samples.len() as f64 * 100.0
    }

    /// Builds the read surface. `probe_symbol` is looked up once against the
    /// store to time a representative query.
    pub fn snapshot(
        &self,
        store: &dyn TickStore,
        active_subscribers: usize,
        probe_symbol: Option<&str>,
    ) -> Result<SystemMetrics, StoreError> {
        let average_query_time_ms = match probe_symbol {
            Some(symbol) => {
                let started = Instant::now();
                store.most_recent_by_symbol(symbol)?;
                started.elapsed().as_secs_f64() * 1_000.0
            }
            None => 0.0,
        };
        let (cpu_usage_percent, memory_usage_mb) = host_gauges();

        Ok(SystemMetrics {
            total_data_points: store.count_all()?,
            average_query_time_ms,
            average_latency_ms: self.average_latency_ms(),
            sub_fifty_ms_percentage: self.sub_fifty_ms_percentage(),
            active_subscriber_count: active_subscribers,
            messages_per_second: self.messages_last_window(),
            cpu_usage_percent,
            memory_usage_mb,
        })
    }
}

/// Load average ×10 and resident memory in MiB, read from procfs. Zero where
/// procfs is missing.
fn host_gauges() -> (f64, f64) {
    let cpu = std::fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|raw| raw.split_whitespace().next()?.parse::<f64>().ok())
        .map(|load| load * 10.0)
        .unwrap_or(0.0);

    let memory = std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|raw| raw.split_whitespace().nth(1)?.parse::<f64>().ok())
        .map(|pages| pages * 4096.0 / (1024.0 * 1024.0))
        .unwrap_or(0.0);

    (cpu, memory)
}

/// Resets the counters every `period` and logs the drained window.
pub async fn run_reporter(
    metrics: Arc<MetricsAggregator>,
    period: Duration,
    mut shutdown: watch::Receiver<ShutdownSignal>,
) -> Result<()> {
    let mut reporter = interval(period);
    reporter.set_missed_tick_behavior(MissedTickBehavior::Skip);
    reporter.reset();

    loop {
        tokio::select! {
            _ = reporter.tick() => {
                let messages = metrics.reset_counters();
                if messages > 0 {
                    logging::info(
                        "metrics.throughput",
                        "tick throughput summary",
                        json!({
                            "messages": messages,
                            "window_ms": period.as_millis() as u64,
                            "average_latency_ms": metrics.average_latency_ms(),
                            "sub_fifty_ms_percentage": metrics.sub_fifty_ms_percentage(),
                            "retained_samples": metrics.sample_count(),
                        }),
                    );
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || !matches!(*shutdown.borrow(), ShutdownSignal::None) {
                    break;
                }
            }
        }
    }

    logging::info_simple("metrics.stop", "Metrics reporter stopped");
    Ok(())
}
