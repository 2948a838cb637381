use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};

use crate::bus::Topic;
use crate::constants::{
    CONSUMER_WORKERS, DEFAULT_INITIAL_PRICE, DEFAULT_SYMBOLS, DEFAULT_VOLATILITY,
    FANOUT_CAPACITY, FANOUT_PREFIX, GATEWAY_BIND_ADDR, METRICS_RESET_MS, PROCESSED_TOPIC,
    RAW_TOPIC, TICK_INTERVAL_MS, TOPIC_CAPACITY, TOPIC_PARTITIONS, UPDATE_PROBABILITY,
};
use crate::enrichment::{self, EnrichmentProcessor};
use crate::fanout::FanOut;
use crate::gateway::{self, GatewayState};
use crate::generator::{HistoricalSeeder, PriceSeriesGenerator};
use crate::logging;
use crate::metrics::{self, MetricsAggregator};
use crate::store::{InMemoryTickStore, TickStore};
use crate::tick::normalize_symbol;

/// Base prices are drawn from half to one and a half times the initial price;
/// half of this still rounds to a cent.
const MIN_INITIAL_PRICE: f64 = 0.02;

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub symbols: Vec<String>,
    pub initial_price: f64,
    pub volatility: f64,
    pub tick_interval: Duration,
    pub update_probability: f64,
    pub partitions: usize,
    pub topic_capacity: usize,
    pub worker_count: usize,
    pub metrics_reset: Duration,
    pub history_days: u32,
    pub rng_seed: Option<u64>,
    pub max_ticks: Option<usize>,
    pub gateway_addr: SocketAddr,
    pub enable_gateway: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            symbols: DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect(),
            initial_price: DEFAULT_INITIAL_PRICE,
            volatility: DEFAULT_VOLATILITY,
            tick_interval: Duration::from_millis(TICK_INTERVAL_MS),
            update_probability: UPDATE_PROBABILITY,
            partitions: TOPIC_PARTITIONS,
            topic_capacity: TOPIC_CAPACITY,
            worker_count: CONSUMER_WORKERS,
            metrics_reset: Duration::from_millis(METRICS_RESET_MS),
            history_days: 0,
            rng_seed: None,
            max_ticks: None,
            gateway_addr: GATEWAY_BIND_ADDR
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 9001))),
            enable_gateway: true,
        }
    }
}

impl PipelineConfig {
    /// Upper-cases and de-duplicates symbols and rejects unusable settings.
    pub fn validated(mut self) -> Result<Self> {
        let mut symbols: Vec<String> = Vec::with_capacity(self.symbols.len());
        for raw in &self.symbols {
            let symbol = normalize_symbol(raw);
            if symbol.is_empty() {
                bail!("symbol list contains an empty entry");
            }
            if !symbols.contains(&symbol) {
                symbols.push(symbol);
            }
        }
        if symbols.is_empty() {
            bail!("at least one symbol must be configured");
        }
        if !(0.0..=1.0).contains(&self.update_probability) {
            bail!(
                "update probability must be within [0, 1], got {}",
                self.update_probability
            );
        }
        if !self.initial_price.is_finite() || self.initial_price < MIN_INITIAL_PRICE {
            bail!(
                "initial price must be at least {MIN_INITIAL_PRICE}, got {}",
                self.initial_price
            );
        }
        if !self.volatility.is_finite() || self.volatility < 0.0 {
            bail!(
                "volatility must be finite and non-negative, got {}",
                self.volatility
            );
        }
        if self.tick_interval.is_zero() || self.metrics_reset.is_zero() {
            bail!("tick interval and metrics reset period must be non-zero");
        }
        self.symbols = symbols;
        Ok(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownSignal {
    None,
    Graceful,
    Immediate,
}

/// Every shared component of a running pipeline.
#[derive(Clone)]
pub struct Pipeline {
    pub config: Arc<PipelineConfig>,
    pub raw: Topic,
    pub processed: Topic,
    pub store: Arc<InMemoryTickStore>,
    pub fanout: FanOut,
    pub metrics: Arc<MetricsAggregator>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let config = config.validated()?;
        Ok(Self {
            raw: Topic::new(RAW_TOPIC, config.partitions, config.topic_capacity),
            processed: Topic::new(PROCESSED_TOPIC, config.partitions, config.topic_capacity),
            store: Arc::new(InMemoryTickStore::new()),
            fanout: FanOut::new(FANOUT_PREFIX, FANOUT_CAPACITY),
            metrics: Arc::new(MetricsAggregator::new()),
            config: Arc::new(config),
        })
    }

    pub fn processor(&self) -> EnrichmentProcessor {
        EnrichmentProcessor::new(
            self.store.clone(),
            self.processed.clone(),
            self.fanout.clone(),
            Arc::clone(&self.metrics),
        )
    }

    pub fn gateway_state(&self) -> GatewayState {
        GatewayState {
            store: self.store.clone(),
            metrics: Arc::clone(&self.metrics),
            fanout: self.fanout.clone(),
            symbols: Arc::new(self.config.symbols.clone()),
        }
    }

    /// Runs generator, enrichment workers, the metrics reporter and (optionally)
    /// the gateway until a shutdown signal other than `None` is sent.
    pub async fn run(
        &self,
        shutdown_tx: watch::Sender<ShutdownSignal>,
        shutdown_rx: watch::Receiver<ShutdownSignal>,
    ) -> Result<()> {
        let mut master = match self.config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let generator = PriceSeriesGenerator::new(
            self.config.volatility,
            StdRng::seed_from_u64(master.gen()),
        )?;
        let seeder = HistoricalSeeder::new(
            self.config.volatility,
            self.config.initial_price,
            StdRng::seed_from_u64(master.gen()),
        )?;

        // consumers attach before anything is published
        let consumers = self.raw.subscribe();
        let processor = Arc::new(self.processor());

        let gateway_future = async {
            if self.config.enable_gateway {
                gateway::run_gateway(
                    self.config.gateway_addr,
                    self.gateway_state(),
                    shutdown_rx.clone(),
                )
                .await
            } else {
                Ok(())
            }
        };

        tokio::try_join!(
            enrichment::run_workers(
                processor,
                consumers,
                self.config.worker_count,
                shutdown_rx.clone()
            ),
            run_tick_generator(
                Arc::clone(&self.config),
                generator,
                seeder,
                self.raw.clone(),
                shutdown_tx,
                shutdown_rx.clone()
            ),
            metrics::run_reporter(
                Arc::clone(&self.metrics),
                self.config.metrics_reset,
                shutdown_rx.clone()
            ),
            gateway_future,
        )?;

        Ok(())
    }
}

pub async fn run(config: PipelineConfig) -> Result<()> {
    let pipeline = Pipeline::new(config)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownSignal::None);
    let signals_task = tokio::spawn(handle_signals(shutdown_tx.clone()));

    let run_result = pipeline.run(shutdown_tx, shutdown_rx).await;

    signals_task.abort();
    let _ = signals_task.await;
    run_result
}

async fn handle_signals(shutdown_tx: watch::Sender<ShutdownSignal>) -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            logging::info(
                "signal.received",
                "SIGTERM received, initiating graceful shutdown",
                json!({ "signal": "SIGTERM" })
            );
            let _ = shutdown_tx.send(ShutdownSignal::Graceful);
        }
        _ = sigint.recv() => {
            logging::warn(
                "signal.received",
                "SIGINT received, forcing immediate shutdown",
                json!({ "signal": "SIGINT" })
            );
            let _ = shutdown_tx.send(ShutdownSignal::Immediate);
        }
    }

    Ok(())
}

/// Publishes the backfill (if configured), seeds the live universe and then
/// steps it every `tick_interval`. Publish failures are logged by the bus and
/// never stop the loop.
async fn run_tick_generator(
    config: Arc<PipelineConfig>,
    mut generator: PriceSeriesGenerator,
    seeder: HistoricalSeeder,
    raw: Topic,
    shutdown_tx: watch::Sender<ShutdownSignal>,
    mut shutdown_rx: watch::Receiver<ShutdownSignal>,
) -> Result<()> {
    if config.history_days > 0 {
        publish_history(seeder, &config.symbols, config.history_days, &raw).await?;
    }

    let seeds = generator.seed_universe(&config.symbols, config.initial_price)?;
    for tick in &seeds {
        logging::info(
            "generator.seed",
            "Generated initial price",
            json!({ "symbol": tick.symbol, "price": tick.price.to_string() }),
        );
        let _ = raw.publish(&tick.symbol, tick).observe();
    }

    let mut ticker = time::interval(config.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut emitted_ticks: usize = seeds.len();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_rx.changed() => {
                match *shutdown_rx.borrow() {
                    ShutdownSignal::None => continue,
                    _ => break,
                }
            }
        }

        for tick in generator.tick_active(config.update_probability) {
            let _ = raw.publish(&tick.symbol, &tick).observe();
            emitted_ticks = emitted_ticks.saturating_add(1);
        }

        if let Some(max) = config.max_ticks {
            if emitted_ticks >= max {
                logging::info(
                    "generator.limit",
                    "Tick generator reached max tick budget",
                    json!({ "max_ticks": max }),
                );
                let _ = shutdown_tx.send(ShutdownSignal::Graceful);
                break;
            }
        }
    }

    logging::info_simple("generator.stop", "Tick generator stopped");
    Ok(())
}

/// Generates `days` of backdated minute ticks and publishes them to the raw
/// topic, pacing on partition backlog. Returns how many were accepted.
pub async fn publish_history(
    mut seeder: HistoricalSeeder,
    symbols: &[String],
    days: u32,
    raw: &Topic,
) -> Result<usize> {
    logging::info(
        "seeder.start",
        "Seeding historical data",
        json!({ "days": days, "symbols": symbols.len() }),
    );

    let ticks = seeder.generate(symbols, days, Utc::now())?;
    let per_day = HistoricalSeeder::<StdRng>::ticks_per_symbol(1) * symbols.len();
    let mut published = 0usize;

    for (index, tick) in ticks.iter().enumerate() {
        if raw.publish_paced(&tick.symbol, tick).await.observe().is_ok() {
            published += 1;
        }
        if per_day > 0 && (index + 1) % per_day == 0 {
            logging::info(
                "seeder.day_complete",
                "Completed seeding day",
                json!({ "day": (index + 1) / per_day, "days": days }),
            );
        }
    }

    logging::info(
        "seeder.finish",
        "Finished seeding historical data",
        json!({ "published": published }),
    );
    Ok(published)
}

/// Backfills `days` of history through a pipeline with no live generation and
/// returns once every accepted tick has been persisted (or `timeout` passes).
pub async fn backfill(config: PipelineConfig, days: u32, timeout: Duration) -> Result<Pipeline> {
    let pipeline = Pipeline::new(PipelineConfig {
        enable_gateway: false,
        ..config
    })?;
    let seed = pipeline.config.rng_seed;
    let seeder = HistoricalSeeder::new(
        pipeline.config.volatility,
        pipeline.config.initial_price,
        match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        },
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownSignal::None);
    let workers = tokio::spawn(enrichment::run_workers(
        Arc::new(pipeline.processor()),
        pipeline.raw.subscribe(),
        pipeline.config.worker_count,
        shutdown_rx,
    ));

    let published =
        publish_history(seeder, &pipeline.config.symbols, days, &pipeline.raw).await? as u64;

    let deadline = time::Instant::now() + timeout;
    while pipeline.store.count_all()? < published && time::Instant::now() < deadline {
        time::sleep(Duration::from_millis(10)).await;
    }
    let persisted = pipeline.store.count_all()?;
    if persisted < published {
        logging::warn(
            "seeder.timeout",
            "Backfill deadline passed before every tick was persisted",
            json!({ "published": published, "persisted": persisted }),
        );
    }

    let _ = shutdown_tx.send(ShutdownSignal::Graceful);
    workers.await??;
    Ok(pipeline)
}

pub mod testkit {
    use super::*;
    use crate::tick::Tick;

    /// Runs a gateway-less pipeline and returns the first `count` enriched ticks
    /// seen on the processed topic, across all partitions.
    pub async fn collect_processed(config: PipelineConfig, count: usize) -> Result<Vec<Tick>> {
        let pipeline = Pipeline::new(PipelineConfig {
            enable_gateway: false,
            max_ticks: None,
            ..config
        })?;
        let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownSignal::None);
        let (collected_tx, mut collected_rx) = tokio::sync::mpsc::unbounded_channel();

        let listeners: Vec<_> = pipeline
            .processed
            .subscribe()
            .into_iter()
            .map(|mut consumer| {
                let collected_tx = collected_tx.clone();
                tokio::spawn(async move {
                    while let Some(record) = consumer.recv().await {
                        let Ok(tick) = record.decode::<Tick>() else {
                            continue;
                        };
                        if collected_tx.send(tick).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();
        drop(collected_tx);

        let runner = {
            let pipeline = pipeline.clone();
            let shutdown_tx = shutdown_tx.clone();
            tokio::spawn(async move { pipeline.run(shutdown_tx, shutdown_rx).await })
        };

        let mut collected = Vec::with_capacity(count);
        while collected.len() < count {
            match collected_rx.recv().await {
                Some(tick) => collected.push(tick),
                None => break,
            }
        }

        let _ = shutdown_tx.send(ShutdownSignal::Graceful);
        runner.await??;
        for listener in listeners {
            listener.abort();
        }
        Ok(collected)
    }
}
