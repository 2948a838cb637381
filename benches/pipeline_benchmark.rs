use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rust_tick_stream::{
    bus::Topic,
    constants::DEFAULT_SYMBOLS,
    enrichment::EnrichmentProcessor,
    fanout::FanOut,
    generator::PriceSeriesGenerator,
    logging,
    metrics::MetricsAggregator,
    pipeline::{self, PipelineConfig},
    store::InMemoryTickStore,
};
use tokio::runtime::Runtime;

fn symbols() -> Vec<String> {
    DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect()
}

fn bench_generation(c: &mut Criterion) {
    logging::set_silent(true);
    let mut group = c.benchmark_group("generation");
    group.throughput(Throughput::Elements(DEFAULT_SYMBOLS.len() as u64));

    group.bench_function("tick_active", |b| {
        let mut generator =
            PriceSeriesGenerator::new(0.002, StdRng::seed_from_u64(1)).expect("generator");
        generator
            .seed_universe(&symbols(), 100.0)
            .expect("seed universe");
        b.iter(|| generator.tick_active(1.0));
    });

    group.finish();
}

fn bench_enrichment(c: &mut Criterion) {
    logging::set_silent(true);
    let mut group = c.benchmark_group("enrichment");
    group.throughput(Throughput::Elements(DEFAULT_SYMBOLS.len() as u64));

    group.bench_function("process", |b| {
        let mut generator =
            PriceSeriesGenerator::new(0.002, StdRng::seed_from_u64(2)).expect("generator");
        generator
            .seed_universe(&symbols(), 100.0)
            .expect("seed universe");
        let processor = EnrichmentProcessor::new(
            Arc::new(InMemoryTickStore::new()),
            Topic::new("processed", 3, 1024),
            FanOut::new("/topic", 1024),
            Arc::new(MetricsAggregator::new()),
        );
        b.iter_batched(
            || generator.tick_active(1.0),
            |ticks| {
                for tick in ticks {
                    processor.process(tick).expect("process");
                }
            },
            BatchSize::SmallInput,
        );
    });

    group.bench_function("record_latency", |b| {
        let metrics = MetricsAggregator::new();
        b.iter(|| metrics.record_latency("AAPL", 3.0));
    });

    group.finish();
}

fn bench_backfill(c: &mut Criterion) {
    logging::set_silent(true);
    let rt = Runtime::new().expect("failed to create Tokio runtime");
    let mut group = c.benchmark_group("backfill");
    group.sample_size(10);
    group.throughput(Throughput::Elements((DEFAULT_SYMBOLS.len() * 480) as u64));

    group.bench_function("one_day", |b| {
        b.iter(|| {
            rt.block_on(pipeline::backfill(
                PipelineConfig {
                    rng_seed: Some(7),
                    ..PipelineConfig::default()
                },
                1,
                Duration::from_secs(60),
            ))
            .expect("backfill")
        });
    });

    group.finish();
}

criterion_group!(benches, bench_generation, bench_enrichment, bench_backfill);
criterion_main!(benches);
