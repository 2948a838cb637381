use std::collections::HashMap;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_tick_stream::logging;
use rust_tick_stream::pipeline::{self, PipelineConfig};
use rust_tick_stream::store::TickStore;
use rust_tick_stream::tick::Tick;

fn quiet_config() -> PipelineConfig {
    logging::set_silent(true);
    PipelineConfig {
        symbols: vec!["aapl".into(), "MSFT".into(), "tsla".into()],
        tick_interval: Duration::from_millis(5),
        update_probability: 1.0,
        rng_seed: Some(17),
        enable_gateway: false,
        ..PipelineConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn processed_stream_carries_enriched_ticks() {
    let ticks = pipeline::testkit::collect_processed(quiet_config(), 48)
        .await
        .expect("collect processed ticks");

    assert!(ticks.len() >= 48, "expected at least 48 processed ticks");

    let mut by_symbol: HashMap<String, Vec<Tick>> = HashMap::new();
    for tick in ticks {
        assert!(tick.is_enriched(), "tick missing enrichment: {tick:?}");
        assert!(tick.price >= Decimal::ONE, "price fell below the floor");
        assert!(tick.low <= tick.price && tick.price <= tick.high);
        assert!(tick.processing_latency.unwrap_or(-1) >= 0);
        assert!(tick.processed_timestamp.unwrap_or(0) >= tick.timestamp.timestamp_millis());
        by_symbol.entry(tick.symbol.clone()).or_default().push(tick);
    }

    assert_eq!(by_symbol.len(), 3, "every symbol should be processed");
    for (symbol, series) in &by_symbol {
        assert!(
            ["AAPL", "MSFT", "TSLA"].contains(&symbol.as_str()),
            "unexpected symbol {symbol}"
        );
        assert_eq!(series[0].change_amount, Some(Decimal::ZERO));
        assert_eq!(series[0].change_percent, Some(Decimal::ZERO));
        for pair in series.windows(2) {
            assert!(pair[1].timestamp >= pair[0].timestamp);
            assert_eq!(pair[1].change_amount, Some(pair[1].price - pair[0].price));
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backfill_persists_every_history_tick() {
    let pipeline = pipeline::backfill(quiet_config(), 1, Duration::from_secs(30))
        .await
        .expect("backfill");

    assert_eq!(pipeline.store.count_all().expect("count"), 3 * 480);
    let mut symbols = pipeline.store.symbols().expect("symbols");
    symbols.sort();
    assert_eq!(symbols, vec!["AAPL", "MSFT", "TSLA"]);
    assert_eq!(pipeline.raw.failed_publishes(), 0);
}

#[test]
fn unusable_price_settings_are_rejected() {
    let rejected = [
        (0.01, 0.002),
        (f64::NAN, 0.002),
        (100.0, -0.1),
        (100.0, f64::INFINITY),
    ];
    for (initial_price, volatility) in rejected {
        let config = PipelineConfig {
            initial_price,
            volatility,
            ..PipelineConfig::default()
        };
        assert!(
            config.validated().is_err(),
            "accepted initial_price={initial_price} volatility={volatility}"
        );
    }
    assert!(PipelineConfig {
        initial_price: 0.02,
        ..PipelineConfig::default()
    }
    .validated()
    .is_ok());
}

#[test]
fn empty_symbol_universe_is_rejected() {
    let config = PipelineConfig {
        symbols: vec!["  ".into()],
        ..PipelineConfig::default()
    };
    assert!(pipeline::Pipeline::new(config).is_err());
}
