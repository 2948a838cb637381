pub const TICK_INTERVAL_MS: u64 = 200;
pub const UPDATE_PROBABILITY: f64 = 0.7;
pub const DEFAULT_VOLATILITY: f64 = 0.002;
pub const DEFAULT_INITIAL_PRICE: f64 = 100.0;
pub const HISTORY_VOLATILITY_MULTIPLIER: f64 = 5.0;

pub const RAW_TOPIC: &str = "stock-prices";
pub const PROCESSED_TOPIC: &str = "processed-stock-prices";
pub const TOPIC_PARTITIONS: usize = 3;
pub const TOPIC_CAPACITY: usize = 4096;
pub const CONSUMER_WORKERS: usize = 3;

pub const FANOUT_PREFIX: &str = "/topic";
pub const FANOUT_CAPACITY: usize = 1024;

pub const METRICS_RESET_MS: u64 = 1_000;
pub const LATENCY_SAMPLE_CAPACITY: usize = 1_000;
pub const LATENCY_SAMPLE_LOW_WATERMARK: usize = 500;
pub const FAST_LATENCY_THRESHOLD_MS: f64 = 50.0;

pub const GATEWAY_BIND_ADDR: &str = "127.0.0.1:9001";

pub const DEFAULT_SYMBOLS: [&str; 10] = [
    "AAPL", "MSFT", "GOOGL", "AMZN", "META", "TSLA", "NVDA", "JPM", "V", "WMT",
];
