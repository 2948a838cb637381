pub mod bus;
pub mod chart;
pub mod cli;
pub mod constants;
pub mod enrichment;
pub mod fanout;
pub mod gateway;
pub mod generator;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod seed;
pub mod store;
pub mod tick;
