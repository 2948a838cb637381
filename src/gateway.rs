use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::fanout::FanOut;
use crate::logging;
use crate::metrics::{MetricsAggregator, SystemMetrics};
use crate::pipeline::ShutdownSignal;
use crate::store::{candles, Candle, StoreError, TickStore};
use crate::tick::{normalize_symbol, Tick};

const DEFAULT_HISTORY_LIMIT: usize = 100;
const DEFAULT_CANDLE_INTERVAL_MINUTES: i64 = 5;

#[derive(Clone)]
pub struct GatewayState {
    pub store: Arc<dyn TickStore>,
    pub metrics: Arc<MetricsAggregator>,
    pub fanout: FanOut,
    pub symbols: Arc<Vec<String>>,
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("no price data found for symbol {0}")]
    NoData(String),
    #[error("invalid interval {0:?}")]
    InvalidInterval(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        let status = match &self {
            QueryError::NoData(_) => StatusCode::NOT_FOUND,
            QueryError::InvalidInterval(_) => StatusCode::BAD_REQUEST,
            QueryError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CandleParams {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub interval: Option<String>,
}

/// Parses `<n>m`, `<n>h` or `<n>d`. Empty input means five minutes, and so
/// does an unknown unit; a malformed count is rejected.
pub fn parse_interval(raw: &str) -> Result<Duration, QueryError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Duration::minutes(DEFAULT_CANDLE_INTERVAL_MINUTES));
    }
    let split = raw.len() - raw.chars().last().map(char::len_utf8).unwrap_or(0);
    let (amount, unit) = raw.split_at(split);
    let amount: i64 = amount
        .parse()
        .ok()
        .filter(|amount| *amount > 0)
        .ok_or_else(|| QueryError::InvalidInterval(raw.to_string()))?;

    Ok(match unit {
        "m" => Duration::minutes(amount),
        "h" => Duration::hours(amount),
        "d" => Duration::days(amount),
        _ => Duration::minutes(DEFAULT_CANDLE_INTERVAL_MINUTES),
    })
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/topic/stock/:symbol", get(subscribe_symbol))
        .route("/api/stock-prices/symbols", get(list_symbols))
        .route("/api/stock-prices/metrics", get(system_metrics))
        .route("/api/stock-prices/:symbol/latest", get(latest_price))
        .route("/api/stock-prices/:symbol/history", get(price_history))
        .route("/api/stock-prices/:symbol/candles", get(price_candles))
        .with_state(state)
}

pub async fn run_gateway(
    addr: SocketAddr,
    state: GatewayState,
    mut shutdown: watch::Receiver<ShutdownSignal>,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind gateway at {addr}"))?;

    logging::info(
        "gateway.bind",
        "Gateway listening for clients",
        json!({ "addr": addr.to_string() }),
    );

    let shutdown_signal = async move {
        while shutdown.changed().await.is_ok() {
            if !matches!(*shutdown.borrow(), ShutdownSignal::None) {
                break;
            }
        }
    };

    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("gateway server terminated with error")?;

    logging::info_simple("gateway.server.stop", "Gateway server stopped");
    Ok(())
}

async fn list_symbols(State(state): State<GatewayState>) -> Json<Vec<String>> {
    Json(state.symbols.as_ref().clone())
}

async fn system_metrics(
    State(state): State<GatewayState>,
) -> Result<Json<SystemMetrics>, QueryError> {
    let probe = state.symbols.first().map(String::as_str);
    let snapshot =
        state
            .metrics
            .snapshot(state.store.as_ref(), state.fanout.active_subscribers(), probe)?;
    Ok(Json(snapshot))
}

async fn latest_price(
    State(state): State<GatewayState>,
    Path(symbol): Path<String>,
) -> Result<Json<Tick>, QueryError> {
    let symbol = normalize_symbol(&symbol);
    state
        .store
        .most_recent_by_symbol(&symbol)?
        .map(Json)
        .ok_or(QueryError::NoData(symbol))
}

async fn price_history(
    State(state): State<GatewayState>,
    Path(symbol): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<Tick>>, QueryError> {
    let symbol = normalize_symbol(&symbol);
    require_known(&state, &symbol)?;

    let to = params.to.unwrap_or_else(Utc::now);
    let from = params.from.unwrap_or(to - Duration::hours(24));
    let mut ticks = state.store.range_by_symbol(&symbol, from, to)?;
    ticks.truncate(params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT));
    Ok(Json(ticks))
}

async fn price_candles(
    State(state): State<GatewayState>,
    Path(symbol): Path<String>,
    Query(params): Query<CandleParams>,
) -> Result<Json<Vec<Candle>>, QueryError> {
    let symbol = normalize_symbol(&symbol);
    require_known(&state, &symbol)?;

    let bucket = parse_interval(params.interval.as_deref().unwrap_or_default())?;
    let to = params.to.unwrap_or_else(Utc::now);
    let from = params.from.unwrap_or(to - Duration::days(7));
    let ticks = state.store.range_by_symbol(&symbol, from, to)?;
    Ok(Json(candles(&ticks, bucket)))
}

fn require_known(state: &GatewayState, symbol: &str) -> Result<(), QueryError> {
    match state.store.most_recent_by_symbol(symbol)? {
        Some(_) => Ok(()),
        None => Err(QueryError::NoData(symbol.to_string())),
    }
}

async fn subscribe_symbol(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    Path(symbol): Path<String>,
) -> Response {
    let symbol = normalize_symbol(&symbol);
    ws.on_upgrade(move |socket| async move {
        if let Err(err) = forward_ticks_to_client(socket, state.fanout, symbol).await {
            logging::warn(
                "gateway.client_error",
                "Subscriber websocket ended with error",
                json!({ "error": format!("{err:?}") }),
            );
        }
    })
}

async fn forward_ticks_to_client(socket: WebSocket, fanout: FanOut, symbol: String) -> Result<()> {
    let mut subscription = fanout.subscribe(&symbol);
    logging::info(
        "gateway.client.connected",
        "Subscriber connected",
        json!({ "destination": subscription.destination() }),
    );

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(message)) = ws_receiver.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    loop {
        let tick = tokio::select! {
            _ = &mut reader => break,
            maybe_tick = subscription.recv() => match maybe_tick {
                Some(tick) => tick,
                None => break,
            },
        };
        let payload = serde_json::to_string(&tick).context("serialize tick payload")?;
        if ws_sender.send(Message::Text(payload)).await.is_err() {
            break;
        }
    }

    if !reader.is_finished() {
        reader.abort();
    }
    logging::info(
        "gateway.client.disconnected",
        "Subscriber disconnected",
        json!({ "destination": subscription.destination() }),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_grammar() {
        assert_eq!(parse_interval("").unwrap(), Duration::minutes(5));
        assert_eq!(parse_interval("15m").unwrap(), Duration::minutes(15));
        assert_eq!(parse_interval("2h").unwrap(), Duration::hours(2));
        assert_eq!(parse_interval("1d").unwrap(), Duration::days(1));
        assert_eq!(parse_interval("3w").unwrap(), Duration::minutes(5));
        assert!(matches!(
            parse_interval("xm"),
            Err(QueryError::InvalidInterval(_))
        ));
        assert!(matches!(
            parse_interval("0h"),
            Err(QueryError::InvalidInterval(_))
        ));
    }

    #[test]
    fn no_data_maps_to_not_found() {
        let response = QueryError::NoData("ZZZ".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
