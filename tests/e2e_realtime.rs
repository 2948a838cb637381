use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures_util::StreamExt;
use rust_tick_stream::logging;
use rust_tick_stream::pipeline::{Pipeline, PipelineConfig, ShutdownSignal};
use rust_tick_stream::tick::Tick;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn websocket_subscriber_receives_only_its_symbol() {
    logging::set_silent(true);
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9131);
    let pipeline = Pipeline::new(PipelineConfig {
        symbols: vec!["AAPL".into(), "MSFT".into(), "JPM".into()],
        tick_interval: Duration::from_millis(5),
        update_probability: 1.0,
        gateway_addr: addr,
        enable_gateway: true,
        ..PipelineConfig::default()
    })
    .expect("pipeline");

    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownSignal::None);
    let runner = {
        let pipeline = pipeline.clone();
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move { pipeline.run(shutdown_tx, shutdown_rx).await })
    };

    let connect_addr = "ws://127.0.0.1:9131/topic/stock/msft";
    let (mut ws, _) = loop {
        match tokio_tungstenite::connect_async(connect_addr).await {
            Ok(conn) => break conn,
            Err(err) => {
                if let tokio_tungstenite::tungstenite::Error::Io(io) = &err {
                    if matches!(io.kind(), std::io::ErrorKind::ConnectionRefused) {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                }
                panic!("failed to connect to gateway: {err}");
            }
        }
    };

    let mut received = 0usize;
    while received < 5 {
        let maybe_message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("websocket message timeout");

        match maybe_message {
            Some(Ok(Message::Text(payload))) => {
                let tick: Tick = serde_json::from_str(&payload).expect("valid payload");
                assert_eq!(tick.symbol, "MSFT", "received another symbol's tick");
                assert!(tick.is_enriched(), "fan-out ticks must be enriched");
                received += 1;
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => panic!("websocket error: {err}"),
            None => break,
        }
    }
    assert_eq!(received, 5, "expected five MSFT ticks");
    assert_eq!(pipeline.fanout.active_subscribers(), 1);

    let _ = ws.close(None).await;
    let _ = shutdown_tx.send(ShutdownSignal::Graceful);
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("pipeline shutdown timeout")
        .expect("join pipeline")
        .expect("pipeline run");
}
