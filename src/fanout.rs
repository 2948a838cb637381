use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::broadcast;

use crate::logging;
use crate::tick::Tick;

#[derive(Debug, Clone)]
pub struct RoutedTick {
    pub destination: Arc<str>,
    pub tick: Tick,
}

/// Pushes enriched ticks to live subscribers addressed by
/// `<prefix>/stock/<SYMBOL>`.
#[derive(Clone)]
pub struct FanOut {
    prefix: Arc<str>,
    sender: broadcast::Sender<Arc<RoutedTick>>,
    subscribers: Arc<AtomicUsize>,
}

impl FanOut {
    pub fn new(prefix: &str, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            prefix: prefix.trim_end_matches('/').into(),
            sender,
            subscribers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn destination_for(&self, symbol: &str) -> String {
        format!("{}/stock/{}", self.prefix, symbol)
    }

    /// Returns how many subscriptions could see the tick; none is not an error.
    pub fn forward(&self, tick: &Tick) -> usize {
        let routed = RoutedTick {
            destination: self.destination_for(&tick.symbol).into(),
            tick: tick.clone(),
        };
        self.sender.send(Arc::new(routed)).unwrap_or(0)
    }

    pub fn subscribe(&self, symbol: &str) -> Subscription {
        self.subscribers.fetch_add(1, Ordering::AcqRel);
        Subscription {
            destination: self.destination_for(symbol),
            receiver: self.sender.subscribe(),
            subscribers: Arc::clone(&self.subscribers),
        }
    }

    pub fn active_subscribers(&self) -> usize {
        self.subscribers.load(Ordering::Acquire)
    }
}

/// A live feed for one destination. Dropping it unregisters the subscriber.
pub struct Subscription {
    destination: String,
    receiver: broadcast::Receiver<Arc<RoutedTick>>,
    subscribers: Arc<AtomicUsize>,
}

impl Subscription {
    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub async fn recv(&mut self) -> Option<Tick> {
        loop {
            match self.receiver.recv().await {
                Ok(routed) if *routed.destination == *self.destination => {
                    return Some(routed.tick.clone())
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    logging::warn(
                        "fanout.lagged",
                        "Subscriber lagged fan-out messages",
                        json!({ "destination": self.destination, "skipped": skipped }),
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subscribers.fetch_sub(1, Ordering::AcqRel);
    }
}
