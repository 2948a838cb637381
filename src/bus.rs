//! In-process stand-in for a partitioned, keyed message topic.
//!
//! Each partition is a broadcast channel, so every subscriber behaves like its own
//! consumer group and sees the partition in publish order. Records are carried as
//! JSON text, the same shape a broker would hold.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::logging;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("topic {topic} is closed")]
    Closed { topic: String },
    #[error("failed to serialise record for topic {topic}: {source}")]
    Serialize {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct Record {
    pub key: String,
    pub partition: usize,
    pub offset: u64,
    pub payload: Arc<str>,
}

impl Record {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

/// Where a published record landed. `subscribers` is zero when nobody was
/// attached to the partition; the record is then simply never read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    pub partition: usize,
    pub offset: u64,
    pub subscribers: usize,
}

struct Partition {
    sender: broadcast::Sender<Record>,
    next_offset: AtomicU64,
}

struct TopicInner {
    name: String,
    capacity: usize,
    partitions: Vec<Partition>,
    closed: AtomicBool,
    failed: AtomicU64,
}

#[derive(Clone)]
pub struct Topic {
    inner: Arc<TopicInner>,
}

impl Topic {
    pub fn new(name: impl Into<String>, partitions: usize, capacity: usize) -> Self {
        let partitions = (0..partitions.max(1))
            .map(|_| Partition {
                sender: broadcast::channel(capacity.max(1)).0,
                next_offset: AtomicU64::new(0),
            })
            .collect();

        Self {
            inner: Arc::new(TopicInner {
                name: name.into(),
                capacity: capacity.max(1),
                partitions,
                closed: AtomicBool::new(false),
                failed: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn partition_count(&self) -> usize {
        self.inner.partitions.len()
    }

    pub fn partition_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.inner.partitions.len() as u64) as usize
    }

    /// Publishes `value` under `key`. The returned [`Delivery`] must be observed;
    /// an unobserved failure is logged when the delivery is dropped.
    pub fn publish<T: Serialize>(&self, key: &str, value: &T) -> Delivery {
        let outcome = self.try_publish(key, value);
        if outcome.is_err() {
            self.inner.failed.fetch_add(1, Ordering::Relaxed);
        }
        Delivery {
            topic: self.inner.name.clone(),
            key: key.to_string(),
            outcome: Some(outcome),
        }
    }

    /// Like [`Topic::publish`], but first waits while the target partition holds
    /// half its capacity of unread records, so bulk producers do not overrun
    /// consumers.
    pub async fn publish_paced<T: Serialize>(&self, key: &str, value: &T) -> Delivery {
        let partition = &self.inner.partitions[self.partition_for(key)];
        let high_water = (self.inner.capacity / 2).max(1);
        while partition.sender.receiver_count() > 0
            && partition.sender.len() >= high_water
            && !self.is_closed()
        {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        self.publish(key, value)
    }

    fn try_publish<T: Serialize>(&self, key: &str, value: &T) -> Result<Receipt, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed {
                topic: self.inner.name.clone(),
            });
        }

        let payload = serde_json::to_string(value).map_err(|source| BusError::Serialize {
            topic: self.inner.name.clone(),
            source,
        })?;

        let index = self.partition_for(key);
        let partition = &self.inner.partitions[index];
        let offset = partition.next_offset.fetch_add(1, Ordering::Relaxed);
        let record = Record {
            key: key.to_string(),
            partition: index,
            offset,
            payload: payload.into(),
        };

        let subscribers = partition.sender.send(record).unwrap_or(0);
        Ok(Receipt {
            partition: index,
            offset,
            subscribers,
        })
    }

    /// One consumer per partition, all subscribed from the current tail.
    pub fn subscribe(&self) -> Vec<PartitionConsumer> {
        self.inner
            .partitions
            .iter()
            .enumerate()
            .map(|(index, partition)| PartitionConsumer {
                topic: self.inner.name.clone(),
                partition: index,
                receiver: partition.sender.subscribe(),
            })
            .collect()
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn failed_publishes(&self) -> u64 {
        self.inner.failed.load(Ordering::Relaxed)
    }
}

/// Outcome of a single publish. Failures are logged exactly once: either by
/// [`Delivery::observe`] or, if the caller never looks, when the value is dropped.
#[must_use = "observe the delivery so publish failures get logged"]
pub struct Delivery {
    topic: String,
    key: String,
    outcome: Option<Result<Receipt, BusError>>,
}

impl Delivery {
    pub fn observe(mut self) -> Result<Receipt, BusError> {
        match self.outcome.take() {
            Some(Ok(receipt)) => Ok(receipt),
            Some(Err(err)) => {
                log_failure(&self.topic, &self.key, &err);
                Err(err)
            }
            None => Err(BusError::Closed {
                topic: self.topic.clone(),
            }),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, Some(Ok(_)))
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(Err(err)) = &self.outcome {
            log_failure(&self.topic, &self.key, err);
        }
    }
}

fn log_failure(topic: &str, key: &str, err: &BusError) {
    logging::warn(
        "bus.publish_failed",
        "Record dropped after failed publish",
        json!({ "topic": topic, "key": key, "error": err.to_string() }),
    );
}

pub struct PartitionConsumer {
    topic: String,
    partition: usize,
    receiver: broadcast::Receiver<Record>,
}

impl PartitionConsumer {
    pub fn partition(&self) -> usize {
        self.partition
    }

    /// Next record in partition order, or `None` once the topic is gone.
    /// Records lost to lag are logged and skipped.
    pub async fn recv(&mut self) -> Option<Record> {
        loop {
            match self.receiver.recv().await {
                Ok(record) => return Some(record),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    logging::warn(
                        "bus.lagged",
                        "Consumer lagged behind partition",
                        json!({
                            "topic": self.topic,
                            "partition": self.partition,
                            "skipped": skipped
                        }),
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
