//! Subscription engine: topic registry, fan-out, and event continuity.
//!
//! Topics are exact selectors of type `q`. Publishing assigns the next
//! topic seq, persists through the continuity oracle when one is present,
//! and fans out to every subscriber. The registry lock covers seq
//! assignment only; a per-topic delivery lock serializes fan-out so every
//! subscriber observes the same event order without cross-topic publishes
//! contending.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{RabbitError, Result};

/// Resume/backfill position within a topic stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinceCursor {
    /// Events with timestamp strictly after this instant.
    Instant(DateTime<Utc>),
    /// Events with topic seq strictly after this value.
    Seq(u64),
}

impl SinceCursor {
    /// Parse a `Since:` header value.
    ///
    /// The `seq:<n>` form is only legal when the tunnel negotiated the
    /// `since-seq` capability; pass `allow_seq` accordingly.
    pub fn parse(value: &str, allow_seq: bool) -> Result<Self> {
        if let Some(raw) = value.strip_prefix("seq:") {
            if !allow_seq {
                return Err(RabbitError::Precondition(
                    "seq tokens in Since require the since-seq capability".into(),
                ));
            }
            let seq = raw.parse().map_err(|_| {
                RabbitError::ProtocolViolation(format!("bad Since seq token: {value}"))
            })?;
            return Ok(SinceCursor::Seq(seq));
        }
        let instant = DateTime::parse_from_rfc3339(value).map_err(|_| {
            RabbitError::ProtocolViolation(format!("bad Since instant: {value}"))
        })?;
        Ok(SinceCursor::Instant(instant.with_timezone(&Utc)))
    }
}

/// One event as stored and replayed by the oracle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub seq: u64,
    pub payload: Bytes,
    pub timestamp: DateTime<Utc>,
}

/// External persistence for event replay.
///
/// When absent, delivery degrades to in-memory best-effort and `Since:`
/// backfill is unavailable.
pub trait ContinuityOracle: Send + Sync {
    /// Persist an event, returning its topic seq.
    ///
    /// The engine serializes calls per topic; implementations must return
    /// strictly increasing seqs within a topic.
    fn append(&self, topic: &str, payload: &[u8], timestamp: DateTime<Utc>) -> u64;

    /// Replay events after `since`, in seq order.
    fn read_since(&self, topic: &str, since: &SinceCursor) -> Vec<StoredEvent>;

    /// Highest seq assigned for a topic, 0 when empty.
    fn latest_seq(&self, topic: &str) -> u64;
}

/// In-memory oracle: append-only per-topic vectors with pruning.
#[derive(Default)]
pub struct MemoryOracle {
    streams: StdMutex<HashMap<String, Vec<StoredEvent>>>,
}

impl MemoryOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `max_events` per topic, dropping the oldest.
    pub fn prune(&self, topic: &str, max_events: usize) {
        let mut streams = lock_recover(&self.streams);
        if let Some(events) = streams.get_mut(topic) {
            if events.len() > max_events {
                let drop_count = events.len() - max_events;
                events.drain(0..drop_count);
            }
        }
    }
}

fn lock_recover<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ContinuityOracle for MemoryOracle {
    fn append(&self, topic: &str, payload: &[u8], timestamp: DateTime<Utc>) -> u64 {
        let mut streams = lock_recover(&self.streams);
        let events = streams.entry(topic.to_string()).or_default();
        let seq = events.last().map(|e| e.seq + 1).unwrap_or(1);
        events.push(StoredEvent {
            seq,
            payload: Bytes::copy_from_slice(payload),
            timestamp,
        });
        seq
    }

    fn read_since(&self, topic: &str, since: &SinceCursor) -> Vec<StoredEvent> {
        let streams = lock_recover(&self.streams);
        let Some(events) = streams.get(topic) else {
            return Vec::new();
        };
        events
            .iter()
            .filter(|e| match since {
                SinceCursor::Instant(t) => e.timestamp > *t,
                SinceCursor::Seq(n) => e.seq > *n,
            })
            .cloned()
            .collect()
    }

    fn latest_seq(&self, topic: &str) -> u64 {
        let streams = lock_recover(&self.streams);
        streams
            .get(topic)
            .and_then(|e| e.last())
            .map(|e| e.seq)
            .unwrap_or(0)
    }
}

/// An event handed to a subscriber sink.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub selector: String,
    pub topic_seq: u64,
    pub payload: Bytes,
    pub timestamp: DateTime<Utc>,
}

/// Delivery endpoint for one subscriber.
///
/// The engine calls `deliver` in topic-seq order; an implementation
/// returning [`RabbitError::FlowLimit`] is dropped from the topic and
/// notified via `overflow`.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: &EventRecord) -> Result<()>;

    /// Called once when the subscriber is dropped for falling behind.
    async fn overflow(&self);
}

struct SubscriberEntry {
    id: u64,
    sink: Arc<dyn EventSink>,
}

struct Topic {
    /// Next seq when no oracle is present; with an oracle the oracle's
    /// numbering is authoritative.
    next_seq: u64,
    delivery: Arc<Mutex<()>>,
    subscribers: Vec<SubscriberEntry>,
}

impl Topic {
    fn new(first_seq: u64) -> Self {
        Self {
            next_seq: first_seq,
            delivery: Arc::new(Mutex::new(())),
            subscribers: Vec::new(),
        }
    }
}

/// Handle identifying one registered subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

/// Topic registry plus fan-out machinery.
pub struct SubscriptionEngine {
    topics: Mutex<HashMap<String, Topic>>,
    oracle: Option<Arc<dyn ContinuityOracle>>,
    next_subscriber: AtomicU64,
}

impl SubscriptionEngine {
    pub fn new(oracle: Option<Arc<dyn ContinuityOracle>>) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            oracle,
            next_subscriber: AtomicU64::new(1),
        }
    }

    /// Whether `Since:` backfill is available.
    pub fn has_oracle(&self) -> bool {
        self.oracle.is_some()
    }

    /// Register a subscriber and, when a cursor is given, backfill missed
    /// events before any live event can reach the sink.
    ///
    /// Backfilled and live events share one per-topic delivery lock, so
    /// the subscriber observes real seq order with no restart between
    /// backfill and live traffic.
    pub async fn subscribe(
        &self,
        selector: &str,
        since: Option<SinceCursor>,
        sink: Arc<dyn EventSink>,
    ) -> Result<SubscriberId> {
        let id = SubscriberId(self.next_subscriber.fetch_add(1, Ordering::Relaxed));
        let backfill = match (&since, &self.oracle) {
            (Some(cursor), Some(oracle)) => oracle.read_since(selector, cursor),
            (Some(_), None) => {
                return Err(RabbitError::Precondition(
                    "Since requires a continuity oracle".into(),
                ))
            }
            (None, _) => Vec::new(),
        };

        let mut topics = self.topics.lock().await;
        let first_seq = self.latest_seq(selector) + 1;
        let topic = topics
            .entry(selector.to_string())
            .or_insert_with(|| Topic::new(first_seq));
        let delivery = topic.delivery.clone();
        // Take the delivery lock before releasing the registry so a racing
        // publish cannot slip a newer event ahead of the backfill.
        let guard = delivery.lock().await;
        topic.subscribers.push(SubscriberEntry { id: id.0, sink: sink.clone() });
        drop(topics);

        for event in backfill {
            let record = EventRecord {
                selector: selector.to_string(),
                topic_seq: event.seq,
                payload: event.payload,
                timestamp: event.timestamp,
            };
            if sink.deliver(&record).await.is_err() {
                drop(guard);
                self.unsubscribe(selector, id).await;
                sink.overflow().await;
                return Err(RabbitError::FlowLimit("subscriber overflow during backfill".into()));
            }
        }
        drop(guard);
        debug!(selector, subscriber = id.0, "subscribed");
        Ok(id)
    }

    /// Remove a subscriber from a topic.
    pub async fn unsubscribe(&self, selector: &str, id: SubscriberId) {
        let mut topics = self.topics.lock().await;
        if let Some(topic) = topics.get_mut(selector) {
            topic.subscribers.retain(|s| s.id != id.0);
            if topic.subscribers.is_empty() {
                topics.remove(selector);
            }
        }
    }

    /// Publish a payload to every current subscriber of `selector`.
    ///
    /// Returns the assigned topic seq. Concurrent publishers to one topic
    /// serialize on the topic's delivery lock; the cross-topic registry
    /// lock is released before any subscriber is touched.
    pub async fn publish(&self, selector: &str, payload: Bytes) -> Result<u64> {
        let timestamp = Utc::now();
        let mut topics = self.topics.lock().await;
        let first_seq = self.latest_seq(selector) + 1;
        let topic = topics
            .entry(selector.to_string())
            .or_insert_with(|| Topic::new(first_seq));
        let seq = match &self.oracle {
            Some(oracle) => {
                let seq = oracle.append(selector, &payload, timestamp);
                topic.next_seq = seq + 1;
                seq
            }
            None => {
                let seq = topic.next_seq;
                topic.next_seq += 1;
                seq
            }
        };
        let delivery = topic.delivery.clone();
        let subscribers: Vec<(u64, Arc<dyn EventSink>)> = topic
            .subscribers
            .iter()
            .map(|s| (s.id, s.sink.clone()))
            .collect();
        let guard = delivery.lock().await;
        drop(topics);

        let record = EventRecord {
            selector: selector.to_string(),
            topic_seq: seq,
            payload,
            timestamp,
        };
        let mut dropped = Vec::new();
        for (id, sink) in &subscribers {
            if let Err(err) = sink.deliver(&record).await {
                warn!(selector, subscriber = *id, %err, "dropping slow subscriber");
                dropped.push((*id, sink.clone()));
            }
        }
        drop(guard);

        for (id, sink) in dropped {
            self.unsubscribe(selector, SubscriberId(id)).await;
            sink.overflow().await;
        }
        Ok(seq)
    }

    /// Current subscriber count for a topic.
    pub async fn subscriber_count(&self, selector: &str) -> usize {
        self.topics
            .lock()
            .await
            .get(selector)
            .map(|t| t.subscribers.len())
            .unwrap_or(0)
    }

    fn latest_seq(&self, selector: &str) -> u64 {
        self.oracle
            .as_ref()
            .map(|o| o.latest_seq(selector))
            .unwrap_or(0)
    }
}
