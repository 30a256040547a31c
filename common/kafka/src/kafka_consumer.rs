use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};

use rdkafka::{
    consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance, StreamConsumer},
    error::KafkaError,
    message::{BorrowedMessage, Headers},
    ClientContext, Message,
};
use tracing::{info, warn};

use crate::config::{ConsumerConfig, KafkaConfig};

/// Header carrying how many times a message has been delivered. The broker has no native
/// redelivery counter, so requeued messages are produced again with this header incremented.
pub const DELIVERY_COUNT_HEADER: &str = "delivery-count";

/// A consumer of the ingress topic, and optionally a retry topic, whose messages may
/// finish out of order.
///
/// Auto offset storing is disabled. Each received message holds an `Offset` that must be
/// stored once the message is fully handled; the consumer only advances the committed
/// position past offsets that are all finished, so a slow message is redelivered after a
/// restart even when later messages completed before it.
#[derive(Clone)]
pub struct IngressConsumer {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: StreamConsumer<IngressContext>,
    topics: Vec<String>,
    tracker: Arc<OffsetTracker>,
}

/// Drops tracked offsets of partitions taken away from this consumer, so completions from
/// the old assignment cannot hold back the next one.
pub struct IngressContext {
    tracker: Arc<OffsetTracker>,
}

impl ClientContext for IngressContext {}

impl ConsumerContext for IngressContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Revoke(partitions) = rebalance {
            for partition in partitions.elements() {
                self.tracker.forget(partition.topic(), partition.partition());
            }
            info!("forgot offsets of {} revoked partitions", partitions.count());
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OffsetErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Consumer gone")]
    Gone,
    #[error("Offset tracker lock poisoned")]
    Poisoned,
}

pub struct ReceivedMessage {
    pub payload: Option<Vec<u8>>,
    /// 1 on first delivery.
    pub delivery_count: u32,
    pub offset: Offset,
}

/// Topics to subscribe to: the ingress topic first, then the retry topic when it differs.
pub fn subscription_topics(
    consumer_config: &ConsumerConfig,
    retry_topic: Option<&str>,
) -> Vec<String> {
    let mut topics = vec![consumer_config.kafka_consumer_topic.clone()];
    if let Some(retry_topic) = retry_topic {
        if !topics.iter().any(|topic| topic == retry_topic) {
            topics.push(retry_topic.to_owned());
        }
    }
    topics
}

impl IngressConsumer {
    /// Subscribe to the ingress topic and, if given, the topic requeued messages are
    /// produced to.
    pub fn new(
        common_config: &KafkaConfig,
        consumer_config: &ConsumerConfig,
        retry_topic: Option<&str>,
    ) -> Result<Self, KafkaError> {
        let mut client_config = common_config.client_config();
        client_config
            .set("group.id", &consumer_config.kafka_consumer_group)
            .set(
                "auto.offset.reset",
                &consumer_config.kafka_consumer_offset_reset,
            )
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false");

        let tracker = Arc::new(OffsetTracker::default());
        let consumer: StreamConsumer<IngressContext> =
            client_config.create_with_context(IngressContext {
                tracker: tracker.clone(),
            })?;

        let topics = subscription_topics(consumer_config, retry_topic);
        let subscription: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&subscription)?;
        info!(topics = ?topics, "subscribed");

        Ok(Self {
            inner: Arc::new(Inner {
                consumer,
                topics,
                tracker,
            }),
        })
    }

    pub fn topics(&self) -> &[String] {
        &self.inner.topics
    }

    pub async fn recv(&self) -> Result<ReceivedMessage, KafkaError> {
        let message = self.inner.consumer.recv().await?;

        self.inner
            .tracker
            .begin(message.topic(), message.partition(), message.offset());

        Ok(ReceivedMessage {
            payload: message.payload().map(<[u8]>::to_vec),
            delivery_count: delivery_count(&message),
            offset: Offset {
                handle: Arc::downgrade(&self.inner),
                topic: message.topic().to_owned(),
                partition: message.partition(),
                offset: message.offset(),
            },
        })
    }
}

fn delivery_count(message: &BorrowedMessage<'_>) -> u32 {
    let Some(headers) = message.headers() else {
        return 1;
    };
    let Some(header) = headers
        .iter()
        .find(|header| header.key == DELIVERY_COUNT_HEADER)
    else {
        return 1;
    };
    header
        .value
        .and_then(|value| std::str::from_utf8(value).ok())
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or_else(|| {
            warn!("ignoring unreadable {} header", DELIVERY_COUNT_HEADER);
            1
        })
        .max(1)
}

#[derive(Debug)]
pub struct Offset {
    handle: Weak<Inner>,
    topic: String,
    partition: i32,
    offset: i64,
}

impl Offset {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Mark the message as finished, storing the consumer position if it can advance.
    ///
    /// Safe to call again after an error; a message whose partition was revoked in the
    /// meantime is silently dropped.
    pub fn store(&self) -> Result<(), OffsetErr> {
        let inner = self.handle.upgrade().ok_or(OffsetErr::Gone)?;
        inner
            .tracker
            .complete(&self.topic, self.partition, self.offset, |safe| {
                inner.consumer.store_offset(&self.topic, self.partition, safe)
            })?;
        Ok(())
    }
}

#[derive(Default)]
struct PartitionOffsets {
    in_flight: BTreeSet<i64>,
    /// Finished, but not yet covered by `stored`.
    done: BTreeSet<i64>,
    stored: Option<i64>,
}

/// Tracks in-flight offsets per topic partition.
#[derive(Default)]
struct OffsetTracker {
    partitions: Mutex<HashMap<(String, i32), PartitionOffsets>>,
}

impl OffsetTracker {
    fn begin(&self, topic: &str, partition: i32, offset: i64) {
        let Ok(mut partitions) = self.partitions.lock() else {
            warn!("poisoned offset tracker lock");
            return;
        };
        partitions
            .entry((topic.to_owned(), partition))
            .or_default()
            .in_flight
            .insert(offset);
    }

    fn forget(&self, topic: &str, partition: i32) {
        if let Ok(mut partitions) = self.partitions.lock() {
            partitions.remove(&(topic.to_owned(), partition));
        }
    }

    /// Finish `offset` and hand the highest offset below which every received message is
    /// finished to `store`, when that moved forward. Returns what was stored.
    ///
    /// Only offsets actually received and finished are ever stored. Offsets that were
    /// never begun, or whose partition was forgotten, change nothing. When `store` fails
    /// the offset stays finished, so calling again retries the store.
    fn complete<F>(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        store: F,
    ) -> Result<Option<i64>, OffsetErr>
    where
        F: FnOnce(i64) -> Result<(), KafkaError>,
    {
        let mut partitions = self.partitions.lock().map_err(|_| OffsetErr::Poisoned)?;
        let Some(state) = partitions.get_mut(&(topic.to_owned(), partition)) else {
            return Ok(None);
        };

        if state.in_flight.remove(&offset) {
            state.done.insert(offset);
        } else if !state.done.contains(&offset) {
            return Ok(None);
        }

        let safe = match state.in_flight.first() {
            Some(&lowest) => state.done.range(..lowest).next_back().copied(),
            None => state.done.last().copied(),
        };
        let Some(safe) = safe else {
            return Ok(None);
        };
        if state.stored.is_some_and(|stored| stored >= safe) {
            return Ok(None);
        }

        // Under the lock, so concurrent completions never store out of order
        store(safe)?;
        state.stored = Some(safe);
        state.done = state.done.split_off(&(safe + 1));
        Ok(Some(safe))
    }
}

#[cfg(test)]
mod tests {
    use rdkafka::types::RDKafkaErrorCode;

    use super::*;

    const TOPIC: &str = "watched-files";

    fn complete(tracker: &OffsetTracker, partition: i32, offset: i64) -> Option<i64> {
        tracker
            .complete(TOPIC, partition, offset, |_| Ok(()))
            .unwrap()
    }

    #[test]
    fn test_in_order_completion_advances_each_time() {
        let tracker = OffsetTracker::default();
        tracker.begin(TOPIC, 0, 10);
        tracker.begin(TOPIC, 0, 11);

        assert_eq!(complete(&tracker, 0, 10), Some(10));
        assert_eq!(complete(&tracker, 0, 11), Some(11));
    }

    #[test]
    fn test_out_of_order_completion_waits_for_lowest() {
        let tracker = OffsetTracker::default();
        tracker.begin(TOPIC, 0, 10);
        tracker.begin(TOPIC, 0, 11);
        tracker.begin(TOPIC, 0, 12);

        // 10 is still running, so nothing at or above it may be committed
        assert_eq!(complete(&tracker, 0, 12), None);
        assert_eq!(complete(&tracker, 0, 11), None);
        assert_eq!(complete(&tracker, 0, 10), Some(12));
    }

    #[test]
    fn test_partial_progress_below_in_flight() {
        let tracker = OffsetTracker::default();
        tracker.begin(TOPIC, 0, 10);
        tracker.begin(TOPIC, 0, 11);
        tracker.begin(TOPIC, 0, 12);

        assert_eq!(complete(&tracker, 0, 10), Some(10));
        assert_eq!(complete(&tracker, 0, 12), None);
        assert_eq!(complete(&tracker, 0, 11), Some(12));
    }

    #[test]
    fn test_never_stores_an_offset_that_was_not_received() {
        let tracker = OffsetTracker::default();
        tracker.begin(TOPIC, 0, 10);
        tracker.begin(TOPIC, 0, 12);

        // 11 was never received, 9 neither
        assert_eq!(complete(&tracker, 0, 11), None);
        assert_eq!(complete(&tracker, 0, 12), None);
        assert_eq!(complete(&tracker, 0, 10), Some(12));
    }

    #[test]
    fn test_partitions_are_independent() {
        let tracker = OffsetTracker::default();
        tracker.begin(TOPIC, 0, 5);
        tracker.begin(TOPIC, 1, 100);
        tracker.begin("watched-files-retry", 0, 7);

        assert_eq!(complete(&tracker, 1, 100), Some(100));
        assert_eq!(complete(&tracker, 0, 5), Some(5));
        assert_eq!(
            tracker
                .complete("watched-files-retry", 0, 7, |_| Ok(()))
                .unwrap(),
            Some(7)
        );
    }

    #[test]
    fn test_failed_store_is_retried_on_the_next_call() {
        let tracker = OffsetTracker::default();
        tracker.begin(TOPIC, 0, 10);

        let failed = tracker.complete(TOPIC, 0, 10, |_| {
            Err(KafkaError::StoreOffset(RDKafkaErrorCode::UnknownPartition))
        });
        assert!(failed.is_err());

        assert_eq!(complete(&tracker, 0, 10), Some(10));
        assert_eq!(complete(&tracker, 0, 10), None);
    }

    #[test]
    fn test_revoked_partition_no_longer_blocks() {
        let tracker = OffsetTracker::default();
        tracker.begin(TOPIC, 0, 10);
        tracker.begin(TOPIC, 0, 11);
        tracker.forget(TOPIC, 0);

        // Late completion from the old assignment
        assert_eq!(complete(&tracker, 0, 10), None);

        tracker.begin(TOPIC, 0, 20);
        assert_eq!(complete(&tracker, 0, 11), None);
        assert_eq!(complete(&tracker, 0, 20), Some(20));
    }

    #[test]
    fn test_retry_topic_is_subscribed() {
        let config = ConsumerConfig {
            kafka_consumer_group: "run-detection".to_owned(),
            kafka_consumer_topic: "watched-files".to_owned(),
            kafka_consumer_offset_reset: "latest".to_owned(),
        };

        assert_eq!(subscription_topics(&config, None), vec!["watched-files"]);
        assert_eq!(
            subscription_topics(&config, Some("watched-files-retry")),
            vec!["watched-files", "watched-files-retry"]
        );
        assert_eq!(
            subscription_topics(&config, Some("watched-files")),
            vec!["watched-files"]
        );
    }
}
