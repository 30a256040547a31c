//! Kafka implementations of the ingress and egress channels.
//!
//! Kafka has no redelivery counter and no per-message negative acknowledgement,
//! so both are built here: a requeue produces the payload again with an
//! incremented `delivery-count` header and then commits the original, and a
//! reject optionally copies the payload to a dead-letter topic before committing.
//! The copy is produced at most once per message, even when storing the offset
//! afterwards fails and the settle is tried again.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use common_kafka::kafka_consumer::{IngressConsumer, ReceivedMessage, DELIVERY_COUNT_HEADER};
use common_kafka::kafka_producer::{headers, send_json, send_payload, KafkaContext};
use rdkafka::message::OwnedHeaders;
use rdkafka::producer::FutureProducer;
use tracing::debug;

use crate::broker::{Egress, Ingress, IngressMessage};
use crate::error::BrokerError;
use crate::job_request::JobRequest;

pub const REJECTION_REASON_HEADER: &str = "rejection-reason";

pub type Producer = Arc<FutureProducer<KafkaContext>>;

pub struct KafkaIngress {
    consumer: IngressConsumer,
    producer: Producer,
    retry_topic: Arc<str>,
    dead_letter_topic: Option<Arc<str>>,
}

impl KafkaIngress {
    pub fn new(
        consumer: IngressConsumer,
        producer: Producer,
        retry_topic: &str,
        dead_letter_topic: Option<&str>,
    ) -> Self {
        Self {
            consumer,
            producer,
            retry_topic: retry_topic.into(),
            dead_letter_topic: dead_letter_topic.map(Into::into),
        }
    }
}

#[async_trait]
impl Ingress for KafkaIngress {
    type Message = KafkaMessage;

    async fn recv(&self) -> Result<KafkaMessage, BrokerError> {
        let received = self.consumer.recv().await?;
        Ok(KafkaMessage {
            received,
            producer: self.producer.clone(),
            retry_topic: self.retry_topic.clone(),
            dead_letter_topic: self.dead_letter_topic.clone(),
            copied: AtomicBool::new(false),
        })
    }
}

pub struct KafkaMessage {
    received: ReceivedMessage,
    producer: Producer,
    retry_topic: Arc<str>,
    dead_letter_topic: Option<Arc<str>>,
    /// Set once the retry or dead-letter copy has been produced.
    copied: AtomicBool,
}

impl KafkaMessage {
    fn payload_bytes(&self) -> &[u8] {
        self.received.payload.as_deref().unwrap_or_default()
    }

    async fn copy_to(&self, topic: &str, copy_headers: OwnedHeaders) -> Result<(), BrokerError> {
        if self.copied.load(Ordering::SeqCst) {
            return Ok(());
        }
        send_payload(
            self.producer.as_ref(),
            topic,
            None,
            self.payload_bytes(),
            Some(copy_headers),
        )
        .await?;
        self.copied.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl IngressMessage for KafkaMessage {
    fn payload(&self) -> Option<&[u8]> {
        self.received.payload.as_deref()
    }

    fn delivery_count(&self) -> u32 {
        self.received.delivery_count
    }

    async fn ack(&self) -> Result<(), BrokerError> {
        self.received.offset.store()?;
        Ok(())
    }

    async fn requeue(&self) -> Result<(), BrokerError> {
        let next_count = (self.received.delivery_count + 1).to_string();
        self.copy_to(
            &self.retry_topic,
            headers([(DELIVERY_COUNT_HEADER, next_count.as_str())]),
        )
        .await?;
        debug!(
            topic = %self.retry_topic,
            delivery_count = %next_count,
            "requeued message"
        );

        // Only once the copy is safely produced may the original be committed
        self.received.offset.store()?;
        Ok(())
    }

    async fn reject(&self, reason: &str) -> Result<(), BrokerError> {
        if let Some(topic) = &self.dead_letter_topic {
            let delivery_count = self.received.delivery_count.to_string();
            self.copy_to(
                topic,
                headers([
                    (DELIVERY_COUNT_HEADER, delivery_count.as_str()),
                    (REJECTION_REASON_HEADER, reason),
                ]),
            )
            .await?;
        }
        self.received.offset.store()?;
        Ok(())
    }
}

pub struct KafkaEgress {
    producer: Producer,
    topic: String,
}

impl KafkaEgress {
    pub fn new(producer: Producer, topic: &str) -> Self {
        Self {
            producer,
            topic: topic.to_owned(),
        }
    }
}

#[async_trait]
impl Egress for KafkaEgress {
    async fn publish(&self, job_request: &JobRequest) -> Result<(), BrokerError> {
        send_json(
            self.producer.as_ref(),
            &self.topic,
            Some(&job_request.key()),
            job_request,
        )
        .await?;
        Ok(())
    }
}
