use std::{sync::Arc, time::Duration};

use common_kafka::{kafka_consumer::IngressConsumer, kafka_producer::create_kafka_producer};
use health::{HealthHandle, HealthRegistry};
use tracing::info;

use crate::{
    config::Config,
    container::JsonTreeOpener,
    detection::Detector,
    error::ServiceError,
    kafka::{KafkaEgress, KafkaIngress},
    retry::RetryPolicy,
    specification::{ApiSpecificationStore, DirectorySpecificationStore, SpecificationStore},
    worker::RunDetectionWorker,
};

fn retry_policy(config: &Config) -> RetryPolicy {
    RetryPolicy::build(
        config.retry_policy.backoff_coefficient,
        config.retry_policy.initial_interval.0,
    )
    .maximum_interval(config.retry_policy.maximum_interval.0)
    .queue(
        config
            .retry_policy
            .retry_queue_name
            .as_ref()
            .map(|queue| queue.as_str()),
    )
    .provide()
}

pub struct AppContext {
    pub health_registry: HealthRegistry,
    pub worker_liveness: HealthHandle,
    pub ingress: KafkaIngress,
    pub egress: Arc<KafkaEgress>,
    pub detector: Arc<Detector>,
    pub retry_policy: RetryPolicy,
    pub config: Config,
}

impl AppContext {
    pub async fn new(config: &Config) -> Result<Self, ServiceError> {
        let health_registry = HealthRegistry::new("liveness");
        let worker_liveness = health_registry.register("worker", Duration::from_secs(60));
        let kafka_liveness = health_registry.register("rdkafka", Duration::from_secs(30));

        let retry_policy = retry_policy(config);
        let retry_topic = retry_policy.retry_queue(&config.consumer.kafka_consumer_topic);

        // Requeued messages only come back if their topic is consumed too
        let consumer = IngressConsumer::new(&config.kafka, &config.consumer, Some(retry_topic))?;
        let producer = Arc::new(create_kafka_producer(&config.kafka, kafka_liveness).await?);

        let ingress = KafkaIngress::new(
            consumer,
            producer.clone(),
            retry_topic,
            config.dead_letter_topic.as_ref().map(|topic| topic.as_str()),
        );
        let egress = Arc::new(KafkaEgress::new(producer, config.egress_topic.as_str()));

        let store: Arc<dyn SpecificationStore> = match &config.specification_api_url {
            Some(url) => {
                info!("reading specifications from {}", url);
                Arc::new(ApiSpecificationStore::new(
                    url,
                    config.specification_api_key.clone(),
                    config.specification_api_timeout.0,
                )?)
            }
            None => {
                info!(
                    "reading specifications from directory {}",
                    config.specification_dir
                );
                Arc::new(DirectorySpecificationStore::new(
                    &config.specification_dir,
                ))
            }
        };
        let detector = Arc::new(Detector::new(Arc::new(JsonTreeOpener), store));

        Ok(Self {
            health_registry,
            worker_liveness,
            ingress,
            egress,
            detector,
            retry_policy,
            config: config.clone(),
        })
    }

    /// Hand the channels over to a worker, keeping the health registry for the server.
    pub fn into_worker(self) -> (HealthRegistry, RunDetectionWorker<KafkaIngress, KafkaEgress>) {
        let worker = RunDetectionWorker::new(
            self.ingress,
            self.egress,
            self.detector,
            self.config.poll_interval.0,
            self.config.max_concurrent_messages,
            self.config.max_delivery_count,
            self.retry_policy,
            self.worker_liveness,
        )
        .with_drain_timeout(self.config.shutdown_drain_timeout.0);
        (self.health_registry, worker)
    }
}
