use std::time::Duration;

use async_trait::async_trait;
use health::HealthHandle;
use metrics::{counter, gauge};
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use thiserror::Error;
use tracing::{debug, error, info, instrument};

use crate::config::KafkaConfig;
use crate::topics::{route, MessageType};

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("failed to produce to kafka: {0}")]
    Produce(#[from] KafkaError),
    #[error("failed to produce to kafka before the delivery timeout")]
    Canceled,
}

/// Hand-off of accepted messages to the event log.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Send `content` to the topic's event topic, keyed by the topic name. Returns once
    /// every in-sync replica acknowledged the write.
    async fn publish(&self, topic: &MessageType, content: &str) -> Result<(), DeliveryError>;
}

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // rdkafka's main loop calling us back means the producer is alive.
        self.liveness.report_healthy();

        gauge!("message_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("message_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
        gauge!("message_kafka_callback_queue_depth").set(stats.replyq as f64);
    }
}

pub struct KafkaPublisher {
    producer: FutureProducer<KafkaContext>,
}

impl KafkaPublisher {
    pub fn new(config: &KafkaConfig, liveness: HealthHandle) -> Result<Self, KafkaError> {
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            // Every in-sync replica must have the message before we report success.
            .set("acks", "all")
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set("compression.codec", &config.kafka_compression_codec)
            .set(
                "queue.buffering.max.kbytes",
                (config.kafka_producer_queue_mib * 1024).to_string(),
            );

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let producer: FutureProducer<KafkaContext> =
            client_config.create_with_context(KafkaContext { liveness })?;

        // Ping the cluster to make sure we can reach brokers, fail after 10 seconds
        drop(
            producer
                .client()
                .fetch_metadata(None, Timeout::After(Duration::from_secs(10)))?,
        );
        info!("connected to Kafka brokers");

        Ok(Self { producer })
    }

    pub fn flush(&self) -> Result<(), KafkaError> {
        self.producer.flush(Duration::from_secs(30))
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    #[instrument(skip_all, fields(topic = %topic))]
    async fn publish(&self, topic: &MessageType, content: &str) -> Result<(), DeliveryError> {
        let route = route(topic);
        let record = FutureRecord {
            topic: route.event_topic.as_str(),
            payload: Some(content),
            partition: None,
            key: Some(topic.as_str()),
            timestamp: None,
            headers: None,
        };

        let delivery = self.producer.send_result(record).map_err(|(e, _)| {
            counter!("message_kafka_produce_errors_total", "topic" => topic.to_string())
                .increment(1);
            error!("failed to enqueue event: {}", e);
            DeliveryError::Produce(e)
        })?;

        match delivery.await {
            Ok(Ok(_)) => {
                counter!("message_events_published_total", "topic" => topic.to_string())
                    .increment(1);
                Ok(())
            }
            Ok(Err((e, _))) => {
                counter!("message_kafka_produce_errors_total", "topic" => topic.to_string())
                    .increment(1);
                error!("failed to produce event: {}", e);
                Err(DeliveryError::Produce(e))
            }
            Err(_) => {
                // The producer dropped the delivery, the message timed out while retrying.
                counter!("message_kafka_produce_errors_total", "topic" => topic.to_string())
                    .increment(1);
                error!("failed to produce event before the delivery timeout");
                Err(DeliveryError::Canceled)
            }
        }
    }
}
