//! One Kafka consumer per configured message type, marking stored messages as processed.
use std::sync::Arc;
use std::time::Duration;

use health::{HealthHandle, HealthRegistry};
use message_common::config::KafkaConfig;
use message_common::retry::RetryPolicy;
use message_common::store::{ContentStore, StoreError};
use message_common::topics::{MessageType, Route, TopicRouter};
use rdkafka::consumer::{Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::OwnedMessage;
use rdkafka::{ClientConfig, ClientContext, Message};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long to back off after a failed read before polling again.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("failed to create consumer for {topic}: {error}")]
    CreateError { topic: String, error: KafkaError },
}

/// Why an event was dropped without being marked processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    EmptyPayload,
    InvalidPayload,
    UnknownTopic,
    ForeignTopic,
    KeyNotFound,
    StoreError,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::EmptyPayload => "empty_payload",
            SkipReason::InvalidPayload => "invalid_payload",
            SkipReason::UnknownTopic => "unknown_topic",
            SkipReason::ForeignTopic => "foreign_topic",
            SkipReason::KeyNotFound => "key_not_found",
            SkipReason::StoreError => "store_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Processed { key: i64 },
    Skipped(SkipReason),
}

/// Applies one event to the store: persist, resolve its key, mark it processed.
#[derive(Clone)]
pub struct EventProcessor {
    message_type: MessageType,
    router: Arc<TopicRouter>,
    store: ContentStore,
    retry_policy: RetryPolicy,
}

impl EventProcessor {
    pub fn new(
        message_type: MessageType,
        router: Arc<TopicRouter>,
        store: ContentStore,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            message_type,
            router,
            store,
            retry_policy,
        }
    }

    /// The topic named by the event key. Events without a key belong to this processor's type.
    fn event_topic(&self, key: Option<&[u8]>) -> Result<&MessageType, SkipReason> {
        let Some(key) = key else {
            return Ok(&self.message_type);
        };

        let route = std::str::from_utf8(key)
            .ok()
            .and_then(|name| self.router.resolve(name))
            .ok_or(SkipReason::UnknownTopic)?;

        if route.message_type != self.message_type {
            return Err(SkipReason::ForeignTopic);
        }
        Ok(&route.message_type)
    }

    pub async fn process(&self, key: Option<&[u8]>, payload: Option<&[u8]>) -> Outcome {
        let content = match payload.map(std::str::from_utf8) {
            None | Some(Ok("")) => return Outcome::Skipped(SkipReason::EmptyPayload),
            Some(Err(e)) => {
                warn!(topic = %self.message_type, "dropping event with non UTF-8 payload: {}", e);
                return Outcome::Skipped(SkipReason::InvalidPayload);
            }
            Some(Ok(content)) if content.contains('\0') => {
                warn!(topic = %self.message_type, "dropping event with NUL in payload");
                return Outcome::Skipped(SkipReason::InvalidPayload);
            }
            Some(Ok(content)) => content,
        };

        let topic = match self.event_topic(key) {
            Ok(topic) => topic,
            Err(reason) => {
                warn!(
                    topic = %self.message_type,
                    key = %String::from_utf8_lossy(key.unwrap_or_default()),
                    reason = reason.as_str(),
                    "dropping event keyed for a topic this worker does not own"
                );
                return Outcome::Skipped(reason);
            }
        };

        match self.apply(topic, content).await {
            Ok(key) => Outcome::Processed { key },
            Err(StoreError::NotFound { relation }) => {
                // Persist reported success but the row is not visible: the event is skipped.
                error!(topic = %topic, relation = %relation, "stored message has no key, skipping event");
                Outcome::Skipped(SkipReason::KeyNotFound)
            }
            Err(e @ StoreError::InvalidData { .. }) => {
                warn!(topic = %topic, "dropping event the store rejects: {}", e);
                Outcome::Skipped(SkipReason::InvalidPayload)
            }
            Err(e) => {
                error!(topic = %topic, "failed to process event: {}", e);
                Outcome::Skipped(SkipReason::StoreError)
            }
        }
    }

    async fn apply(&self, topic: &MessageType, content: &str) -> Result<i64, StoreError> {
        let retry = &self.retry_policy;

        retry
            .retry("persisting event", StoreError::is_transient, || {
                self.store.persist(topic, content)
            })
            .await?;
        let key = retry
            .retry("resolving event key", StoreError::is_transient, || {
                self.store.find_key(topic, content)
            })
            .await?;
        retry
            .retry("marking event processed", StoreError::is_transient, || {
                self.store.mark_processed(topic, key)
            })
            .await?;

        Ok(key)
    }
}

pub struct WorkerContext {
    liveness: HealthHandle,
}

impl ClientContext for WorkerContext {
    fn stats(&self, _: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy();
    }
}

impl ConsumerContext for WorkerContext {}

/// Long running reader of one message type's event topic.
pub struct TopicWorker {
    route: Route,
    consumer: StreamConsumer<WorkerContext>,
    processor: EventProcessor,
    liveness: HealthHandle,
}

impl TopicWorker {
    pub fn new(
        config: &KafkaConfig,
        route: Route,
        processor: EventProcessor,
        liveness: HealthHandle,
    ) -> Result<Self, ConsumerError> {
        let create_error = |error| ConsumerError::CreateError {
            topic: route.event_topic.clone(),
            error,
        };

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", &route.consumer_group)
            .set("auto.offset.reset", &config.kafka_consumer_offset_reset)
            // Offsets are stored once an event is done with, and committed in the background.
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                config.kafka_consumer_auto_commit_interval_ms.to_string(),
            );

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let consumer: StreamConsumer<WorkerContext> = client_config
            .create_with_context(WorkerContext {
                liveness: liveness.clone(),
            })
            .map_err(create_error)?;
        consumer
            .subscribe(&[route.event_topic.as_str()])
            .map_err(create_error)?;

        Ok(Self {
            route,
            consumer,
            processor,
            liveness,
        })
    }

    /// Consume events until `shutdown` is cancelled. An event being processed when
    /// cancellation arrives is finished first.
    pub async fn run(self, shutdown: CancellationToken) {
        let topic = self.route.message_type.to_string();
        info!(topic = %topic, group = %self.route.consumer_group, "starting consumer");

        loop {
            self.liveness.report_healthy();

            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = self.consumer.recv() => received.map(|message| message.detach()),
            };

            let message = match received {
                Ok(message) => message,
                Err(e) => {
                    // Nothing was read, so nothing is stored: the same position is read again.
                    metrics::counter!("message_consumer_errors_total", "topic" => topic.clone())
                        .increment(1);
                    error!(topic = %topic, "failed to read event: {}", e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => continue,
                    }
                }
            };

            self.handle(&topic, &message).await;
        }

        self.consumer.unsubscribe();
        info!(topic = %topic, "consumer stopped");
    }

    async fn handle(&self, topic: &str, message: &OwnedMessage) {
        metrics::counter!("message_events_consumed_total", "topic" => topic.to_owned())
            .increment(1);
        debug!(
            topic,
            partition = message.partition(),
            offset = message.offset(),
            "received event"
        );

        match self.processor.process(message.key(), message.payload()).await {
            Outcome::Processed { key } => {
                metrics::counter!("message_events_processed_total", "topic" => topic.to_owned())
                    .increment(1);
                debug!(topic, key, "marked message processed");
            }
            Outcome::Skipped(reason) => {
                metrics::counter!(
                    "message_events_skipped_total",
                    "topic" => topic.to_owned(),
                    "reason" => reason.as_str()
                )
                .increment(1);
            }
        }

        if let Err(e) =
            self.consumer
                .store_offset(message.topic(), message.partition(), message.offset() + 1)
        {
            error!(topic, "failed to store offset: {}", e);
        }
    }
}

/// Owns one consumer task per configured message type.
pub struct ConsumerPool {
    tasks: JoinSet<()>,
    shutdown: CancellationToken,
}

impl ConsumerPool {
    /// Create and start a worker for every routed message type. All of them stop when
    /// `shutdown` is cancelled.
    pub fn start(
        config: &KafkaConfig,
        router: Arc<TopicRouter>,
        store: ContentStore,
        retry_policy: RetryPolicy,
        liveness: &HealthRegistry,
        shutdown: CancellationToken,
    ) -> Result<Self, ConsumerError> {
        let mut workers = Vec::new();
        for route in router.routes() {
            let processor = EventProcessor::new(
                route.message_type.clone(),
                router.clone(),
                store.clone(),
                retry_policy,
            );
            let handle = liveness.register(
                format!("{}-consumer", route.message_type),
                time::Duration::seconds(30),
            );
            workers.push(TopicWorker::new(config, route.clone(), processor, handle)?);
        }

        let mut tasks = JoinSet::new();
        for worker in workers {
            tasks.spawn(worker.run(shutdown.clone()));
        }

        Ok(Self { tasks, shutdown })
    }

    /// Number of workers still running.
    pub fn workers(&self) -> usize {
        self.tasks.len()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for every worker to stop.
    pub async fn join(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!("consumer task failed: {}", e);
            }
        }
    }
}
