//! Synchronous entry point used by the HTTP handlers.
use std::sync::Arc;

use message_common::publisher::{DeliveryError, Publisher};
use message_common::store::{ContentStore, StoreError};
use message_common::topics::{MessageType, TopicRouter};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("{0} is not a configured message type")]
    UnknownTopic(String),
    #[error("message content must not be empty")]
    EmptyContent,
    #[error("message content must not contain NUL characters")]
    InvalidContent,
    #[error("failed to store message: {0}")]
    Store(#[from] StoreError),
    #[error("failed to publish message: {0}")]
    Delivery(#[from] DeliveryError),
}

impl IngestError {
    /// Errors caused by the request itself, as opposed to a failing dependency.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            IngestError::UnknownTopic(_)
                | IngestError::EmptyContent
                | IngestError::InvalidContent
                | IngestError::Store(StoreError::InvalidData { .. })
        )
    }
}

/// Persists and publishes incoming messages, and answers processed-count queries.
#[derive(Clone)]
pub struct IngestionService {
    router: Arc<TopicRouter>,
    store: ContentStore,
    publisher: Arc<dyn Publisher>,
}

impl IngestionService {
    pub fn new(router: Arc<TopicRouter>, store: ContentStore, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            router,
            store,
            publisher,
        }
    }

    fn resolve(&self, topic: &str) -> Result<&MessageType, IngestError> {
        self.router
            .resolve(topic)
            .map(|route| &route.message_type)
            .ok_or_else(|| IngestError::UnknownTopic(topic.to_owned()))
    }

    /// Store `content` under `topic`, then publish it for the consumers.
    ///
    /// Nothing is published when storing fails. When publishing fails the stored row is
    /// kept unprocessed: it is only marked if the same content reaches the event log again.
    pub async fn submit(&self, topic: &str, content: &str) -> Result<(), IngestError> {
        let message_type = self.resolve(topic)?;
        if content.is_empty() {
            return Err(IngestError::EmptyContent);
        }
        // Postgres text cannot hold NUL.
        if content.contains('\0') {
            return Err(IngestError::InvalidContent);
        }

        let inserted = self
            .store
            .persist(message_type, content)
            .await
            .inspect_err(|e| error!(topic = %message_type, "failed to store message: {}", e))?;

        // Nothing inserted means an equal row exists, unless the content only shares its hash.
        if !inserted {
            self.store
                .find_key(message_type, content)
                .await
                .inspect_err(|e| {
                    error!(topic = %message_type, "content neither stored nor found: {}", e)
                })?;
        }

        metrics::counter!("message_submitted_total", "topic" => message_type.to_string())
            .increment(1);

        if let Err(e) = self.publisher.publish(message_type, content).await {
            metrics::counter!("message_unpublished_total", "topic" => message_type.to_string())
                .increment(1);
            warn!(
                topic = %message_type,
                "message stored but not published, it stays unprocessed until redelivered: {}",
                e
            );
            return Err(e.into());
        }

        Ok(())
    }

    pub async fn stats(&self, topic: &str) -> Result<i64, IngestError> {
        let message_type = self.resolve(topic)?;
        Ok(self.store.count_processed(message_type).await?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use sqlx::PgPool;

    /// Publisher keeping every published message in memory.
    #[derive(Default)]
    pub(crate) struct RecordingPublisher {
        pub(crate) published: Mutex<Vec<(MessageType, String)>>,
        pub(crate) unavailable: AtomicBool,
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(&self, topic: &MessageType, content: &str) -> Result<(), DeliveryError> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(DeliveryError::Canceled);
            }
            self.published
                .lock()
                .unwrap()
                .push((topic.clone(), content.to_owned()));
            Ok(())
        }
    }

    pub(crate) fn service(db: PgPool) -> (IngestionService, ContentStore, Arc<RecordingPublisher>) {
        let types: Vec<MessageType> = vec!["message".parse().unwrap(), "ping".parse().unwrap()];
        let router = Arc::new(TopicRouter::new(&types).unwrap());
        let store = ContentStore::new(db, &router);
        let publisher = Arc::new(RecordingPublisher::default());
        let service = IngestionService::new(router, store.clone(), publisher.clone());
        (service, store, publisher)
    }

    fn message() -> MessageType {
        "message".parse().unwrap()
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_submit_stores_then_publishes(db: PgPool) {
        let (service, store, publisher) = service(db);

        service.submit("message", "hello").await.unwrap();

        let stored = store.find(&message(), "hello").await.unwrap().unwrap();
        assert!(!stored.processed);
        assert_eq!(
            *publisher.published.lock().unwrap(),
            vec![(message(), "hello".to_owned())]
        );
        assert_eq!(service.stats("message").await.unwrap(), 0);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_submit_rejects_unconfigured_topic(db: PgPool) {
        let (service, _, publisher) = service(db.clone());

        let error = service.submit("pong", "hello").await.unwrap_err();

        assert!(matches!(error, IngestError::UnknownTopic(ref topic) if topic == "pong"));
        assert!(error.is_client_error());
        assert!(publisher.published.lock().unwrap().is_empty());
        let rows: i64 = sqlx::query_scalar(
            "SELECT (SELECT COUNT(*) FROM message) + (SELECT COUNT(*) FROM ping)",
        )
        .fetch_one(&db)
        .await
        .unwrap();
        assert_eq!(rows, 0);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_submit_rejects_empty_content(db: PgPool) {
        let (service, store, _) = service(db);

        assert!(matches!(
            service.submit("message", "").await,
            Err(IngestError::EmptyContent)
        ));
        assert!(store.find(&message(), "").await.unwrap().is_none());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_submit_rejects_nul_content(db: PgPool) {
        let (service, _, publisher) = service(db.clone());

        let error = service.submit("message", "a\0b").await.unwrap_err();

        assert!(matches!(error, IngestError::InvalidContent));
        assert!(error.is_client_error());
        assert!(publisher.published.lock().unwrap().is_empty());
        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM message")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_submit_fails_when_content_is_not_stored(db: PgPool) {
        let (service, _, publisher) = service(db.clone());
        // Drop every insert silently, as a hash collision with other content would.
        sqlx::query(
            "CREATE FUNCTION drop_insert() RETURNS trigger AS $$ BEGIN RETURN NULL; END; $$ LANGUAGE plpgsql",
        )
        .execute(&db)
        .await
        .unwrap();
        sqlx::query(
            "CREATE TRIGGER drop_message_insert BEFORE INSERT ON message FOR EACH ROW EXECUTE FUNCTION drop_insert()",
        )
        .execute(&db)
        .await
        .unwrap();

        let error = service.submit("message", "lost").await.unwrap_err();

        assert!(matches!(
            error,
            IngestError::Store(StoreError::NotFound { .. })
        ));
        assert!(!error.is_client_error());
        assert!(publisher.published.lock().unwrap().is_empty());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_failed_publish_keeps_stored_row(db: PgPool) {
        let (service, store, publisher) = service(db);
        publisher.unavailable.store(true, Ordering::SeqCst);

        let error = service.submit("message", "stranded").await.unwrap_err();

        assert!(matches!(error, IngestError::Delivery(DeliveryError::Canceled)));
        assert!(!error.is_client_error());
        let stored = store.find(&message(), "stranded").await.unwrap().unwrap();
        assert!(!stored.processed);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_concurrent_identical_submits(db: PgPool) {
        let (service, _, publisher) = service(db.clone());

        let results = futures::future::join_all((0..10).map(|_| {
            let service = service.clone();
            tokio::spawn(async move { service.submit("message", "same").await })
        }))
        .await;

        for result in results {
            result.expect("task panicked").expect("submit failed");
        }
        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM message WHERE content = 'same'")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(rows, 1);
        assert_eq!(publisher.published.lock().unwrap().len(), 10);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_stats_rejects_unconfigured_topic(db: PgPool) {
        let (service, _, _) = service(db);

        assert!(matches!(
            service.stats("pong").await,
            Err(IngestError::UnknownTopic(_))
        ));
    }
}
