//! Per-topic content storage in PostgreSQL.
//!
//! Every configured `MessageType` owns one relation, named after the type. Rows are
//! deduplicated on content within a relation: `persist` is a no-op for content that is
//! already stored, which is what allows the ingestion path and the consumers to write
//! the same message concurrently.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use thiserror::Error;

use crate::topics::{MessageType, Route, TopicRouter};

/// Postgres SQLSTATE for a missing relation.
const UNDEFINED_TABLE: &str = "42P01";
/// SQLSTATE class of data exceptions: the value itself is rejected, retrying cannot help.
const DATA_EXCEPTION_CLASS: &str = "22";

/// Enumeration of errors for operations with ContentStore.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("topic {0} is not routed to a relation")]
    UnknownTopic(String),
    #[error("relation {relation} does not exist, it must be provisioned at startup")]
    Schema { relation: String },
    #[error("no matching row in relation {relation}")]
    NotFound { relation: String },
    #[error("{command} on {relation} rejected the value: {error}")]
    InvalidData {
        command: &'static str,
        relation: String,
        error: sqlx::Error,
    },
    #[error("{command} query on {relation} failed with: {error}")]
    Query {
        command: &'static str,
        relation: String,
        error: sqlx::Error,
    },
}

impl StoreError {
    /// Only failed queries may succeed when attempted again; everything else is a
    /// configuration or ordering problem.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Query { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A row of a topic relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: i64,
    pub topic: MessageType,
    pub content: String,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    content: String,
    processed: bool,
    created_at: DateTime<Utc>,
}

/// A provisioned relation and the statements that target it.
///
/// Statements are built once from the validated relation name, never from request input.
struct Relation {
    name: String,
    provisioned: AtomicBool,
    insert: String,
    select_key: String,
    select_message: String,
    mark_processed: String,
    count_processed: String,
}

impl Relation {
    fn new(route: &Route) -> Self {
        let table = quote_identifier(&route.relation);
        Self {
            name: route.relation.clone(),
            provisioned: AtomicBool::new(false),
            insert: format!(
                r#"
INSERT INTO {table} (content)
SELECT $1
WHERE NOT EXISTS (
    SELECT 1 FROM {table} WHERE md5(content) = md5($1) AND content = $1
)
ON CONFLICT DO NOTHING
                "#
            ),
            select_key: format!(
                "SELECT id FROM {table} WHERE md5(content) = md5($1) AND content = $1 ORDER BY id LIMIT 1"
            ),
            select_message: format!(
                "SELECT id, content, processed, created_at FROM {table} WHERE md5(content) = md5($1) AND content = $1 ORDER BY id LIMIT 1"
            ),
            mark_processed: format!("UPDATE {table} SET processed = true WHERE id = $1"),
            count_processed: format!("SELECT COUNT(*) FROM {table} WHERE processed = true"),
        }
    }

    fn query_error(&self, command: &'static str, error: sqlx::Error) -> StoreError {
        match &error {
            sqlx::Error::Database(db_error) if db_error.code().as_deref() == Some(UNDEFINED_TABLE) => {
                self.provisioned.store(false, Ordering::Relaxed);
                StoreError::Schema {
                    relation: self.name.clone(),
                }
            }
            sqlx::Error::Database(db_error)
                if db_error
                    .code()
                    .is_some_and(|code| code.starts_with(DATA_EXCEPTION_CLASS)) =>
            {
                StoreError::InvalidData {
                    command,
                    relation: self.name.clone(),
                    error,
                }
            }
            _ => StoreError::Query {
                command,
                relation: self.name.clone(),
                error,
            },
        }
    }
}

/// Quote an already validated relation name. `MessageType` forbids quotes, so this is only
/// about keeping names that collide with keywords (`user`, `order`...) usable.
pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{name}\"")
}

/// Storage for message content, one relation per configured topic.
#[derive(Clone)]
pub struct ContentStore {
    pool: PgPool,
    relations: Arc<HashMap<MessageType, Relation>>,
}

impl ContentStore {
    pub fn new(pool: PgPool, router: &TopicRouter) -> Self {
        let relations = router
            .routes()
            .map(|route| (route.message_type.clone(), Relation::new(route)))
            .collect();

        Self {
            pool,
            relations: Arc::new(relations),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn relation(&self, topic: &MessageType) -> StoreResult<&Relation> {
        self.relations
            .get(topic)
            .ok_or_else(|| StoreError::UnknownTopic(topic.to_string()))
    }

    /// Check the topic's relation is provisioned, failing with `StoreError::Schema` if not.
    pub async fn exists(&self, topic: &MessageType) -> StoreResult<bool> {
        let relation = self.relation(topic)?;
        self.check_provisioned(relation).await?;
        Ok(true)
    }

    async fn check_provisioned(&self, relation: &Relation) -> StoreResult<()> {
        if relation.provisioned.load(Ordering::Relaxed) {
            return Ok(());
        }

        let exists: bool = sqlx::query_scalar(
            r#"
SELECT EXISTS (
    SELECT FROM information_schema.tables
    WHERE table_schema = current_schema()
    AND table_name = $1
)
            "#,
        )
        .bind(&relation.name)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| relation.query_error("SELECT", error))?;

        if !exists {
            return Err(StoreError::Schema {
                relation: relation.name.clone(),
            });
        }

        relation.provisioned.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Store `content` unprocessed unless the topic already holds identical content.
    ///
    /// Returns whether a new row was inserted. Concurrent calls with the same content
    /// insert at most one row: the `md5(content)` unique index turns the losing inserts
    /// into no-ops.
    pub async fn persist(&self, topic: &MessageType, content: &str) -> StoreResult<bool> {
        let relation = self.relation(topic)?;
        self.check_provisioned(relation).await?;

        match sqlx::query(&relation.insert)
            .bind(content)
            .execute(&self.pool)
            .await
        {
            Ok(result) => Ok(result.rows_affected() == 1),
            // Lost a race against a writer that committed between our check and insert.
            Err(sqlx::Error::Database(db_error)) if db_error.is_unique_violation() => Ok(false),
            Err(error) => Err(relation.query_error("INSERT", error)),
        }
    }

    /// Surrogate key of the row holding `content`.
    pub async fn find_key(&self, topic: &MessageType, content: &str) -> StoreResult<i64> {
        let relation = self.relation(topic)?;

        let key: Option<i64> = sqlx::query_scalar(&relation.select_key)
            .bind(content)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| relation.query_error("SELECT", error))?;

        key.ok_or_else(|| StoreError::NotFound {
            relation: relation.name.clone(),
        })
    }

    pub async fn find(
        &self,
        topic: &MessageType,
        content: &str,
    ) -> StoreResult<Option<StoredMessage>> {
        let relation = self.relation(topic)?;

        let row: Option<MessageRow> = sqlx::query_as(&relation.select_message)
            .bind(content)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| relation.query_error("SELECT", error))?;

        Ok(row.map(|row| StoredMessage {
            id: row.id,
            topic: topic.clone(),
            content: row.content,
            processed: row.processed,
            created_at: row.created_at,
        }))
    }

    /// Flag a row as processed. Marking an already processed row again is not an error.
    pub async fn mark_processed(&self, topic: &MessageType, key: i64) -> StoreResult<()> {
        let relation = self.relation(topic)?;

        let result = sqlx::query(&relation.mark_processed)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|error| relation.query_error("UPDATE", error))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                relation: relation.name.clone(),
            });
        }
        Ok(())
    }

    /// Number of processed rows for the topic, as currently committed.
    pub async fn count_processed(&self, topic: &MessageType) -> StoreResult<i64> {
        let relation = self.relation(topic)?;
        self.check_provisioned(relation).await?;

        sqlx::query_scalar(&relation.count_processed)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| relation.query_error("SELECT", error))
    }
}
