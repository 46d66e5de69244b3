use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::{http::StatusCode, Json};
use serde::Serialize;
use serde_derive::Deserialize;
use tracing::{debug, error};

use crate::ingest::{IngestError, IngestionService};

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct MessagePostRequestBody {
    topic: String,
    message: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct MessagePostResponse {
    status: String,
}

#[derive(Deserialize, Debug)]
pub struct StatsQuery {
    topic: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct StatsResponse {
    processed_messages: i64,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    error: String,
}

type HandlerError = (StatusCode, Json<ErrorResponse>);

pub async fn post(
    State(service): State<IngestionService>,
    payload: Result<Json<MessagePostRequestBody>, JsonRejection>,
) -> Result<Json<MessagePostResponse>, HandlerError> {
    let Json(payload) = payload.map_err(|rejection| bad_request(rejection.body_text()))?;
    debug!(topic = %payload.topic, "received message");

    service
        .submit(&payload.topic, &payload.message)
        .await
        .map_err(ingest_error)?;

    Ok(Json(MessagePostResponse {
        status: "message received".to_owned(),
    }))
}

pub async fn stats(
    State(service): State<IngestionService>,
    query: Result<Query<StatsQuery>, QueryRejection>,
) -> Result<Json<StatsResponse>, HandlerError> {
    let Query(query) = query.map_err(|rejection| bad_request(rejection.body_text()))?;

    let processed_messages = service.stats(&query.topic).await.map_err(ingest_error)?;

    Ok(Json(StatsResponse { processed_messages }))
}

fn bad_request(message: String) -> HandlerError {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: message }))
}

fn ingest_error(err: IngestError) -> HandlerError {
    if err.is_client_error() {
        return bad_request(err.to_string());
    }

    error!("internal error: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::Ordering;

    use axum::{
        body::Body,
        http::{self, Request, StatusCode},
        Router,
    };
    use health::HealthRegistry;
    use http_body_util::BodyExt; // for `collect`
    use sqlx::PgPool;
    use tower::ServiceExt; // for `call`, `oneshot`, and `ready`

    use crate::handlers::app::add_routes;
    use crate::ingest::tests::service;
    use message_common::topics::MessageType;

    fn post_request(body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method(http::Method::POST)
            .uri("/messages")
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(body.into())
            .unwrap()
    }

    fn message_body(topic: &str, message: &str) -> String {
        serde_json::to_string(&MessagePostRequestBody {
            topic: topic.to_owned(),
            message: message.to_owned(),
        })
        .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn message_success(db: PgPool) {
        let (service, store, publisher) = service(db);
        let app = add_routes(Router::new(), service, HealthRegistry::new("liveness"));

        let response = app
            .oneshot(post_request(message_body("message", "hello")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({"status": "message received"})
        );
        assert!(store
            .find(&"message".parse().unwrap(), "hello")
            .await
            .unwrap()
            .is_some());
        assert_eq!(publisher.published.lock().unwrap().len(), 1);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn message_unknown_topic(db: PgPool) {
        let (service, _, _) = service(db);
        let app = add_routes(Router::new(), service, HealthRegistry::new("liveness"));

        let response = app
            .oneshot(post_request(message_body("pong", "hello")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({"error": "pong is not a configured message type"})
        );
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn message_empty_content(db: PgPool) {
        let (service, _, _) = service(db);
        let app = add_routes(Router::new(), service, HealthRegistry::new("liveness"));

        let response = app
            .oneshot(post_request(message_body("message", "")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn message_nul_content(db: PgPool) {
        let (service, _, publisher) = service(db);
        let app = add_routes(Router::new(), service, HealthRegistry::new("liveness"));

        let response = app
            .oneshot(post_request(r#"{"topic": "message", "message": "a\u0000b"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({"error": "message content must not contain NUL characters"})
        );
        assert!(publisher.published.lock().unwrap().is_empty());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn message_payload_missing_fields(db: PgPool) {
        let (service, _, _) = service(db);
        let app = add_routes(Router::new(), service, HealthRegistry::new("liveness"));

        let response = app
            .oneshot(post_request(r#"{"topic": "message"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"].is_string());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn message_payload_not_json(db: PgPool) {
        let (service, _, _) = service(db);
        let app = add_routes(Router::new(), service, HealthRegistry::new("liveness"));

        let response = app.oneshot(post_request("x")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn message_publish_failure(db: PgPool) {
        let (service, store, publisher) = service(db);
        publisher.unavailable.store(true, Ordering::SeqCst);
        let app = add_routes(Router::new(), service, HealthRegistry::new("liveness"));

        let response = app
            .oneshot(post_request(message_body("message", "stranded")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_json(response).await["error"].is_string());
        assert!(store
            .find(&"message".parse().unwrap(), "stranded")
            .await
            .unwrap()
            .is_some());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn stats_counts_processed(db: PgPool) {
        let (service, store, _) = service(db);
        let message: MessageType = "message".parse().unwrap();
        store.persist(&message, "a").await.unwrap();
        store.persist(&message, "b").await.unwrap();
        let key = store.find_key(&message, "a").await.unwrap();
        store.mark_processed(&message, key).await.unwrap();
        let app = add_routes(Router::new(), service, HealthRegistry::new("liveness"));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/stats?topic=message")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({"processed_messages": 1})
        );
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn stats_bad_topic(db: PgPool) {
        let (service, _, _) = service(db);
        let app = add_routes(Router::new(), service, HealthRegistry::new("liveness"));

        for uri in ["/stats", "/stats?topic=pong"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
        }
    }
}
