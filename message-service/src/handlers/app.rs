use axum::{routing, Router};
use health::HealthRegistry;

use crate::ingest::IngestionService;

use super::messages;

pub fn add_routes(router: Router, service: IngestionService, liveness: HealthRegistry) -> Router {
    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route(
            "/_liveness",
            routing::get(move || std::future::ready(liveness.get_status())),
        )
        .route(
            "/messages",
            routing::post(messages::post).with_state(service.clone()),
        )
        .route("/stats", routing::get(messages::stats).with_state(service))
}

pub async fn index() -> &'static str {
    "message service"
}
