use std::sync::Arc;

use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use health::HealthRegistry;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

use message_common::database::{connect_with_retry, provision};
use message_common::metrics::setup_metrics_routes;
use message_common::publisher::KafkaPublisher;
use message_common::retry::RetryPolicy;
use message_common::store::ContentStore;
use message_common::topics::TopicRouter;
use message_service::config::Config;
use message_service::consumer::ConsumerPool;
use message_service::handlers;
use message_service::ingest::IngestionService;
use message_service::logging;

async fn shutdown_signal(mut term: Signal, mut interrupt: Signal, shutdown: CancellationToken) {
    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
        _ = shutdown.cancelled() => {},
    };

    info!("shutting down gracefully...");
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env()?;
    logging::init(&config.log_config())?;

    let router = Arc::new(TopicRouter::new(&config.message_types.0)?);
    info!(
        topics = ?router.types().map(|t| t.as_str()).collect::<Vec<_>>(),
        "routing message types"
    );

    let connect_policy = RetryPolicy::new(
        2,
        config.pg_connect_backoff_ms.0,
        None,
        config.pg_connect_attempts,
    );
    let pool = connect_with_retry(
        &config.database_url,
        config.max_pg_connections,
        &connect_policy,
    )
    .await?;
    provision(&pool, &router).await?;
    let store = ContentStore::new(pool, &router);

    let liveness = HealthRegistry::new("liveness");
    let publisher = Arc::new(KafkaPublisher::new(
        &config.kafka,
        liveness.register("kafka-producer".to_owned(), time::Duration::seconds(30)),
    )?);

    let shutdown = CancellationToken::new();
    let consumers = ConsumerPool::start(
        &config.kafka,
        router.clone(),
        store.clone(),
        RetryPolicy::from(&config.retry_policy),
        &liveness,
        shutdown.clone(),
    )?;
    info!(workers = consumers.workers(), "started consumers");

    let service = IngestionService::new(router, store, publisher.clone());
    let app = handlers::add_routes(Router::new(), service, liveness);
    let app = setup_metrics_routes(app)?;

    let term = signal(SignalKind::terminate())?;
    let interrupt = signal(SignalKind::interrupt())?;
    let listener = tokio::net::TcpListener::bind(config.bind()).await?;
    info!("listening on {}", config.bind());

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(term, interrupt, shutdown.clone()))
        .await;
    if let Err(e) = &served {
        tracing::error!("failed to serve message-service http server, {}", e);
    }

    consumers.shutdown();
    consumers.join().await;
    publisher.flush()?;
    info!("shutdown complete");

    Ok(served?)
}
