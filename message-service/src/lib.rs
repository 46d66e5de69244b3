pub mod config;
pub mod consumer;
pub mod handlers;
pub mod ingest;
pub mod logging;
