pub mod config;
pub mod database;
pub mod metrics;
pub mod publisher;
pub mod retry;
pub mod store;
pub mod topics;
