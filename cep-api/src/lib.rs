pub mod api;
pub mod batch;
pub mod chain;
pub mod config;
pub mod event;
pub mod handlers;
pub mod ingest;
pub mod metrics;
pub mod normalize;
pub mod provider;
pub mod providers;
pub mod router;
pub mod store;
pub mod stream;
pub mod test_utils;
