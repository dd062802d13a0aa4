//! Infrastructure layer: job store, work queue, ingestion, workers, config.

pub mod config;
pub mod handlers;
pub mod ingestion;
pub mod query;
pub mod queue;
pub mod store;
pub mod worker;

mod pipeline_tests;
