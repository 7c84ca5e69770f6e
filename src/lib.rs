pub mod analytics;
pub mod chain_client;
pub mod config;
pub mod deployment;
pub mod error;
pub mod events;
pub mod ingest_worker;
pub mod query;
pub mod reconciliation;
pub mod repository;
pub mod rpc;
pub mod signals;
pub mod watcher;

#[cfg(test)]
pub(crate) mod test_utils;
