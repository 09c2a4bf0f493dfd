pub mod config;
pub mod consumer;
pub mod dedup;
pub mod error;
pub mod health;
pub mod inbox;
pub mod message;
pub mod metrics_consts;
pub mod pipeline;
pub mod publish;
pub mod reader;
pub mod server;
pub mod store;
pub mod upload;
pub mod worker;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
