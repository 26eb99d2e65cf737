//! Infrastructure layer: job orchestration, stores, schedulers, configuration.

pub mod audit;
pub mod config;
pub mod jobs;
pub mod results;
pub mod scheduler;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, ProviderKind, WorkerConfig};
