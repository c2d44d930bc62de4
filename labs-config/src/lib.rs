//! Configuration for the workshop lab orchestrator.
//!
//! Settings live in `labs.yaml`. Every field has a default so an empty file
//! (or no file at all) yields a working single-node setup.

pub mod config;
pub mod loader;

pub use config::{
    BroadcasterConfig, DatabaseConfig, LabsConfig, ProvisioningConfig, SchedulerConfig,
    WorkerPoolConfig,
};
pub use loader::ConfigLoader;
