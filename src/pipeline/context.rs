//! Shared handles every stage is built from.

use crate::config::Config;
use crate::io::{ChunkStore, ExportDestination, ObjectStoreDestination, StateStore, StoreRegistry};
use crate::pipeline::{Metrics, RetryPolicy};
use std::sync::Arc;

/// Stores, destination, metrics and configuration for one pipeline process.
#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<Config>,
    pub registry: Arc<StoreRegistry>,
    pub chunks: ChunkStore,
    pub state: StateStore,
    pub destination: Arc<dyn ExportDestination>,
    pub metrics: Arc<Metrics>,
}

impl PipelineContext {
    /// Open every store named in `config` with a fresh registry.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let registry = Arc::new(StoreRegistry::new(config.aws.clone()));
        Self::with_registry(config, registry)
    }

    /// Open every store named in `config` through an existing registry.
    pub fn with_registry(config: Config, registry: Arc<StoreRegistry>) -> anyhow::Result<Self> {
        let timeout = config.processing.operation_timeout();
        let chunks = ChunkStore::from_config(&config, &registry)?;
        let state = StateStore::new(registry.open(&config.storage.state)?, timeout);
        let destination: Arc<dyn ExportDestination> =
            Arc::new(ObjectStoreDestination::new(registry.clone(), timeout));

        Ok(Self {
            config: Arc::new(config),
            registry,
            chunks,
            state,
            destination,
            metrics: Metrics::new(),
        })
    }

    /// Replace the export destination.
    pub fn with_destination(mut self, destination: Arc<dyn ExportDestination>) -> Self {
        self.destination = destination;
        self
    }

    /// Policy for storage calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.config.retry)
    }

    /// Policy for export attempts.
    pub fn export_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.config.export_retry)
    }
}
