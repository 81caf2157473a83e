//! Pipeline stages and their orchestration.
//!
//! Each stage is a small struct built from a shared [`PipelineContext`]. Stages only
//! talk to each other through the chunk store and the coordination records, so they
//! can run in one process (see [`Scheduler`]) or as separate invocations.

mod context;
mod exporter;
mod ingest;
mod merger;
mod metrics;
mod retry;
mod scheduler;
mod spatializer;
mod trigger;


pub use context::PipelineContext;
pub use exporter::Exporter;
pub use ingest::{split_batch_file, Ingestor};
pub use merger::ScenarioMerger;
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use retry::RetryPolicy;
pub use scheduler::{Scheduler, SchedulerStats};
pub use spatializer::{SpatializeResult, Spatializer};
pub use trigger::{ExportTrigger, TriggerReport};
