//! Scenario Export Pipeline
//!
//! Turns chunked climate-scenario model predictions into one H3-indexed table per
//! scenario and delivers it to an external destination.
//!
//! # Architecture
//!
//! - **I/O**: object-store backed chunk store, coordination state with compare-and-set
//!   updates, and the export destination
//! - **Transform**: grid → H3 spatialization and the scenario-level merge
//! - **Pipeline**: the Spatializer, ScenarioMerger, ExportTrigger and Exporter stages,
//!   plus a scheduler that runs them together in one process
//!
//! Scenarios move through `collecting → ready → merging → merged → exported`; see
//! [`model`] for the full state machine.
//!
//! # Usage
//!
//! ```no_run
//! use scenario_export::{Config, PipelineContext, ExportTrigger};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     let ctx = PipelineContext::new(config)?;
//!     let report = ExportTrigger::new(ctx).run_once().await?;
//!     println!("{}", report);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crs;
pub mod error;
pub mod io;
pub mod model;
pub mod pipeline;
pub mod transform;

pub use config::Config;
pub use error::{PipelineError, Result};
pub use model::{
    ChunkSubmission, ExportRecord, MergedArtifact, PredictionChunk, ScenarioManifest, ScenarioStatus,
    SpatializedChunk, StudyArea,
};
pub use pipeline::{
    ExportTrigger, Exporter, Ingestor, Metrics, PipelineContext, ScenarioMerger, Scheduler, SchedulerStats,
    Spatializer, TriggerReport,
};

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> anyhow::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}

/// Initialize the Rayon thread pool used for H3 indexing.
pub fn init_rayon(threads: Option<usize>) -> anyhow::Result<()> {
    if let Some(threads) = threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()?;
    }
    Ok(())
}
