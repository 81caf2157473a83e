//! Storage for chunks, artifacts, coordination state and export destinations.

mod chunk_store;
mod destination;
mod state_store;
mod store;

pub use chunk_store::{ChunkStore, SubmitOutcome};
pub use destination::{render_destination_uri, ExportDestination, ObjectStoreDestination};
pub use state_store::{StateStore, Versioned};
pub use store::{parse_object_uri, Scheme, StoreLocation, StoreRegistry};

use crate::error::{PipelineError, Result};
use std::future::Future;
use std::time::{Duration, Instant};

/// Run a storage call with a deadline, mapping object store errors into the pipeline taxonomy.
pub(crate) async fn timed<T, F>(operation: &str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, object_store::Error>>,
{
    let start = Instant::now();
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(PipelineError::from),
        Err(_) => Err(PipelineError::Timeout {
            operation: operation.to_string(),
            elapsed: start.elapsed(),
        }),
    }
}
