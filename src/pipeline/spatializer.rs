//! Spatializer stage: raw prediction chunk → spatialized chunk + manifest update.

use crate::error::{PipelineError, Result};
use crate::io::SubmitOutcome;
use crate::model::{validate_id, PredictionChunk, ScenarioManifest, ScenarioStatus, SpatializedChunk};
use crate::pipeline::{PipelineContext, RetryPolicy};
use crate::transform::{encode_spatialized, spatialize_chunk};
use chrono::Utc;
use std::time::Instant;

/// Outcome of spatializing one chunk.
#[derive(Debug, Clone)]
pub struct SpatializeResult {
    pub chunk: SpatializedChunk,
    pub cell_count: usize,
    /// This chunk completed the scenario (`collecting → ready`).
    pub scenario_ready: bool,
}

pub struct Spatializer {
    ctx: PipelineContext,
    retry: RetryPolicy,
}

impl Spatializer {
    pub fn new(ctx: PipelineContext, retry: RetryPolicy) -> Self {
        Self { ctx, retry }
    }

    /// Load a stored prediction chunk and spatialize it.
    pub async fn spatialize_stored(&self, scenario_id: &str, chunk_id: &str) -> Result<SpatializeResult> {
        validate_id("scenario id", scenario_id)?;
        validate_id("chunk id", chunk_id)?;
        let chunk = self
            .retry
            .run("load prediction", || self.ctx.chunks.get_prediction(scenario_id, chunk_id))
            .await?;
        self.spatialize(&chunk).await
    }

    /// Spatialize one chunk exactly once.
    ///
    /// A chunk that was already spatialized and recorded is a [`PipelineError::Conflict`].
    /// Malformed payloads are recorded against the chunk in the manifest and returned
    /// as [`PipelineError::Validation`]; they never block the scenario's other chunks.
    pub async fn spatialize(&self, chunk: &PredictionChunk) -> Result<SpatializeResult> {
        validate_id("scenario id", &chunk.scenario_id)?;
        validate_id("chunk id", &chunk.chunk_id)?;
        let start = Instant::now();

        let manifest = self
            .retry
            .run("load manifest", || self.ctx.state.manifest(&chunk.scenario_id))
            .await?;
        check_accepts(&manifest, &chunk.chunk_id)?;

        let exists = self
            .retry
            .run("check spatialized", || {
                self.ctx.chunks.spatialized_exists(&chunk.scenario_id, &chunk.chunk_id)
            })
            .await?;
        if exists {
            // Written by an earlier attempt that stopped before updating the manifest.
            return self.finish_interrupted(chunk).await;
        }

        let (geo_payload, cell_count) = match self.compute(chunk).await {
            Ok(result) => result,
            Err(e @ PipelineError::Validation { .. }) => {
                self.record_rejection(chunk, &e).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let spatialized = SpatializedChunk {
            scenario_id: chunk.scenario_id.clone(),
            chunk_id: chunk.chunk_id.clone(),
            geo_payload,
            spatialized_at: Utc::now(),
        };
        let outcome = self
            .retry
            .run("store spatialized", || self.ctx.chunks.put_spatialized(&spatialized))
            .await?;
        if outcome == SubmitOutcome::Duplicate {
            return Err(PipelineError::conflict(
                format!("{}/{}", chunk.scenario_id, chunk.chunk_id),
                "chunk spatialized concurrently",
            ));
        }

        let scenario_ready = self.record(&chunk.scenario_id, &chunk.chunk_id).await?;
        self.ctx.metrics.add_chunk_spatialized(cell_count as u64);
        self.ctx.metrics.add_spatialize_time(start.elapsed());

        tracing::info!(
            "Spatialized chunk {}/{} ({} cells)",
            chunk.scenario_id,
            chunk.chunk_id,
            cell_count
        );

        Ok(SpatializeResult {
            chunk: spatialized,
            cell_count,
            scenario_ready,
        })
    }

    async fn compute(&self, chunk: &PredictionChunk) -> Result<(String, usize)> {
        let area = self
            .retry
            .run("load study area", || self.ctx.state.load_study_area(&chunk.study_area))
            .await?;
        let chunk_id = chunk.chunk_id.clone();
        let payload = chunk.raw_payload.clone();

        // CPU-bound: H3 indexing fans out on the rayon pool
        let task = format!("spatialize {}/{}", chunk.scenario_id, chunk.chunk_id);
        let rows = run_blocking(task, move || spatialize_chunk(&area, &chunk_id, &payload)).await?;

        Ok((encode_spatialized(&rows), rows.len()))
    }

    /// Add the chunk to the manifest. Returns `true` if the scenario became ready.
    ///
    /// A retry that finds the chunk already recorded takes it as its own earlier
    /// write; the spatialized output is create-once, so no other attempt records it.
    async fn record(&self, scenario_id: &str, chunk_id: &str) -> Result<bool> {
        let mut attempt = 0;
        let (_, ready) = self
            .retry
            .run("record chunk", || {
                attempt += 1;
                let retrying = attempt > 1;
                self.ctx
                    .state
                    .update_manifest(scenario_id, move |m| record_try(m, chunk_id, retrying))
            })
            .await?;
        if ready {
            tracing::info!("Scenario {} is ready for merging", scenario_id);
        }
        Ok(ready)
    }

    async fn finish_interrupted(&self, chunk: &PredictionChunk) -> Result<SpatializeResult> {
        let content = self
            .retry
            .run("load spatialized", || {
                self.ctx.chunks.get_spatialized(&chunk.scenario_id, &chunk.chunk_id)
            })
            .await?
            .ok_or_else(|| {
                PipelineError::NotFound(format!("spatialized chunk {}/{}", chunk.scenario_id, chunk.chunk_id))
            })?;
        let geo_payload = String::from_utf8_lossy(&content).into_owned();
        let cell_count = geo_payload.lines().count().saturating_sub(1);

        let scenario_ready = self.record(&chunk.scenario_id, &chunk.chunk_id).await?;
        tracing::info!(
            "Recorded previously spatialized chunk {}/{}",
            chunk.scenario_id,
            chunk.chunk_id
        );

        Ok(SpatializeResult {
            chunk: SpatializedChunk {
                scenario_id: chunk.scenario_id.clone(),
                chunk_id: chunk.chunk_id.clone(),
                geo_payload,
                spatialized_at: Utc::now(),
            },
            cell_count,
            scenario_ready,
        })
    }

    async fn record_rejection(&self, chunk: &PredictionChunk, error: &PipelineError) {
        self.ctx.metrics.add_chunk_rejected();
        tracing::error!("Rejected chunk {}/{}: {}", chunk.scenario_id, chunk.chunk_id, error);

        let reason = error.to_string();
        let result = self
            .ctx
            .state
            .update_manifest(&chunk.scenario_id, |m| {
                if m.status == ScenarioStatus::Collecting && !m.received_chunk_ids.contains(&chunk.chunk_id) {
                    m.failed_chunks.insert(chunk.chunk_id.clone(), reason.clone());
                    m.updated_at = Utc::now();
                }
                Ok(())
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(
                "Failed to record rejection of chunk {}/{}: {}",
                chunk.scenario_id,
                chunk.chunk_id,
                e
            );
        }
    }
}

fn record_try(manifest: &mut ScenarioManifest, chunk_id: &str, retrying: bool) -> Result<bool> {
    if retrying && manifest.received_chunk_ids.contains(chunk_id) {
        return Ok(manifest.status == ScenarioStatus::Ready);
    }
    manifest.record_chunk(chunk_id)
}

async fn run_blocking<T, F>(task: String, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PipelineError::task_failed(task, e))?
}

/// Reject chunks the manifest can no longer take before doing any work.
fn check_accepts(manifest: &ScenarioManifest, chunk_id: &str) -> Result<()> {
    if manifest.received_chunk_ids.contains(chunk_id) {
        return Err(PipelineError::conflict(
            format!("{}/{}", manifest.scenario_id, chunk_id),
            "chunk already spatialized",
        ));
    }
    if manifest.status != ScenarioStatus::Collecting || manifest.is_complete() {
        return Err(PipelineError::validation(
            chunk_id,
            format!(
                "unexpected chunk for scenario {} (status {}, {} of {} chunks received)",
                manifest.scenario_id,
                manifest.status,
                manifest.received_chunk_ids.len(),
                manifest.expected_chunk_count
            ),
        ));
    }
    Ok(())
}
