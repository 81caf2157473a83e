//! ScenarioMerger stage: all spatialized chunks of a scenario → one merged artifact.
//!
//! A merge runs under a claim on the manifest (`ready → merging`), so at most one
//! attempt per scenario is in flight. The claim is released back to `ready` when the
//! attempt hits a retriable error or times out, and the scenario is marked `failed`
//! when the spatialized data itself is inconsistent.

use crate::error::{PipelineError, Result};
use crate::model::{validate_id, Claim, MergedArtifact, ScenarioManifest, ScenarioStatus};
use crate::pipeline::retry::with_deadline;
use crate::pipeline::{PipelineContext, RetryPolicy};
use crate::transform::{merge_spatialized, MergeOutput};
use bytes::Bytes;
use chrono::Utc;
use std::time::Instant;
use uuid::Uuid;

enum Claimed {
    Taken(ScenarioManifest),
    /// An earlier attempt with the same owner already completed the merge.
    AlreadyMerged,
}

pub struct ScenarioMerger {
    ctx: PipelineContext,
    retry: RetryPolicy,
}

impl ScenarioMerger {
    pub fn new(ctx: PipelineContext, retry: RetryPolicy) -> Self {
        Self { ctx, retry }
    }

    /// Merge a `ready` scenario, retrying retriable failures under the stage's policy.
    ///
    /// All attempts of one call share an owner id, so a retry whose earlier attempt
    /// already completed the merge returns that artifact instead of a conflict.
    /// Returns [`PipelineError::Conflict`] if another attempt holds the claim or the
    /// scenario was already merged by someone else.
    pub async fn merge(&self, scenario_id: &str) -> Result<MergedArtifact> {
        validate_id("scenario id", scenario_id)?;
        let owner = Uuid::new_v4();
        self.retry
            .run(&format!("merge scenario {}", scenario_id), || self.attempt(scenario_id, owner))
            .await
    }

    /// One claimed merge attempt.
    pub async fn merge_once(&self, scenario_id: &str) -> Result<MergedArtifact> {
        validate_id("scenario id", scenario_id)?;
        self.attempt(scenario_id, Uuid::new_v4()).await
    }

    async fn attempt(&self, scenario_id: &str, owner: Uuid) -> Result<MergedArtifact> {
        let start = Instant::now();
        let manifest = match self.claim(scenario_id, owner).await {
            Ok(Claimed::Taken(manifest)) => manifest,
            Ok(Claimed::AlreadyMerged) => {
                tracing::info!("Merge of {} completed by an earlier attempt", scenario_id);
                return self.stored_artifact(scenario_id).await;
            }
            Err(e) => {
                if e.is_conflict() {
                    self.ctx.metrics.add_claim_conflict();
                    tracing::debug!("Skipping merge of {}: {}", scenario_id, e);
                }
                return Err(e);
            }
        };

        let lease = self.ctx.config.processing.claim_lease();
        let operation = format!("merge scenario {}", scenario_id);
        let result = with_deadline(lease, &operation, self.build(&manifest)).await;
        self.settle(scenario_id, owner, start, result).await
    }

    /// Apply the outcome of a claimed attempt to the manifest.
    async fn settle(
        &self,
        scenario_id: &str,
        owner: Uuid,
        start: Instant,
        result: Result<MergedArtifact>,
    ) -> Result<MergedArtifact> {
        match result {
            Ok(artifact) => {
                self.complete(scenario_id, owner).await?;
                self.ctx.metrics.add_scenario_merged();
                self.ctx.metrics.add_merge_time(start.elapsed());
                tracing::info!(
                    "Merged scenario {} ({} chunks, {} cells, {} bytes)",
                    scenario_id,
                    artifact.chunk_ids.len(),
                    artifact.cell_count,
                    artifact.size_bytes
                );
                Ok(artifact)
            }
            Err(e) if e.is_retriable() => {
                tracing::warn!("Merge of {} aborted, releasing claim: {}", scenario_id, e);
                self.release(scenario_id, owner).await;
                Err(e)
            }
            Err(e) => {
                tracing::error!("Merge of {} failed: {}", scenario_id, e);
                self.fail(scenario_id, owner, &e).await;
                Err(e)
            }
        }
    }

    async fn stored_artifact(&self, scenario_id: &str) -> Result<MergedArtifact> {
        self.retry
            .run("load artifact record", || self.ctx.state.load_artifact(scenario_id))
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("merged artifact for scenario {}", scenario_id)))
    }

    /// Read the scenario's spatialized chunks in id order and combine them.
    ///
    /// Has no effect on coordination state, so it can be used to re-derive an artifact.
    pub async fn assemble(&self, manifest: &ScenarioManifest) -> Result<MergeOutput> {
        let scenario_id = &manifest.scenario_id;
        if !manifest.is_complete() {
            return Err(PipelineError::InvalidState {
                scenario_id: scenario_id.clone(),
                expected: format!("{} received chunks", manifest.expected_chunk_count),
                actual: format!("{} received chunks", manifest.received_chunk_ids.len()),
            });
        }

        let mut chunks = Vec::with_capacity(manifest.received_chunk_ids.len());
        for chunk_id in &manifest.received_chunk_ids {
            let content = self
                .retry
                .run("load spatialized", || self.ctx.chunks.get_spatialized(scenario_id, chunk_id))
                .await?
                .ok_or_else(|| PipelineError::MissingChunk {
                    scenario_id: scenario_id.clone(),
                    chunk_id: chunk_id.clone(),
                })?;
            chunks.push((chunk_id.clone(), content));
        }

        let id = scenario_id.clone();
        tokio::task::spawn_blocking(move || merge_spatialized(&id, &chunks))
            .await
            .map_err(|e| PipelineError::FatalAggregation {
                scenario_id: scenario_id.clone(),
                message: format!("merge task failed: {}", e),
            })?
    }

    async fn build(&self, manifest: &ScenarioManifest) -> Result<MergedArtifact> {
        let scenario_id = &manifest.scenario_id;
        let output = self.assemble(manifest).await?;

        let content = Bytes::from(output.content);
        let size_bytes = content.len() as u64;
        self.retry
            .run("store merged", || self.ctx.chunks.put_merged(scenario_id, content.clone()))
            .await?;

        let artifact = MergedArtifact {
            scenario_id: scenario_id.clone(),
            study_area: manifest.study_area.clone(),
            artifact_uri: self.ctx.chunks.merged_uri(scenario_id),
            chunk_ids: manifest.received_chunk_ids.iter().cloned().collect(),
            cell_count: output.cell_count,
            size_bytes,
            merged_at: Utc::now(),
        };
        self.retry
            .run("store artifact record", || self.ctx.state.put_artifact(&artifact))
            .await?;
        Ok(artifact)
    }

    /// `ready → merging`, or take over a `merging` claim whose lease ran out.
    async fn claim(&self, scenario_id: &str, owner: Uuid) -> Result<Claimed> {
        let lease = self.ctx.config.processing.claim_lease();
        let key = format!("manifests/{}", scenario_id);

        let (manifest, claimed) = self
            .ctx
            .state
            .update_manifest(scenario_id, |m| {
                match m.status {
                    ScenarioStatus::Ready => m.transition(ScenarioStatus::Merging)?,
                    ScenarioStatus::Merging if m.is_claimed_by(owner) => {}
                    ScenarioStatus::Merging if m.claim.as_ref().map_or(true, |c| c.is_expired()) => {
                        tracing::warn!("Taking over expired merge claim on {}", scenario_id);
                    }
                    ScenarioStatus::Merging => {
                        return Err(PipelineError::conflict(&key, "merge already in progress"));
                    }
                    ScenarioStatus::Merged | ScenarioStatus::Exported if m.merged_by == Some(owner) => {
                        return Ok(false);
                    }
                    ScenarioStatus::Merged | ScenarioStatus::Exported => {
                        return Err(PipelineError::conflict(&key, "scenario already merged"));
                    }
                    status => {
                        return Err(PipelineError::InvalidState {
                            scenario_id: scenario_id.to_string(),
                            expected: ScenarioStatus::Ready.to_string(),
                            actual: status.to_string(),
                        })
                    }
                }
                m.claim = Some(Claim::held_by(owner, lease));
                m.updated_at = Utc::now();
                Ok(true)
            })
            .await?;
        Ok(if claimed {
            Claimed::Taken(manifest)
        } else {
            Claimed::AlreadyMerged
        })
    }

    /// `merging → merged`, only while `owner` still holds the claim.
    ///
    /// A retry after a lost response finds its own completion and succeeds.
    async fn complete(&self, scenario_id: &str, owner: Uuid) -> Result<()> {
        let key = format!("manifests/{}", scenario_id);
        self.retry
            .run("complete merge", || {
                self.ctx.state.update_manifest(scenario_id, |m| {
                    if m.merged_by == Some(owner) {
                        return Ok(());
                    }
                    if m.status != ScenarioStatus::Merging || !m.is_claimed_by(owner) {
                        return Err(PipelineError::conflict(&key, "merge claim lost before completion"));
                    }
                    m.transition(ScenarioStatus::Merged)?;
                    m.claim = None;
                    m.merged_by = Some(owner);
                    Ok(())
                })
            })
            .await?;
        Ok(())
    }

    /// `merging → ready` so another attempt can proceed.
    async fn release(&self, scenario_id: &str, owner: Uuid) {
        let result = self
            .ctx
            .state
            .update_manifest(scenario_id, |m| {
                if m.status == ScenarioStatus::Merging && m.is_claimed_by(owner) {
                    m.transition(ScenarioStatus::Ready)?;
                    m.claim = None;
                }
                Ok(())
            })
            .await;
        if let Err(e) = result {
            tracing::warn!("Failed to release merge claim on {}: {}", scenario_id, e);
        }
    }

    async fn fail(&self, scenario_id: &str, owner: Uuid, error: &PipelineError) {
        let reason = format!("{}: {}", error.kind(), error);
        let result = self
            .ctx
            .state
            .update_manifest(scenario_id, |m| {
                if m.is_claimed_by(owner) && !m.status.is_terminal() {
                    m.fail(reason.clone())?;
                }
                Ok(())
            })
            .await;
        match result {
            Ok(_) => self.ctx.metrics.add_scenario_failed(),
            Err(e) => tracing::warn!("Failed to mark {} as failed: {}", scenario_id, e),
        }
    }
}
