//! Exporter stage: deliver a merged artifact to its external destination.

use crate::error::{PipelineError, Result};
use crate::io::render_destination_uri;
use crate::model::{validate_id, Claim, ExportRecord, MergedArtifact, ScenarioManifest, ScenarioStatus};
use crate::pipeline::retry::with_deadline;
use crate::pipeline::{PipelineContext, RetryPolicy};
use bytes::Bytes;
use chrono::Utc;
use std::time::Instant;
use uuid::Uuid;

pub struct Exporter {
    ctx: PipelineContext,
    retry: RetryPolicy,
}

impl Exporter {
    /// `retry` bounds the delivery attempts; storage reads use the context's policy.
    pub fn new(ctx: PipelineContext, retry: RetryPolicy) -> Self {
        Self { ctx, retry }
    }

    /// Export a `merged` scenario.
    ///
    /// Every attempt is counted on the [`ExportRecord`] before it starts. `exported_at`
    /// is set only after the destination confirms the full artifact. When attempts run
    /// out the scenario moves to `failed` and [`PipelineError::ExportExhausted`] is returned.
    pub async fn export(&self, scenario_id: &str) -> Result<ExportRecord> {
        validate_id("scenario id", scenario_id)?;
        let start = Instant::now();
        let storage_retry = self.ctx.retry_policy();
        let state = &self.ctx.state;

        let manifest = storage_retry
            .run("load manifest", || state.manifest(scenario_id))
            .await?;
        match manifest.status {
            ScenarioStatus::Merged => {}
            ScenarioStatus::Exported => {
                return Err(PipelineError::conflict(
                    format!("exports/{}", scenario_id),
                    "scenario already exported",
                ))
            }
            status => {
                return Err(PipelineError::InvalidState {
                    scenario_id: scenario_id.to_string(),
                    expected: ScenarioStatus::Merged.to_string(),
                    actual: status.to_string(),
                })
            }
        }

        let artifact = storage_retry
            .run("load artifact record", || state.load_artifact(scenario_id))
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("merged artifact for scenario {}", scenario_id)))?;
        if let Err(e) = check_complete(&manifest, &artifact) {
            tracing::error!("Refusing to export {}: {}", scenario_id, e);
            self.fail_scenario(scenario_id, &e.to_string()).await;
            return Err(e);
        }

        let uri = render_destination_uri(
            &self.ctx.config.export.destination_uri_template,
            scenario_id,
            &manifest.study_area,
            Utc::now(),
        );
        let fresh = ExportRecord::new(scenario_id, &uri);
        storage_retry
            .run("create export record", || state.create_export_record(&fresh))
            .await?;

        let (record, owner) = match self.claim(scenario_id).await {
            Ok(claimed) => claimed,
            Err(e) => {
                if e.is_conflict() {
                    self.ctx.metrics.add_claim_conflict();
                    tracing::debug!("Skipping export of {}: {}", scenario_id, e);
                }
                return Err(e);
            }
        };
        if record.is_exported() {
            // Delivered by an earlier attempt that stopped before updating the manifest.
            self.mark_exported(scenario_id).await?;
            return Ok(record);
        }

        let content = match storage_retry
            .run("load merged artifact", || self.ctx.chunks.get_merged(scenario_id))
            .await
        {
            Ok(content) => content,
            Err(e) => {
                self.release(scenario_id, owner, &e).await;
                return Err(e);
            }
        };

        match self.deliver(scenario_id, owner, &record.destination_uri, content).await {
            Ok(bytes) => {
                let record = self.complete(scenario_id, owner).await?;
                self.mark_exported(scenario_id).await?;
                self.ctx.metrics.add_scenario_exported(bytes);
                self.ctx.metrics.add_export_time(start.elapsed());
                tracing::info!(
                    "Exported scenario {} to {} after {} attempt(s)",
                    scenario_id,
                    record.destination_uri,
                    record.attempt_count
                );
                Ok(record)
            }
            Err(e) if e.is_conflict() => Err(e),
            Err(e) => {
                let (record, _) = state
                    .update_export_record(scenario_id, |r| {
                        if r.is_claimed_by(owner) {
                            r.claim = None;
                        }
                        r.last_error = Some(e.to_string());
                        Ok(())
                    })
                    .await?;
                let exhausted = PipelineError::ExportExhausted {
                    scenario_id: scenario_id.to_string(),
                    attempts: record.attempt_count,
                    last_error: e.to_string(),
                };
                tracing::error!("{}", exhausted);
                self.fail_scenario(scenario_id, &exhausted.to_string()).await;
                Err(exhausted)
            }
        }
    }

    /// Write and confirm the artifact, retrying under the export policy.
    /// Returns the number of bytes delivered.
    async fn deliver(&self, scenario_id: &str, owner: Uuid, uri: &str, content: Bytes) -> Result<u64> {
        let expected_len = content.len() as u64;
        let timeout = self.ctx.config.processing.operation_timeout() * 2;
        let lease = self.ctx.config.processing.claim_lease();
        let key = format!("exports/{}", scenario_id);
        let operation = format!("export to {}", uri);
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.ctx
                .state
                .update_export_record(scenario_id, |r| match r.claim.as_mut() {
                    Some(claim) if claim.owner == owner => {
                        claim.renew(lease);
                        r.attempt_count += 1;
                        Ok(())
                    }
                    _ => Err(PipelineError::conflict(&key, "export claim lost")),
                })
                .await?;
            self.ctx.metrics.add_export_attempt();

            let result = with_deadline(timeout, &operation, async {
                self.ctx.destination.write(uri, content.clone()).await?;
                self.ctx.destination.confirm(uri, expected_len).await
            })
            .await;

            match result {
                Ok(()) => return Ok(expected_len),
                Err(e) if !e.is_retriable() || attempt >= self.retry.max_attempts => return Err(e),
                Err(e) => {
                    let backoff = self.retry.backoff(attempt);
                    tracing::warn!(
                        "Export of {} attempt {} failed: {}, retrying in {}ms",
                        scenario_id,
                        attempt,
                        e,
                        backoff.as_millis()
                    );
                    self.ctx.metrics.add_transient_failure();
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Take the export claim, or an expired one.
    async fn claim(&self, scenario_id: &str) -> Result<(ExportRecord, Uuid)> {
        let lease = self.ctx.config.processing.claim_lease();
        let key = format!("exports/{}", scenario_id);
        self.ctx
            .state
            .update_export_record(scenario_id, |r| {
                if r.is_exported() {
                    return Ok(Uuid::nil());
                }
                if r.is_claimed() {
                    return Err(PipelineError::conflict(&key, "export already in progress"));
                }
                let claim = Claim::new(lease);
                let owner = claim.owner;
                r.claim = Some(claim);
                Ok(owner)
            })
            .await
    }

    async fn complete(&self, scenario_id: &str, owner: Uuid) -> Result<ExportRecord> {
        let key = format!("exports/{}", scenario_id);
        let (record, _) = self
            .ctx
            .state
            .update_export_record(scenario_id, |r| {
                if !r.is_claimed_by(owner) {
                    return Err(PipelineError::conflict(&key, "export claim lost before completion"));
                }
                r.exported_at = Some(Utc::now());
                r.claim = None;
                r.last_error = None;
                Ok(())
            })
            .await?;
        Ok(record)
    }

    async fn release(&self, scenario_id: &str, owner: Uuid, error: &PipelineError) {
        let result = self
            .ctx
            .state
            .update_export_record(scenario_id, |r| {
                if r.is_claimed_by(owner) {
                    r.claim = None;
                    r.last_error = Some(error.to_string());
                }
                Ok(())
            })
            .await;
        if let Err(e) = result {
            tracing::warn!("Failed to release export claim on {}: {}", scenario_id, e);
        }
    }

    /// `merged → exported` for a scenario whose record shows a confirmed delivery.
    pub async fn mark_exported(&self, scenario_id: &str) -> Result<()> {
        self.ctx
            .state
            .update_manifest(scenario_id, |m| {
                if m.status != ScenarioStatus::Exported {
                    m.transition(ScenarioStatus::Exported)?;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn fail_scenario(&self, scenario_id: &str, reason: &str) {
        let result = self
            .ctx
            .state
            .update_manifest(scenario_id, |m| {
                if !m.status.is_terminal() {
                    m.fail(reason)?;
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

/// The artifact must cover exactly the chunks the manifest expected.
fn check_complete(manifest: &ScenarioManifest, artifact: &MergedArtifact) -> Result<()> {
    let merged_matches = artifact.chunk_ids.len() == manifest.expected_chunk_count
        && artifact.chunk_ids.iter().all(|id| manifest.received_chunk_ids.contains(id));
    if merged_matches {
        return Ok(());
    }
    Err(PipelineError::FatalAggregation {
        scenario_id: manifest.scenario_id.clone(),
        message: format!(
            "merged artifact covers {} chunks, scenario expects {}",
            artifact.chunk_ids.len(),
            manifest.expected_chunk_count
        ),
    })
}
