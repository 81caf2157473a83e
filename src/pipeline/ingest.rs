//! Inbound chunk submissions and batch prediction files.

use crate::error::{PipelineError, Result};
use crate::io::SubmitOutcome;
use crate::model::{validate_id, ChunkSubmission, PredictionChunk, ScenarioManifest, StudyArea};
use crate::pipeline::{PipelineContext, RetryPolicy};
use chrono::Utc;
use serde_json::Value;

/// Accepts prediction chunks into the chunk store and opens scenario manifests.
pub struct Ingestor {
    ctx: PipelineContext,
    retry: RetryPolicy,
}

impl Ingestor {
    pub fn new(ctx: PipelineContext, retry: RetryPolicy) -> Self {
        Self { ctx, retry }
    }

    /// Store one chunk and make sure its scenario has a manifest.
    ///
    /// Resubmitting a chunk is acknowledged without rewriting it.
    pub async fn submit(&self, submission: &ChunkSubmission) -> Result<SubmitOutcome> {
        validate_id("scenario id", &submission.scenario_id)?;
        validate_id("chunk id", &submission.chunk_id)?;
        validate_id("study area", &submission.study_area)?;
        if submission.expected_chunk_count == 0 {
            return Err(PipelineError::validation(
                &submission.scenario_id,
                "expected_chunk_count must be > 0",
            ));
        }

        let state = &self.ctx.state;
        state.load_study_area(&submission.study_area).await?;

        let fresh = ScenarioManifest::new(
            &submission.scenario_id,
            &submission.study_area,
            submission.expected_chunk_count,
        );
        let manifest = self
            .retry
            .run("create manifest", || state.create_manifest(&fresh))
            .await?;
        if manifest.expected_chunk_count != submission.expected_chunk_count {
            return Err(PipelineError::validation(
                &submission.chunk_id,
                format!(
                    "scenario {} expects {} chunks, submission says {}",
                    manifest.scenario_id, manifest.expected_chunk_count, submission.expected_chunk_count
                ),
            ));
        }
        if manifest.study_area != submission.study_area {
            return Err(PipelineError::validation(
                &submission.chunk_id,
                format!(
                    "scenario {} belongs to study area {}, submission says {}",
                    manifest.scenario_id, manifest.study_area, submission.study_area
                ),
            ));
        }

        let chunk = PredictionChunk {
            scenario_id: submission.scenario_id.clone(),
            study_area: submission.study_area.clone(),
            chunk_id: submission.chunk_id.clone(),
            raw_payload: submission.raw_payload.clone(),
            received_at: Utc::now(),
        };
        let outcome = self
            .retry
            .run("store prediction", || self.ctx.chunks.put_prediction(&chunk))
            .await?;

        match outcome {
            SubmitOutcome::Stored => {
                self.ctx.metrics.add_chunk_received();
                tracing::debug!("Received chunk {}/{}", chunk.scenario_id, chunk.chunk_id);
            }
            SubmitOutcome::Duplicate => {
                tracing::debug!("Chunk {}/{} already received", chunk.scenario_id, chunk.chunk_id);
            }
        }
        Ok(outcome)
    }
}

/// Split a batch prediction file (JSON lines, one chunk per line) into submissions.
///
/// Each line carries its chunk id in `instance.key`, as a string or a number.
/// The scenario is expected to cover every chunk of the study area.
pub fn split_batch_file(area: &StudyArea, scenario_id: &str, contents: &str) -> Result<Vec<ChunkSubmission>> {
    let mut submissions = Vec::new();

    for (i, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let value: Value = serde_json::from_str(line).map_err(|e| {
            PipelineError::validation(scenario_id, format!("line {}: invalid JSON: {}", i + 1, e))
        })?;
        let chunk_id = match value.pointer("/instance/key") {
            Some(Value::String(key)) => key.clone(),
            Some(Value::Number(key)) => key.to_string(),
            _ => {
                return Err(PipelineError::validation(
                    scenario_id,
                    format!("line {}: missing instance.key", i + 1),
                ))
            }
        };

        submissions.push(ChunkSubmission {
            scenario_id: scenario_id.to_string(),
            study_area: area.name.clone(),
            chunk_id,
            expected_chunk_count: area.chunk_count(),
            raw_payload: line.to_string(),
        });
    }
    Ok(submissions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::ChunkGeometry;
    use std::collections::BTreeMap;

    fn area() -> StudyArea {
        let mut chunks = BTreeMap::new();
        for (id, x) in [("1", 0), ("2", 1)] {
            chunks.insert(
                id.to_string(),
                ChunkGeometry {
                    row_count: 1,
                    col_count: 1,
                    x_ll_corner: -74.0 + x as f64 * 0.001,
                    y_ll_corner: 40.7,
                    x_index: x,
                    y_index: 0,
                },
            );
        }
        StudyArea {
            name: "nyc".to_string(),
            crs: "EPSG:4326".to_string(),
            cell_size: 0.001,
            chunk_x_count: 2,
            chunk_y_count: 1,
            chunks,
        }
    }

    async fn ingestor() -> Ingestor {
        let ctx = PipelineContext::new(Config::in_memory()).unwrap();
        ctx.state.put_study_area(&area()).await.unwrap();
        Ingestor::new(ctx, RetryPolicy::none())
    }

    fn submission(chunk_id: &str, expected: usize) -> ChunkSubmission {
        ChunkSubmission {
            scenario_id: "s1".to_string(),
            study_area: "nyc".to_string(),
            chunk_id: chunk_id.to_string(),
            expected_chunk_count: expected,
            raw_payload: r#"{"prediction": [[1.0]]}"#.to_string(),
        }
    }

    #[test]
    fn test_split_batch_file_reads_keys() {
        let contents = concat!(
            "{\"instance\": {\"values\": [1], \"key\": 1}, \"prediction\": [[1.0]]}\n",
            "\n",
            "{\"instance\": {\"values\": [2], \"key\": \"2\"}, \"prediction\": [[2.0]]}\n",
        );
        let submissions = split_batch_file(&area(), "s1", contents).unwrap();
        assert_eq!(submissions.len(), 2);
        assert_eq!(submissions[0].chunk_id, "1");
        assert_eq!(submissions[1].chunk_id, "2");
        assert!(submissions.iter().all(|s| s.expected_chunk_count == 2));
        assert!(submissions[1].raw_payload.contains("[[2.0]]"));
    }

    #[test]
    fn test_split_batch_file_requires_key() {
        let err = split_batch_file(&area(), "s1", "{\"prediction\": [[1.0]]}\n").unwrap_err();
        assert!(err.to_string().contains("instance.key"));
    }

    #[tokio::test]
    async fn test_submit_creates_manifest() {
        let ingestor = ingestor().await;
        let outcome = ingestor.submit(&submission("1", 2)).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Stored);

        let manifest = ingestor.ctx.state.manifest("s1").await.unwrap();
        assert_eq!(manifest.expected_chunk_count, 2);
        assert!(manifest.received_chunk_ids.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_submission_is_acknowledged() {
        let ingestor = ingestor().await;
        ingestor.submit(&submission("1", 2)).await.unwrap();
        let outcome = ingestor.submit(&submission("1", 2)).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_submit_rejects_mismatched_expected_count() {
        let ingestor = ingestor().await;
        ingestor.submit(&submission("1", 2)).await.unwrap();
        let err = ingestor.submit(&submission("2", 3)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation { .. }));

        let err = ingestor.submit(&submission("2", 0)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_submit_rejects_unknown_study_area() {
        let ingestor = ingestor().await;
        let mut bad = submission("1", 2);
        bad.study_area = "nowhere".to_string();
        assert!(matches!(
            ingestor.submit(&bad).await.unwrap_err(),
            PipelineError::Validation { .. }
        ));
    }
}
