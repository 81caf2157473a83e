//! Pipeline entities and the scenario status state machine.
//!
//! ```text
//! collecting ──▶ ready ──▶ merging ──▶ merged ──▶ exported
//!                  ▲          │
//!                  └──────────┘ (abort / retry)
//!
//! (any non-terminal) ──▶ failed
//! ```

use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Check that an identifier can be embedded in an object path.
pub fn validate_id(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(PipelineError::validation(kind, "identifier must not be empty"));
    }
    if id.contains('/') || id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(PipelineError::validation(
            id,
            format!("{kind} must not contain '/', whitespace or control characters"),
        ));
    }
    Ok(())
}

/// Inbound chunk submission, as forwarded by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSubmission {
    pub scenario_id: String,
    pub study_area: String,
    pub chunk_id: String,
    pub expected_chunk_count: usize,
    pub raw_payload: String,
}

/// Raw model predictions for one chunk. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictionChunk {
    pub scenario_id: String,
    pub study_area: String,
    pub chunk_id: String,
    pub raw_payload: String,
    pub received_at: DateTime<Utc>,
}

/// Geo-referenced predictions for one chunk, derived 1:1 from a [`PredictionChunk`].
#[derive(Debug, Clone, PartialEq)]
pub struct SpatializedChunk {
    pub scenario_id: String,
    pub chunk_id: String,
    /// CSV table `h3_index,prediction,owned`.
    pub geo_payload: String,
    pub spatialized_at: DateTime<Utc>,
}

/// Lifecycle of a scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStatus {
    Collecting,
    Ready,
    Merging,
    Merged,
    Exported,
    Failed,
}

impl ScenarioStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exported | Self::Failed)
    }

    /// Whether `self → next` is an edge of the state machine.
    pub fn can_transition_to(self, next: ScenarioStatus) -> bool {
        use ScenarioStatus::*;
        match (self, next) {
            (Collecting, Ready)
            | (Ready, Merging)
            | (Merging, Merged)
            | (Merging, Ready)
            | (Merged, Exported) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Collecting => "collecting",
            Self::Ready => "ready",
            Self::Merging => "merging",
            Self::Merged => "merged",
            Self::Exported => "exported",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ScenarioStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exclusive responsibility for the next processing step, bounded by a lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub owner: Uuid,
    pub claimed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Claim {
    /// A fresh claim held by a new owner for `lease`.
    pub fn new(lease: std::time::Duration) -> Self {
        Self::held_by(Uuid::new_v4(), lease)
    }

    pub fn held_by(owner: Uuid, lease: std::time::Duration) -> Self {
        let now = Utc::now();
        Self {
            owner,
            claimed_at: now,
            expires_at: lease_end(now, lease),
        }
    }

    /// Extend the claim to `lease` from now, keeping the owner.
    pub fn renew(&mut self, lease: std::time::Duration) {
        self.expires_at = lease_end(Utc::now(), lease);
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

fn lease_end(from: DateTime<Utc>, lease: std::time::Duration) -> DateTime<Utc> {
    let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
    from.checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Per-scenario coordination record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioManifest {
    pub scenario_id: String,
    pub study_area: String,
    pub expected_chunk_count: usize,
    pub received_chunk_ids: BTreeSet<String>,
    /// Chunks rejected with a validation error, with the reason.
    #[serde(default)]
    pub failed_chunks: BTreeMap<String, String>,
    pub status: ScenarioStatus,
    /// Active merge claim while `status == merging`.
    #[serde(default)]
    pub claim: Option<Claim>,
    /// Owner of the merge attempt that moved the scenario to `merged`.
    #[serde(default)]
    pub merged_by: Option<Uuid>,
    /// Retained once the scenario is `failed`.
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScenarioManifest {
    pub fn new(scenario_id: &str, study_area: &str, expected_chunk_count: usize) -> Self {
        let now = Utc::now();
        Self {
            scenario_id: scenario_id.to_string(),
            study_area: study_area.to_string(),
            expected_chunk_count,
            received_chunk_ids: BTreeSet::new(),
            failed_chunks: BTreeMap::new(),
            status: ScenarioStatus::Collecting,
            claim: None,
            merged_by: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, rejecting edges outside the state machine.
    pub fn transition(&mut self, next: ScenarioStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(PipelineError::InvalidState {
                scenario_id: self.scenario_id.clone(),
                expected: format!("a state that can become {next}"),
                actual: self.status.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Move to `failed`, retaining the reason.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(ScenarioStatus::Failed)?;
        self.claim = None;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    /// Whether every expected chunk has been spatialized.
    pub fn is_complete(&self) -> bool {
        self.received_chunk_ids.len() >= self.expected_chunk_count
    }

    /// Record a spatialized chunk, moving `collecting → ready` when the set is complete.
    ///
    /// Returns `true` when this call completed the scenario. A chunk id that would
    /// exceed the expected count is rejected and leaves the manifest untouched.
    pub fn record_chunk(&mut self, chunk_id: &str) -> Result<bool> {
        if self.received_chunk_ids.contains(chunk_id) {
            return Err(PipelineError::conflict(
                format!("{}/{}", self.scenario_id, chunk_id),
                "chunk already spatialized",
            ));
        }
        if self.status != ScenarioStatus::Collecting || self.is_complete() {
            return Err(PipelineError::validation(
                chunk_id,
                format!(
                    "unexpected chunk for scenario {} ({} of {} chunks received, status {})",
                    self.scenario_id,
                    self.received_chunk_ids.len(),
                    self.expected_chunk_count,
                    self.status
                ),
            ));
        }

        self.received_chunk_ids.insert(chunk_id.to_string());
        self.failed_chunks.remove(chunk_id);
        self.updated_at = Utc::now();

        if self.is_complete() {
            self.transition(ScenarioStatus::Ready)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Whether the merge claim is held by `owner`.
    pub fn is_claimed_by(&self, owner: Uuid) -> bool {
        self.claim.as_ref().is_some_and(|c| c.owner == owner)
    }
}

/// The merged scenario-level artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedArtifact {
    pub scenario_id: String,
    pub study_area: String,
    pub artifact_uri: String,
    /// Chunk ids that went into the artifact, ascending.
    pub chunk_ids: Vec<String>,
    pub cell_count: usize,
    pub size_bytes: u64,
    pub merged_at: DateTime<Utc>,
}

/// Progress of exporting one scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRecord {
    pub scenario_id: String,
    pub destination_uri: String,
    pub exported_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    #[serde(default)]
    pub claim: Option<Claim>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl ExportRecord {
    pub fn new(scenario_id: &str, destination_uri: &str) -> Self {
        Self {
            scenario_id: scenario_id.to_string(),
            destination_uri: destination_uri.to_string(),
            exported_at: None,
            attempt_count: 0,
            claim: None,
            last_error: None,
        }
    }

    pub fn is_exported(&self) -> bool {
        self.exported_at.is_some()
    }

    /// Whether an unexpired claim is held by someone.
    pub fn is_claimed(&self) -> bool {
        self.claim.as_ref().is_some_and(|c| !c.is_expired())
    }

    pub fn is_claimed_by(&self, owner: Uuid) -> bool {
        self.claim.as_ref().is_some_and(|c| c.owner == owner)
    }
}

/// Placement of one chunk within a study area grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkGeometry {
    pub row_count: usize,
    pub col_count: usize,
    pub x_ll_corner: f64,
    pub y_ll_corner: f64,
    pub x_index: u32,
    pub y_index: u32,
}

/// Study area metadata: CRS, grid cell size and chunk layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyArea {
    pub name: String,
    pub crs: String,
    pub cell_size: f64,
    pub chunk_x_count: u32,
    pub chunk_y_count: u32,
    pub chunks: BTreeMap<String, ChunkGeometry>,
}

impl StudyArea {
    /// Number of chunks a scenario over this study area is made of.
    pub fn chunk_count(&self) -> usize {
        self.chunk_x_count as usize * self.chunk_y_count as usize
    }

    /// Look up a chunk's geometry.
    pub fn chunk(&self, chunk_id: &str) -> Result<&ChunkGeometry> {
        self.chunks.get(chunk_id).ok_or_else(|| {
            PipelineError::validation(
                chunk_id,
                format!("chunk \"{}\" does not exist in study area \"{}\"", chunk_id, self.name),
            )
        })
    }

    pub fn validate(&self) -> Result<()> {
        validate_id("study area", &self.name)?;
        if self.crs.trim().is_empty() {
            return Err(PipelineError::validation(&self.name, "crs must not be empty"));
        }
        if !(self.cell_size.is_finite() && self.cell_size > 0.0) {
            return Err(PipelineError::validation(&self.name, "cell_size must be > 0"));
        }
        if self.chunk_x_count == 0 || self.chunk_y_count == 0 {
            return Err(PipelineError::validation(
                &self.name,
                "chunk_x_count and chunk_y_count must be > 0",
            ));
        }
        if self.chunks.is_empty() {
            return Err(PipelineError::validation(&self.name, "study area is missing chunks"));
        }
        for (id, chunk) in &self.chunks {
            validate_id("chunk id", id)?;
            if chunk.row_count == 0 || chunk.col_count == 0 {
                return Err(PipelineError::validation(id, "row_count and col_count must be > 0"));
            }
            if chunk.x_index >= self.chunk_x_count || chunk.y_index >= self.chunk_y_count {
                return Err(PipelineError::validation(
                    id,
                    format!(
                        "chunk index ({}, {}) outside the {}x{} chunk grid",
                        chunk.x_index, chunk.y_index, self.chunk_x_count, self.chunk_y_count
                    ),
                ));
            }
        }
        Ok(())
    }
}
