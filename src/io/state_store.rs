//! Versioned JSON records with compare-and-set updates.
//!
//! Manifests and export records are the only shared mutable state in the pipeline.
//! Writers never lock a store: they read a record together with its version
//! (e-tag / generation) and write it back with `PutMode::Update`, which the
//! backend rejects if anyone else wrote in between. Record creation uses
//! `PutMode::Create` so exactly one creator wins.

use super::timed;
use crate::error::{PipelineError, Result};
use crate::model::{ExportRecord, MergedArtifact, ScenarioManifest, StudyArea};
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, ObjectStoreExt, PutMode, PutOptions, PutPayload, UpdateVersion};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on compare-and-set retries under contention.
const MAX_CAS_ATTEMPTS: usize = 64;

const MANIFESTS: &str = "manifests";
const ARTIFACTS: &str = "artifacts";
const EXPORTS: &str = "exports";
const STUDY_AREAS: &str = "study_areas";

/// A record together with the version it was read at.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub value: T,
    version: UpdateVersion,
}

/// Store for coordination records.
#[derive(Clone)]
pub struct StateStore {
    store: Arc<dyn ObjectStore>,
    timeout: Duration,
}

fn record_path(collection: &str, id: &str) -> Path {
    Path::from(format!("{}/{}.json", collection, id))
}

impl StateStore {
    pub fn new(store: Arc<dyn ObjectStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    async fn read<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<Versioned<T>>> {
        let result = match timed("state get", self.timeout, self.store.get(path)).await {
            Ok(result) => result,
            Err(PipelineError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let version = UpdateVersion {
            e_tag: result.meta.e_tag.clone(),
            version: result.meta.version.clone(),
        };
        let bytes = timed("state read", self.timeout, result.bytes()).await?;
        let value = serde_json::from_slice(&bytes)?;
        Ok(Some(Versioned { value, version }))
    }

    async fn write<T: Serialize>(&self, path: &Path, value: &T, mode: PutMode) -> Result<()> {
        let payload = PutPayload::from(serde_json::to_vec_pretty(value)?);
        let opts = PutOptions {
            mode,
            ..Default::default()
        };
        timed("state put", self.timeout, self.store.put_opts(path, payload, opts)).await?;
        Ok(())
    }

    /// Create a record. Returns `false` if it already exists.
    async fn create<T: Serialize>(&self, path: &Path, value: &T) -> Result<bool> {
        match self.write(path, value, PutMode::Create).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Replace a record if it is unchanged since `current` was read.
    /// Returns `false` if someone else wrote in between.
    async fn replace<T: Serialize>(&self, path: &Path, current: &Versioned<T>, value: &T) -> Result<bool> {
        match self.write(path, value, PutMode::Update(current.version.clone())).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_conflict() => Ok(false),
            Err(PipelineError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Read-modify-write loop on one record.
    ///
    /// `apply` runs against the latest value and may reject the change by returning an
    /// error, in which case nothing is written. On a concurrent write the record is
    /// re-read and `apply` runs again, so no update is ever lost.
    async fn update<T, R, F>(&self, path: &Path, mut apply: F) -> Result<(T, R)>
    where
        T: Serialize + DeserializeOwned + Clone,
        F: FnMut(&mut T) -> Result<R>,
    {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current: Versioned<T> = self
                .read(path)
                .await?
                .ok_or_else(|| PipelineError::NotFound(path.to_string()))?;

            let mut next = current.value.clone();
            let outcome = apply(&mut next)?;

            if self.replace(path, &current, &next).await? {
                return Ok((next, outcome));
            }
            tracing::debug!("Concurrent update of {}, retrying (attempt {})", path, attempt);
        }
        Err(PipelineError::conflict(
            path.to_string(),
            format!("gave up after {} concurrent updates", MAX_CAS_ATTEMPTS),
        ))
    }

    async fn list_ids(&self, collection: &str) -> Result<Vec<String>> {
        let prefix = Path::from(collection);
        let listing = timed(
            "state list",
            self.timeout,
            self.store.list(Some(&prefix)).try_collect::<Vec<_>>(),
        )
        .await?;

        let mut ids: Vec<String> = listing
            .iter()
            .filter_map(|meta| meta.location.filename())
            .filter_map(|name| name.strip_suffix(".json"))
            .map(str::to_string)
            .collect();
        ids.sort();
        Ok(ids)
    }

    // --- manifests ---

    pub async fn load_manifest(&self, scenario_id: &str) -> Result<Option<ScenarioManifest>> {
        Ok(self
            .read(&record_path(MANIFESTS, scenario_id))
            .await?
            .map(|v: Versioned<ScenarioManifest>| v.value))
    }

    /// Load a manifest that must exist.
    pub async fn manifest(&self, scenario_id: &str) -> Result<ScenarioManifest> {
        self.load_manifest(scenario_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("manifest for scenario {}", scenario_id)))
    }

    /// Create a manifest unless one exists. Returns the stored manifest.
    pub async fn create_manifest(&self, manifest: &ScenarioManifest) -> Result<ScenarioManifest> {
        let path = record_path(MANIFESTS, &manifest.scenario_id);
        if self.create(&path, manifest).await? {
            return Ok(manifest.clone());
        }
        self.manifest(&manifest.scenario_id).await
    }

    /// Atomically modify a manifest. See [`StateStore::update`].
    pub async fn update_manifest<R, F>(&self, scenario_id: &str, apply: F) -> Result<(ScenarioManifest, R)>
    where
        F: FnMut(&mut ScenarioManifest) -> Result<R>,
    {
        self.update(&record_path(MANIFESTS, scenario_id), apply).await
    }

    /// Ids of every scenario with a manifest, ascending.
    pub async fn list_scenarios(&self) -> Result<Vec<String>> {
        self.list_ids(MANIFESTS).await
    }

    // --- merged artifact records ---

    pub async fn load_artifact(&self, scenario_id: &str) -> Result<Option<MergedArtifact>> {
        Ok(self
            .read(&record_path(ARTIFACTS, scenario_id))
            .await?
            .map(|v: Versioned<MergedArtifact>| v.value))
    }

    pub async fn put_artifact(&self, artifact: &MergedArtifact) -> Result<()> {
        self.write(&record_path(ARTIFACTS, &artifact.scenario_id), artifact, PutMode::Overwrite)
            .await
    }

    // --- export records ---

    pub async fn load_export_record(&self, scenario_id: &str) -> Result<Option<ExportRecord>> {
        Ok(self
            .read(&record_path(EXPORTS, scenario_id))
            .await?
            .map(|v: Versioned<ExportRecord>| v.value))
    }

    /// Create an export record unless one exists.
    pub async fn create_export_record(&self, record: &ExportRecord) -> Result<()> {
        self.create(&record_path(EXPORTS, &record.scenario_id), record).await?;
        Ok(())
    }

    /// Atomically modify an export record. See [`StateStore::update`].
    pub async fn update_export_record<R, F>(&self, scenario_id: &str, apply: F) -> Result<(ExportRecord, R)>
    where
        F: FnMut(&mut ExportRecord) -> Result<R>,
    {
        self.update(&record_path(EXPORTS, scenario_id), apply).await
    }

    // --- study areas ---

    pub async fn load_study_area(&self, name: &str) -> Result<StudyArea> {
        self.read(&record_path(STUDY_AREAS, name))
            .await?
            .map(|v: Versioned<StudyArea>| v.value)
            .ok_or_else(|| PipelineError::validation(name, format!("Study area \"{}\" does not exist", name)))
    }

    /// Validate and store a study area, replacing any previous definition.
    pub async fn put_study_area(&self, area: &StudyArea) -> Result<()> {
        area.validate()?;
        self.write(&record_path(STUDY_AREAS, &area.name), area, PutMode::Overwrite)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScenarioStatus;
    use object_store::memory::InMemory;

    fn state() -> StateStore {
        StateStore::new(Arc::new(InMemory::new()), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_create_manifest_is_create_once() {
        let state = state();
        let first = ScenarioManifest::new("s1", "area", 2);
        state.create_manifest(&first).await.unwrap();

        let second = ScenarioManifest::new("s1", "area", 5);
        let stored = state.create_manifest(&second).await.unwrap();
        assert_eq!(stored.expected_chunk_count, 2);
    }

    #[tokio::test]
    async fn test_update_manifest_applies_change() {
        let state = state();
        state.create_manifest(&ScenarioManifest::new("s1", "area", 1)).await.unwrap();

        let (manifest, ready) = state
            .update_manifest("s1", |m| m.record_chunk("c1"))
            .await
            .unwrap();
        assert!(ready);
        assert_eq!(manifest.status, ScenarioStatus::Ready);

        let reloaded = state.manifest("s1").await.unwrap();
        assert_eq!(reloaded, manifest);
    }

    #[tokio::test]
    async fn test_rejected_update_writes_nothing() {
        let state = state();
        state.create_manifest(&ScenarioManifest::new("s1", "area", 1)).await.unwrap();
        let before = state.manifest("s1").await.unwrap();

        let result = state
            .update_manifest("s1", |m| m.transition(ScenarioStatus::Merged))
            .await;
        assert!(result.is_err());
        assert_eq!(state.manifest("s1").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_stale_replace_is_rejected() {
        let state = state();
        let path = record_path(MANIFESTS, "s1");
        state.create_manifest(&ScenarioManifest::new("s1", "area", 3)).await.unwrap();

        let stale: Versioned<ScenarioManifest> = state.read(&path).await.unwrap().unwrap();
        state.update_manifest("s1", |m| m.record_chunk("c1")).await.unwrap();

        let mut changed = stale.value.clone();
        changed.record_chunk("c2").unwrap();
        assert!(!state.replace(&path, &stale, &changed).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        let state = state();
        state.create_manifest(&ScenarioManifest::new("s1", "area", 16)).await.unwrap();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let state = state.clone();
                tokio::spawn(async move {
                    state
                        .update_manifest("s1", |m| m.record_chunk(&format!("c{:02}", i)))
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let manifest = state.manifest("s1").await.unwrap();
        assert_eq!(manifest.received_chunk_ids.len(), 16);
        assert_eq!(manifest.status, ScenarioStatus::Ready);
    }

    #[tokio::test]
    async fn test_list_scenarios_sorted() {
        let state = state();
        for id in ["s3", "s1", "s2"] {
            state.create_manifest(&ScenarioManifest::new(id, "area", 1)).await.unwrap();
        }
        assert_eq!(state.list_scenarios().await.unwrap(), vec!["s1", "s2", "s3"]);
    }

    #[tokio::test]
    async fn test_missing_study_area_is_validation_error() {
        let state = state();
        let err = state.load_study_area("nowhere").await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation { .. }));
        assert!(err.to_string().contains("does not exist"));
    }
}
