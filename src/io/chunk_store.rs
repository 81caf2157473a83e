//! Durable storage for prediction chunks, spatialized chunks and merged artifacts.
//!
//! Layout:
//! - predictions: `<scenario_id>/<chunk_id>.json` (create-once)
//! - spatialized: `<scenario_id>/<chunk_id>.csv` (create-once)
//! - merged: `<scenario_id>.csv` (overwritten on re-merge)

use super::store::StoreRegistry;
use super::timed;
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::model::{PredictionChunk, SpatializedChunk};
use bytes::Bytes;
use object_store::path::Path;
use object_store::{ObjectStore, ObjectStoreExt, PutMode, PutOptions, PutPayload};
use std::sync::Arc;
use std::time::Duration;

/// Result of a create-once write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The object was written by this call.
    Stored,
    /// The object already existed; nothing was written.
    Duplicate,
}

#[derive(Clone)]
pub struct ChunkStore {
    predictions: Arc<dyn ObjectStore>,
    spatialized: Arc<dyn ObjectStore>,
    merged: Arc<dyn ObjectStore>,
    merged_root: String,
    timeout: Duration,
}

impl ChunkStore {
    pub fn new(
        predictions: Arc<dyn ObjectStore>,
        spatialized: Arc<dyn ObjectStore>,
        merged: Arc<dyn ObjectStore>,
        merged_root: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            predictions,
            spatialized,
            merged,
            merged_root: merged_root.into(),
            timeout,
        }
    }

    /// Open the three stores named in the configuration.
    pub fn from_config(config: &Config, registry: &StoreRegistry) -> anyhow::Result<Self> {
        Ok(Self::new(
            registry.open(&config.storage.predictions)?,
            registry.open(&config.storage.spatialized)?,
            registry.open(&config.storage.merged)?,
            config.storage.merged.clone(),
            config.processing.operation_timeout(),
        ))
    }

    fn chunk_path(scenario_id: &str, chunk_id: &str, ext: &str) -> Path {
        Path::from(format!("{}/{}.{}", scenario_id, chunk_id, ext))
    }

    fn merged_path(scenario_id: &str) -> Path {
        Path::from(format!("{}.csv", scenario_id))
    }

    async fn create_once(&self, store: &Arc<dyn ObjectStore>, path: &Path, payload: PutPayload) -> Result<SubmitOutcome> {
        let opts = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };
        match timed("chunk put", self.timeout, store.put_opts(path, payload, opts)).await {
            Ok(_) => Ok(SubmitOutcome::Stored),
            Err(e) if e.is_conflict() => Ok(SubmitOutcome::Duplicate),
            Err(e) => Err(e),
        }
    }

    async fn read(&self, store: &Arc<dyn ObjectStore>, path: &Path) -> Result<Option<Bytes>> {
        let result = match timed("chunk get", self.timeout, store.get(path)).await {
            Ok(result) => result,
            Err(PipelineError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(Some(timed("chunk read", self.timeout, result.bytes()).await?))
    }

    /// Store a raw prediction chunk. A chunk that already exists is left untouched.
    pub async fn put_prediction(&self, chunk: &PredictionChunk) -> Result<SubmitOutcome> {
        let path = Self::chunk_path(&chunk.scenario_id, &chunk.chunk_id, "json");
        let payload = PutPayload::from(serde_json::to_vec(chunk)?);
        self.create_once(&self.predictions, &path, payload).await
    }

    pub async fn get_prediction(&self, scenario_id: &str, chunk_id: &str) -> Result<PredictionChunk> {
        let path = Self::chunk_path(scenario_id, chunk_id, "json");
        let bytes = self
            .read(&self.predictions, &path)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("prediction chunk {}/{}", scenario_id, chunk_id)))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn spatialized_exists(&self, scenario_id: &str, chunk_id: &str) -> Result<bool> {
        let path = Self::chunk_path(scenario_id, chunk_id, "csv");
        match timed("chunk head", self.timeout, self.spatialized.head(&path)).await {
            Ok(_) => Ok(true),
            Err(PipelineError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Store a spatialized chunk. Exactly one writer wins; later writers see `Duplicate`.
    pub async fn put_spatialized(&self, chunk: &SpatializedChunk) -> Result<SubmitOutcome> {
        let path = Self::chunk_path(&chunk.scenario_id, &chunk.chunk_id, "csv");
        let payload = PutPayload::from(chunk.geo_payload.clone().into_bytes());
        self.create_once(&self.spatialized, &path, payload).await
    }

    /// Raw CSV bytes of a spatialized chunk, `None` if it has not been written.
    pub async fn get_spatialized(&self, scenario_id: &str, chunk_id: &str) -> Result<Option<Bytes>> {
        self.read(&self.spatialized, &Self::chunk_path(scenario_id, chunk_id, "csv"))
            .await
    }

    pub async fn put_merged(&self, scenario_id: &str, content: Bytes) -> Result<()> {
        timed(
            "merged put",
            self.timeout,
            self.merged.put(&Self::merged_path(scenario_id), PutPayload::from(content)),
        )
        .await?;
        Ok(())
    }

    pub async fn get_merged(&self, scenario_id: &str) -> Result<Bytes> {
        self.read(&self.merged, &Self::merged_path(scenario_id))
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("merged artifact for scenario {}", scenario_id)))
    }

    /// URI under which the merged artifact of `scenario_id` is stored.
    pub fn merged_uri(&self, scenario_id: &str) -> String {
        format!("{}/{}.csv", self.merged_root.trim_end_matches('/'), scenario_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use object_store::memory::InMemory;

    fn chunk_store() -> ChunkStore {
        ChunkStore::new(
            Arc::new(InMemory::new()),
            Arc::new(InMemory::new()),
            Arc::new(InMemory::new()),
            "memory://merged/",
            Duration::from_secs(5),
        )
    }

    fn prediction(payload: &str) -> PredictionChunk {
        PredictionChunk {
            scenario_id: "s1".to_string(),
            study_area: "area".to_string(),
            chunk_id: "c1".to_string(),
            raw_payload: payload.to_string(),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_prediction_is_written_once() {
        let store = chunk_store();
        let first = prediction("{\"prediction\": [[1.0]]}");
        assert_eq!(store.put_prediction(&first).await.unwrap(), SubmitOutcome::Stored);

        let second = prediction("{\"prediction\": [[2.0]]}");
        assert_eq!(store.put_prediction(&second).await.unwrap(), SubmitOutcome::Duplicate);

        let stored = store.get_prediction("s1", "c1").await.unwrap();
        assert_eq!(stored, first);
    }

    #[tokio::test]
    async fn test_missing_prediction_is_not_found() {
        let store = chunk_store();
        let err = store.get_prediction("s1", "nope").await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_spatialized_roundtrip_and_exists() {
        let store = chunk_store();
        assert!(!store.spatialized_exists("s1", "c1").await.unwrap());
        assert!(store.get_spatialized("s1", "c1").await.unwrap().is_none());

        let chunk = SpatializedChunk {
            scenario_id: "s1".to_string(),
            chunk_id: "c1".to_string(),
            geo_payload: "h3_index,prediction,owned\n".to_string(),
            spatialized_at: Utc::now(),
        };
        assert_eq!(store.put_spatialized(&chunk).await.unwrap(), SubmitOutcome::Stored);
        assert_eq!(store.put_spatialized(&chunk).await.unwrap(), SubmitOutcome::Duplicate);

        assert!(store.spatialized_exists("s1", "c1").await.unwrap());
        let bytes = store.get_spatialized("s1", "c1").await.unwrap().unwrap();
        assert_eq!(&bytes[..], chunk.geo_payload.as_bytes());
    }

    #[tokio::test]
    async fn test_merged_is_overwritten() {
        let store = chunk_store();
        store.put_merged("s1", Bytes::from_static(b"a")).await.unwrap();
        store.put_merged("s1", Bytes::from_static(b"b")).await.unwrap();
        assert_eq!(&store.get_merged("s1").await.unwrap()[..], b"b");
        assert_eq!(store.merged_uri("s1"), "memory://merged/s1.csv");
    }
}
