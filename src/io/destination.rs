//! External export destinations.

use super::store::{parse_object_uri, StoreRegistry};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::path::Path;
use object_store::{ObjectStoreExt, PutPayload};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A place merged artifacts are delivered to.
#[async_trait]
pub trait ExportDestination: Send + Sync {
    /// Write the full artifact to `uri`.
    async fn write(&self, uri: &str, content: Bytes) -> Result<()>;

    /// Confirm that `uri` durably holds `expected_len` bytes.
    async fn confirm(&self, uri: &str, expected_len: u64) -> Result<()>;
}

/// Fill the `{scenario_id}`, `{study_area}` and `{timestamp}` placeholders of a destination template.
pub fn render_destination_uri(template: &str, scenario_id: &str, study_area: &str, now: DateTime<Utc>) -> String {
    template
        .replace("{scenario_id}", scenario_id)
        .replace("{study_area}", study_area)
        .replace("{timestamp}", &now.format("%Y%m%dT%H%M%SZ").to_string())
}

/// Destination backed by any object store reachable through a [`StoreRegistry`].
pub struct ObjectStoreDestination {
    registry: Arc<StoreRegistry>,
    timeout: Duration,
}

impl ObjectStoreDestination {
    pub fn new(registry: Arc<StoreRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    fn resolve(&self, uri: &str) -> Result<(Arc<dyn object_store::ObjectStore>, Path)> {
        let (location, key) =
            parse_object_uri(uri).map_err(|e| PipelineError::validation(uri, format!("{:#}", e)))?;
        let store = self
            .registry
            .open_location(&location)
            .map_err(|e| PipelineError::TransientNetwork(format!("{}: {:#}", uri, e)))?;
        Ok((store, Path::from(key)))
    }

    async fn call<T, F>(&self, operation: &str, uri: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, object_store::Error>>,
    {
        let start = Instant::now();
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(PipelineError::TransientNetwork(format!("{} {}: {}", operation, uri, e))),
            Err(_) => Err(PipelineError::Timeout {
                operation: format!("{} {}", operation, uri),
                elapsed: start.elapsed(),
            }),
        }
    }
}

#[async_trait]
impl ExportDestination for ObjectStoreDestination {
    async fn write(&self, uri: &str, content: Bytes) -> Result<()> {
        let (store, path) = self.resolve(uri)?;
        self.call("export put", uri, store.put(&path, PutPayload::from(content)))
            .await?;
        Ok(())
    }

    async fn confirm(&self, uri: &str, expected_len: u64) -> Result<()> {
        let (store, path) = self.resolve(uri)?;
        let meta = self.call("export head", uri, store.head(&path)).await?;
        if meta.size != expected_len {
            return Err(PipelineError::TransientNetwork(format!(
                "{} holds {} bytes, expected {}",
                uri, meta.size, expected_len
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AwsConfig;
    use chrono::TimeZone;

    #[test]
    fn test_render_destination_uri() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let uri = render_destination_uri(
            "s3://delivery/{study_area}/{scenario_id}-{timestamp}.csv",
            "heavy-rain",
            "nyc",
            now,
        );
        assert_eq!(uri, "s3://delivery/nyc/heavy-rain-20240301T123000Z.csv");
    }

    #[tokio::test]
    async fn test_write_then_confirm() {
        let registry = Arc::new(StoreRegistry::new(AwsConfig::default()));
        let destination = ObjectStoreDestination::new(registry.clone(), Duration::from_secs(5));

        destination
            .write("memory://delivery/nyc/s1.csv", Bytes::from_static(b"h3_index,prediction\n"))
            .await
            .unwrap();
        destination.confirm("memory://delivery/nyc/s1.csv", 20).await.unwrap();

        let err = destination.confirm("memory://delivery/nyc/s1.csv", 3).await.unwrap_err();
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_confirm_missing_object_is_retriable() {
        let registry = Arc::new(StoreRegistry::new(AwsConfig::default()));
        let destination = ObjectStoreDestination::new(registry, Duration::from_secs(5));
        let err = destination.confirm("memory://delivery/none.csv", 1).await.unwrap_err();
        assert!(err.is_retriable());
    }
}
