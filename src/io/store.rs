//! Object store configuration for S3, GCS, local filesystem and in-memory access.
//!
//! Every pipeline store is addressed by a location URI. Locations sharing a
//! bucket share one client, and `memory://` locations with the same name share
//! one in-memory store, so separate stages of one process see each other's writes.

use crate::config::AwsConfig;
use anyhow::{Context, Result};
use dashmap::DashMap;
use object_store::aws::{AmazonS3Builder, S3ConditionalPut};
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::prefix::PrefixStore;
use object_store::{ClientOptions, ObjectStore, RetryConfig};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Storage backend of a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Memory,
    Local,
    S3,
    Gcs,
}

impl Scheme {
    fn as_str(self) -> &'static str {
        match self {
            Scheme::Memory => "memory",
            Scheme::Local => "file",
            Scheme::S3 => "s3",
            Scheme::Gcs => "gs",
        }
    }
}

/// A parsed store location: backend, bucket (or memory name / local root) and key prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLocation {
    pub scheme: Scheme,
    pub bucket: String,
    pub prefix: String,
}

impl StoreLocation {
    /// Parse a location URI.
    ///
    /// Accepts `memory://name[/prefix]`, `s3://bucket[/prefix]`, `gs://bucket[/prefix]`,
    /// `file:///abs/path` and bare filesystem paths.
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, rest) = match uri.split_once("://") {
            Some(("memory", rest)) => (Scheme::Memory, rest),
            Some(("s3", rest)) => (Scheme::S3, rest),
            Some(("gs", rest)) => (Scheme::Gcs, rest),
            Some(("file", rest)) => (Scheme::Local, rest),
            Some((other, _)) => anyhow::bail!("Unsupported store scheme '{}' in '{}'", other, uri),
            None => (Scheme::Local, uri),
        };

        if scheme == Scheme::Local {
            if rest.is_empty() {
                anyhow::bail!("Invalid local store location: empty path in '{}'", uri);
            }
            return Ok(Self {
                scheme,
                bucket: rest.trim_end_matches('/').to_string(),
                prefix: String::new(),
            });
        }

        let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            anyhow::bail!("Invalid store location: expected '{}://bucket/prefix' in '{}'", scheme.as_str(), uri);
        }
        Ok(Self {
            scheme,
            bucket: bucket.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
        })
    }

    /// Whether the backend honours conditional updates (compare-and-set on e-tag).
    pub fn supports_conditional_update(&self) -> bool {
        !matches!(self.scheme, Scheme::Local)
    }

    fn client_key(&self) -> String {
        format!("{}://{}", self.scheme.as_str(), self.bucket)
    }
}

impl fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.scheme, self.prefix.is_empty()) {
            (Scheme::Local, _) => write!(f, "file://{}", self.bucket),
            (_, true) => write!(f, "{}", self.client_key()),
            (_, false) => write!(f, "{}/{}", self.client_key(), self.prefix),
        }
    }
}

/// Split an object URI into its location (bucket) and object key.
///
/// Accepts URIs in the format `<scheme>://bucket/key/path`.
///
/// # Errors
/// Returns an error if the URI is malformed (unsupported scheme, missing bucket, or key).
pub fn parse_object_uri(uri: &str) -> Result<(StoreLocation, String)> {
    let location = StoreLocation::parse(uri)?;
    if location.scheme == Scheme::Local {
        let path = std::path::Path::new(&location.bucket);
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .with_context(|| format!("Invalid object URI: no parent directory in '{}'", uri))?;
        let file = path
            .file_name()
            .and_then(|f| f.to_str())
            .with_context(|| format!("Invalid object URI: no file name in '{}'", uri))?;
        let dir = StoreLocation {
            scheme: Scheme::Local,
            bucket: parent.to_string_lossy().into_owned(),
            prefix: String::new(),
        };
        return Ok((dir, file.to_string()));
    }
    if location.prefix.is_empty() {
        anyhow::bail!("Invalid object URI: expected '{}://bucket/key' format in '{}'", location.scheme.as_str(), uri);
    }
    let key = location.prefix.clone();
    Ok((
        StoreLocation {
            prefix: String::new(),
            ..location
        },
        key,
    ))
}

/// Create client options for cloud object stores.
fn create_client_options(aws: Option<&AwsConfig>) -> ClientOptions {
    let options = ClientOptions::new()
        // Connection timeout: how long to wait for a connection to be established
        .with_connect_timeout(Duration::from_secs(5))
        // Request timeout: total time allowed for a single request
        .with_timeout(Duration::from_secs(60))
        .with_pool_idle_timeout(Duration::from_secs(90))
        .with_pool_max_idle_per_host(64);

    match aws {
        Some(aws) if aws.allow_http => options.with_allow_http(true),
        _ => options,
    }
}

/// Create retry configuration for transient failures at the HTTP layer.
///
/// Pipeline-level retries ([`RetryPolicy`](crate::pipeline::RetryPolicy)) sit on top of this.
fn create_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 3,
        backoff: object_store::BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(60),
    }
}

/// Create an authenticated S3 client.
///
/// Credentials and region are loaded from (in order):
/// - Environment variables (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_REGION)
/// - AWS config files (~/.aws/credentials, ~/.aws/config)
/// - EC2 instance profile (IMDS)
fn create_s3_store(bucket: &str, aws: &AwsConfig) -> Result<Arc<dyn ObjectStore>> {
    tracing::info!("Creating S3 client for bucket: {}", bucket);

    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_client_options(create_client_options(Some(aws)))
        .with_retry(create_retry_config())
        .with_conditional_put(S3ConditionalPut::ETagMatch);

    if let Some(region) = &aws.region {
        builder = builder.with_region(region);
    }
    if let Some(endpoint) = &aws.endpoint_url {
        builder = builder
            .with_endpoint(endpoint)
            .with_virtual_hosted_style_request(false);
    }

    Ok(Arc::new(builder.build()?))
}

/// Create a GCS client. Credentials come from the environment
/// (GOOGLE_APPLICATION_CREDENTIALS or the metadata server).
fn create_gcs_store(bucket: &str) -> Result<Arc<dyn ObjectStore>> {
    tracing::info!("Creating GCS client for bucket: {}", bucket);

    let store = GoogleCloudStorageBuilder::from_env()
        .with_bucket_name(bucket)
        .with_client_options(create_client_options(None))
        .with_retry(create_retry_config())
        .build()?;

    Ok(Arc::new(store))
}

fn create_local_store(root: &str) -> Result<Arc<dyn ObjectStore>> {
    let path = std::path::Path::new(root);
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    tracing::info!("Creating LocalFileSystem store at: {}", path.display());
    Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
}

/// Shared clients keyed by backend and bucket.
pub struct StoreRegistry {
    aws: AwsConfig,
    clients: DashMap<String, Arc<dyn ObjectStore>>,
}

impl StoreRegistry {
    pub fn new(aws: AwsConfig) -> Self {
        Self {
            aws,
            clients: DashMap::new(),
        }
    }

    /// Register an existing store under a location's bucket, replacing any client there.
    pub fn register(&self, location: &str, store: Arc<dyn ObjectStore>) -> Result<()> {
        let location = StoreLocation::parse(location)?;
        self.clients.insert(location.client_key(), store);
        Ok(())
    }

    /// Get the store for a location URI, scoped to its prefix.
    pub fn open(&self, uri: &str) -> Result<Arc<dyn ObjectStore>> {
        let location = StoreLocation::parse(uri)?;
        self.open_location(&location)
    }

    /// Get the store for a parsed location, scoped to its prefix.
    pub fn open_location(&self, location: &StoreLocation) -> Result<Arc<dyn ObjectStore>> {
        let client = self.client(location)?;
        if location.prefix.is_empty() {
            Ok(client)
        } else {
            Ok(Arc::new(PrefixStore::new(client, location.prefix.as_str())))
        }
    }

    fn client(&self, location: &StoreLocation) -> Result<Arc<dyn ObjectStore>> {
        if let Some(client) = self.clients.get(&location.client_key()) {
            return Ok(client.clone());
        }

        // Only the entry's shard is locked while a client is built
        let client = self
            .clients
            .entry(location.client_key())
            .or_try_insert_with(|| -> Result<Arc<dyn ObjectStore>> {
                let client: Arc<dyn ObjectStore> = match location.scheme {
                    Scheme::Memory => Arc::new(InMemory::new()),
                    Scheme::Local => create_local_store(&location.bucket)?,
                    Scheme::S3 => create_s3_store(&location.bucket, &self.aws)?,
                    Scheme::Gcs => create_gcs_store(&location.bucket)?,
                };
                Ok(client)
            })?;
        Ok(client.clone())
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new(AwsConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::path::Path;
    use object_store::ObjectStoreExt;

    #[test]
    fn test_parse_store_location() {
        let loc = StoreLocation::parse("s3://my-bucket/path/to").unwrap();
        assert_eq!(loc.scheme, Scheme::S3);
        assert_eq!(loc.bucket, "my-bucket");
        assert_eq!(loc.prefix, "path/to");

        let loc = StoreLocation::parse("gs://climateiq-chunk-predictions").unwrap();
        assert_eq!(loc.scheme, Scheme::Gcs);
        assert_eq!(loc.prefix, "");

        let loc = StoreLocation::parse("memory://state").unwrap();
        assert_eq!(loc.scheme, Scheme::Memory);
        assert_eq!(loc.bucket, "state");

        let loc = StoreLocation::parse("/tmp/spatialized").unwrap();
        assert_eq!(loc.scheme, Scheme::Local);
        assert_eq!(loc.bucket, "/tmp/spatialized");
        assert!(!loc.supports_conditional_update());
    }

    #[test]
    fn test_parse_store_location_invalid() {
        assert!(StoreLocation::parse("http://bucket/key").is_err());
        assert!(StoreLocation::parse("s3://").is_err());
        assert!(StoreLocation::parse("").is_err());
    }

    #[test]
    fn test_parse_object_uri() {
        let (loc, key) = parse_object_uri("s3://climateiq-data-delivery/area/s1.csv").unwrap();
        assert_eq!(loc.bucket, "climateiq-data-delivery");
        assert_eq!(loc.prefix, "");
        assert_eq!(key, "area/s1.csv");

        let (loc, key) = parse_object_uri("file:///tmp/out/s1.csv").unwrap();
        assert_eq!(loc.bucket, "/tmp/out");
        assert_eq!(key, "s1.csv");

        // Missing key (bucket only)
        assert!(parse_object_uri("s3://bucket").is_err());
    }

    #[test]
    fn test_display_location() {
        let loc = StoreLocation::parse("s3://bucket/prefix/").unwrap();
        assert_eq!(loc.to_string(), "s3://bucket/prefix");
    }

    #[tokio::test]
    async fn test_registry_shares_memory_stores_by_name() {
        let registry = StoreRegistry::default();
        let a = registry.open("memory://shared/a").unwrap();
        let root = registry.open("memory://shared").unwrap();

        a.put(&Path::from("x.txt"), "hello".into()).await.unwrap();

        let bytes = root
            .get(&Path::from("a/x.txt"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"hello");
    }

    #[test]
    fn test_registry_reuses_clients_per_bucket() {
        let registry = StoreRegistry::default();
        let a = registry.open("memory://state").unwrap();
        let b = registry.open("memory://state").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.clients.len(), 1);

        registry.open("memory://other/prefix").unwrap();
        assert_eq!(registry.clients.len(), 2);
    }

    #[test]
    fn test_registry_register_replaces_client() {
        let registry = StoreRegistry::default();
        let before = registry.open("memory://delivery").unwrap();
        let replacement: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        registry.register("memory://delivery", replacement.clone()).unwrap();

        let after = registry.open("memory://delivery").unwrap();
        assert!(Arc::ptr_eq(&after, &replacement));
        assert!(!Arc::ptr_eq(&after, &before));
    }

    #[test]
    fn test_create_s3_store() {
        let result = create_s3_store("test-bucket", &AwsConfig {
            region: Some("us-west-2".to_string()),
            ..Default::default()
        });
        assert!(result.is_ok());
    }
}
