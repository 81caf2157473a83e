//! Configuration for the scenario export pipeline.

use crate::io::StoreLocation;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the export pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where each stage reads and writes
    pub storage: StorageConfig,

    /// Export destination
    #[serde(default)]
    pub export: ExportConfig,

    /// Retry policy for storage calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Retry policy for export attempts
    #[serde(default = "default_export_retry")]
    pub export_retry: RetryConfig,

    /// Processing configuration
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// S3 connection settings
    #[serde(default)]
    pub aws: AwsConfig,
}

/// Store locations for every pipeline stage.
///
/// Each location is a URI: `memory://<name>`, `file:///<path>` (or a bare path),
/// `s3://<bucket>/<prefix>` or `gs://<bucket>/<prefix>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Raw prediction chunks
    pub predictions: String,

    /// Spatialized chunk tables
    pub spatialized: String,

    /// Merged scenario artifacts
    pub merged: String,

    /// Manifests, export records and study areas. Needs conditional writes.
    pub state: String,
}

/// Export configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Destination URI per scenario. Placeholders: `{scenario_id}`, `{study_area}`, `{timestamp}`.
    #[serde(default = "default_destination_uri_template")]
    pub destination_uri_template: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            destination_uri_template: default_destination_uri_template(),
        }
    }
}

/// Retry configuration for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Backoff multiplier applied after each failed attempt
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Maximum backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            multiplier: 2.0,
            max_backoff_ms: 10_000,
        }
    }
}

/// Processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Number of concurrent spatialize workers
    #[serde(default = "default_spatialize_concurrency")]
    pub spatialize_concurrency: usize,

    /// Number of concurrent scenario merges
    #[serde(default = "default_merge_concurrency")]
    pub merge_concurrency: usize,

    /// Number of concurrent scenario exports
    #[serde(default = "default_export_concurrency")]
    pub export_concurrency: usize,

    /// Deadline for a single storage or network call
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,

    /// How long a merge or export claim stays valid
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,

    /// Interval between export trigger polls
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Rayon thread pool size for CPU-bound work
    #[serde(default)]
    pub rayon_threads: Option<usize>,

    /// Enable metrics reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            spatialize_concurrency: 8,
            merge_concurrency: 4,
            export_concurrency: 4,
            operation_timeout_secs: 60,
            claim_lease_secs: 600,
            poll_interval_secs: 30,
            worker_threads: None,
            rayon_threads: None,
            enable_metrics: true,
            metrics_interval_secs: 10,
            metrics_output_path: None,
        }
    }
}

impl ProcessingConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// S3 connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AwsConfig {
    /// AWS region (falls back to the environment)
    #[serde(default)]
    pub region: Option<String>,

    /// Custom S3 endpoint (for LocalStack, MinIO, etc.)
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Allow plain HTTP endpoints
    #[serde(default)]
    pub allow_http: bool,
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                // Try YAML first (it's a superset of JSON)
                serde_yaml::from_str(&contents)?
            }
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// All-in-memory configuration, used by tests and dry runs.
    pub fn in_memory() -> Self {
        Self {
            storage: StorageConfig {
                predictions: "memory://predictions".to_string(),
                spatialized: "memory://spatialized".to_string(),
                merged: "memory://merged".to_string(),
                state: "memory://state".to_string(),
            },
            export: ExportConfig {
                destination_uri_template: "memory://delivery/{study_area}/{scenario_id}.csv"
                    .to_string(),
            },
            retry: RetryConfig::default(),
            export_retry: default_export_retry(),
            processing: ProcessingConfig::default(),
            aws: AwsConfig::default(),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, uri) in [
            ("predictions", &self.storage.predictions),
            ("spatialized", &self.storage.spatialized),
            ("merged", &self.storage.merged),
            ("state", &self.storage.state),
        ] {
            StoreLocation::parse(uri)
                .map_err(|e| anyhow::anyhow!("Invalid storage.{} location: {}", name, e))?;
        }

        let state = StoreLocation::parse(&self.storage.state)?;
        if !state.supports_conditional_update() {
            anyhow::bail!(
                "storage.state must support conditional writes (memory://, s3:// or gs://), got {}",
                self.storage.state
            );
        }

        let template = &self.export.destination_uri_template;
        if !template.contains("{scenario_id}") {
            anyhow::bail!("export.destination_uri_template must contain {{scenario_id}}");
        }

        for (name, retry) in [("retry", &self.retry), ("export_retry", &self.export_retry)] {
            if retry.max_attempts == 0 {
                anyhow::bail!("{}.max_attempts must be > 0", name);
            }
            if !(retry.multiplier.is_finite() && retry.multiplier >= 1.0) {
                anyhow::bail!("{}.multiplier must be >= 1.0", name);
            }
            if retry.initial_backoff_ms > retry.max_backoff_ms {
                anyhow::bail!("{}.initial_backoff_ms must not exceed max_backoff_ms", name);
            }
        }

        let p = &self.processing;
        if p.spatialize_concurrency == 0 || p.merge_concurrency == 0 || p.export_concurrency == 0 {
            anyhow::bail!("Concurrency must be > 0");
        }
        if p.operation_timeout_secs == 0 {
            anyhow::bail!("processing.operation_timeout_secs must be > 0");
        }
        if p.claim_lease_secs < p.operation_timeout_secs {
            anyhow::bail!("processing.claim_lease_secs must be >= operation_timeout_secs");
        }
        if p.poll_interval_secs == 0 {
            anyhow::bail!("processing.poll_interval_secs must be > 0");
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_destination_uri_template() -> String {
    "s3://climateiq-data-delivery/{study_area}/{scenario_id}.csv".to_string()
}
fn default_export_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 5,
        initial_backoff_ms: 500,
        multiplier: 2.0,
        max_backoff_ms: 30_000,
    }
}
fn default_max_attempts() -> u32 { 3 }
fn default_initial_backoff_ms() -> u64 { 100 }
fn default_multiplier() -> f64 { 2.0 }
fn default_max_backoff_ms() -> u64 { 10_000 }
fn default_spatialize_concurrency() -> usize { 8 }
fn default_merge_concurrency() -> usize { 4 }
fn default_export_concurrency() -> usize { 4 }
fn default_operation_timeout_secs() -> u64 { 60 }
fn default_claim_lease_secs() -> u64 { 600 }
fn default_poll_interval_secs() -> u64 { 30 }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 10 }
