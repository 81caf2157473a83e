//! Throughput monitoring and metrics collection.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for the pipeline.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Prediction chunks accepted by ingestion
    pub chunks_received: AtomicU64,

    /// Chunks spatialized by this process
    pub chunks_spatialized: AtomicU64,

    /// Chunks rejected with a validation error
    pub chunks_rejected: AtomicU64,

    /// H3 cells written to spatialized chunks
    pub cells_written: AtomicU64,

    /// Scenarios that reached `merged`
    pub scenarios_merged: AtomicU64,

    /// Merge or export attempts that found the claim held elsewhere
    pub claim_conflicts: AtomicU64,

    /// Scenarios that reached `exported`
    pub scenarios_exported: AtomicU64,

    /// Scenarios that reached `failed`
    pub scenarios_failed: AtomicU64,

    /// Export attempts, including retries
    pub export_attempts: AtomicU64,

    /// Bytes delivered to export destinations
    pub bytes_exported: AtomicU64,

    /// Retriable failures, counted per failed attempt
    pub transient_failures: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    // Per-stage timing (in microseconds for precision)
    pub spatialize_us: AtomicU64,
    pub merge_us: AtomicU64,
    pub export_us: AtomicU64,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_chunk_received(&self) {
        self.chunks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_chunk_spatialized(&self, cells: u64) {
        self.chunks_spatialized.fetch_add(1, Ordering::Relaxed);
        self.cells_written.fetch_add(cells, Ordering::Relaxed);
    }

    pub fn add_chunk_rejected(&self) {
        self.chunks_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_scenario_merged(&self) {
        self.scenarios_merged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_claim_conflict(&self) {
        self.claim_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_scenario_exported(&self, bytes: u64) {
        self.scenarios_exported.fetch_add(1, Ordering::Relaxed);
        self.bytes_exported.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_scenario_failed(&self) {
        self.scenarios_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_export_attempt(&self) {
        self.export_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_transient_failure(&self) {
        self.transient_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_spatialize_time(&self, duration: Duration) {
        self.spatialize_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_merge_time(&self, duration: Duration) {
        self.merge_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_export_time(&self, duration: Duration) {
        self.export_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Get chunks spatialized per second.
    pub fn chunks_per_second(&self) -> f64 {
        let chunks = self.chunks_spatialized.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            chunks as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            chunks_spatialized: self.chunks_spatialized.load(Ordering::Relaxed),
            chunks_rejected: self.chunks_rejected.load(Ordering::Relaxed),
            cells_written: self.cells_written.load(Ordering::Relaxed),
            scenarios_merged: self.scenarios_merged.load(Ordering::Relaxed),
            claim_conflicts: self.claim_conflicts.load(Ordering::Relaxed),
            scenarios_exported: self.scenarios_exported.load(Ordering::Relaxed),
            scenarios_failed: self.scenarios_failed.load(Ordering::Relaxed),
            export_attempts: self.export_attempts.load(Ordering::Relaxed),
            bytes_exported: self.bytes_exported.load(Ordering::Relaxed),
            transient_failures: self.transient_failures.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            chunks_per_second: self.chunks_per_second(),
            spatialize_secs: self.spatialize_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            merge_secs: self.merge_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            export_secs: self.export_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub chunks_received: u64,
    pub chunks_spatialized: u64,
    pub chunks_rejected: u64,
    pub cells_written: u64,
    pub scenarios_merged: u64,
    pub claim_conflicts: u64,
    pub scenarios_exported: u64,
    pub scenarios_failed: u64,
    pub export_attempts: u64,
    pub bytes_exported: u64,
    pub transient_failures: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub chunks_per_second: f64,
    /// Total time spent spatializing (seconds, summed across workers)
    pub spatialize_secs: f64,
    /// Total time spent merging (seconds, summed across workers)
    pub merge_secs: f64,
    /// Total time spent exporting (seconds, summed across workers)
    pub export_secs: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total_stage_time = self.spatialize_secs + self.merge_secs + self.export_secs;
        let (spatialize_pct, merge_pct, export_pct) = if total_stage_time > 0.0 {
            (
                self.spatialize_secs / total_stage_time * 100.0,
                self.merge_secs / total_stage_time * 100.0,
                self.export_secs / total_stage_time * 100.0,
            )
        } else {
            (0.0, 0.0, 0.0)
        };

        write!(
            f,
            "Chunks: {} received, {} spatialized, {} rejected | Cells: {} | \
             Scenarios: {} merged, {} exported, {} failed | \
             Exports: {} attempts, {:.2} MB | Conflicts: {} | Rate: {:.1} chunks/s | \
             Elapsed: {:.1}s | Time: spatialize {:.0}% merge {:.0}% export {:.0}%",
            self.chunks_received,
            self.chunks_spatialized,
            self.chunks_rejected,
            self.cells_written,
            self.scenarios_merged,
            self.scenarios_exported,
            self.scenarios_failed,
            self.export_attempts,
            self.bytes_exported as f64 / (1024.0 * 1024.0),
            self.claim_conflicts,
            self.chunks_per_second,
            self.elapsed.as_secs_f64(),
            spatialize_pct,
            merge_pct,
            export_pct,
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_chunks: u64,
}

impl MetricsReporter {
    /// Create a new metrics reporter.
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_chunks: u64) -> Self {
        Self {
            metrics,
            interval_secs,
            total_chunks,
        }
    }

    /// Start the periodic reporter.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs.max(1)));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    let progress = if self.total_chunks > 0 {
                        (snapshot.chunks_spatialized + snapshot.chunks_rejected) as f64
                            / self.total_chunks as f64
                            * 100.0
                    } else {
                        0.0
                    };

                    tracing::info!("[{:.1}%] {}", progress, snapshot);
                }
                _ = shutdown.recv() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("Final: {}", snapshot);
                    break;
                }
            }
        }
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let snapshot = self.metrics.snapshot();

        println!("\n=== Pipeline Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Chunks received: {}", snapshot.chunks_received);
        println!("Chunks spatialized: {}", snapshot.chunks_spatialized);
        println!("Chunks rejected: {}", snapshot.chunks_rejected);
        println!("Cells written: {}", snapshot.cells_written);
        println!("Scenarios merged: {}", snapshot.scenarios_merged);
        println!("Scenarios exported: {}", snapshot.scenarios_exported);
        println!("Scenarios failed: {}", snapshot.scenarios_failed);
        println!(
            "Exported: {:.2} MB in {} attempts",
            snapshot.bytes_exported as f64 / (1024.0 * 1024.0),
            snapshot.export_attempts
        );
        println!("Claim conflicts: {}", snapshot.claim_conflicts);
        println!("Transient failures: {}", snapshot.transient_failures);

        let total_stage = snapshot.spatialize_secs + snapshot.merge_secs + snapshot.export_secs;
        if total_stage > 0.0 {
            println!("\n--- Stage Time Breakdown ---");
            println!("Spatialize: {:>7.1}s ({:>5.1}%)", snapshot.spatialize_secs, snapshot.spatialize_secs / total_stage * 100.0);
            println!("Merge:      {:>7.1}s ({:>5.1}%)", snapshot.merge_secs, snapshot.merge_secs / total_stage * 100.0);
            println!("Export:     {:>7.1}s ({:>5.1}%)", snapshot.export_secs, snapshot.export_secs / total_stage * 100.0);
        }
        println!("========================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();

        metrics.add_chunk_spatialized(10);
        metrics.add_chunk_spatialized(5);

        assert_eq!(metrics.chunks_spatialized.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.cells_written.load(Ordering::Relaxed), 15);
    }

    #[test]
    fn test_all_counters() {
        let metrics = Metrics::new();

        metrics.add_chunk_received();
        metrics.add_chunk_rejected();
        metrics.add_scenario_merged();
        metrics.add_claim_conflict();
        metrics.add_scenario_exported(2048);
        metrics.add_scenario_failed();
        metrics.add_export_attempt();
        metrics.add_export_attempt();
        metrics.add_transient_failure();

        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.chunks_received, 1);
        assert_eq!(snapshot.chunks_rejected, 1);
        assert_eq!(snapshot.scenarios_merged, 1);
        assert_eq!(snapshot.claim_conflicts, 1);
        assert_eq!(snapshot.scenarios_exported, 1);
        assert_eq!(snapshot.bytes_exported, 2048);
        assert_eq!(snapshot.scenarios_failed, 1);
        assert_eq!(snapshot.export_attempts, 2);
        assert_eq!(snapshot.transient_failures, 1);
    }

    #[test]
    fn test_timing_metrics() {
        let metrics = Metrics::new();

        metrics.add_spatialize_time(Duration::from_millis(100));
        metrics.add_merge_time(Duration::from_millis(50));
        metrics.add_export_time(Duration::from_millis(25));

        let snapshot = metrics.snapshot();

        assert!((snapshot.spatialize_secs - 0.1).abs() < 0.001);
        assert!((snapshot.merge_secs - 0.05).abs() < 0.001);
        assert!((snapshot.export_secs - 0.025).abs() < 0.001);
    }

    #[test]
    fn test_snapshot_display() {
        let metrics = Metrics::new();
        metrics.add_chunk_received();
        metrics.add_chunk_received();
        metrics.add_chunk_spatialized(12);
        metrics.add_scenario_failed();

        let display = format!("{}", metrics.snapshot());

        assert!(display.contains("2 received"));
        assert!(display.contains("1 spatialized"));
        assert!(display.contains("Cells: 12"));
        assert!(display.contains("1 failed"));
    }

    #[test]
    fn test_zero_elapsed_no_panic() {
        let metrics = Metrics {
            start_time: None,
            ..Default::default()
        };
        metrics.add_chunk_spatialized(1);
        assert_eq!(metrics.chunks_per_second(), 0.0);
    }

    #[test]
    fn test_metrics_reporter_new() {
        let metrics = Metrics::new();
        let reporter = MetricsReporter::new(metrics, 10, 1000);

        assert_eq!(reporter.interval_secs, 10);
        assert_eq!(reporter.total_chunks, 1000);
    }
}
