//! Drives submissions through every stage inside one process.
//!
//! ```text
//! ┌──────────┐     ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Ingest  │────▶│ Spatializer │────▶│   Merger    │────▶│  Exporter   │
//! │          │     │  workers    │     │   stage     │     │   stage     │
//! └──────────┘     └─────────────┘     └─────────────┘     └─────────────┘
//!                     work_rx             merge_rx            export_rx
//! ```
//!
//! Spatializer workers pull from a shared queue. A worker that completes a
//! scenario hands its id to the merge stage, which hands merged ids on to the
//! export stage. Both downstream stages bound their in-flight work with their
//! configured concurrency. A final trigger pass picks up anything the channels
//! did not carry, such as scenarios left `ready` by an earlier run.

use crate::error::PipelineError;
use crate::model::ChunkSubmission;
use crate::pipeline::{
    ExportTrigger, Exporter, Ingestor, MetricsReporter, PipelineContext, ScenarioMerger, Spatializer,
    TriggerReport,
};
use anyhow::Result;
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Counts from one scheduler run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SchedulerStats {
    pub total_chunks: usize,
    pub chunks_spatialized: usize,
    /// Chunks that were already spatialized by an earlier run.
    pub chunks_skipped: usize,
    pub chunks_rejected: usize,
    pub scenarios_merged: usize,
    pub scenarios_exported: usize,
    pub scenarios_failed: usize,
}

impl SchedulerStats {
    fn absorb(&mut self, report: &TriggerReport) {
        self.scenarios_merged += report.merged.len();
        self.scenarios_exported += report.exported.len();
        self.scenarios_failed += report.failed.len();
    }
}

impl std::fmt::Display for SchedulerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Chunks: {} spatialized, {} skipped, {} rejected of {}; Scenarios: {} merged, {} exported, {} failed",
            self.chunks_spatialized,
            self.chunks_skipped,
            self.chunks_rejected,
            self.total_chunks,
            self.scenarios_merged,
            self.scenarios_exported,
            self.scenarios_failed
        )
    }
}

#[derive(Debug, Default)]
struct StageCounts {
    done: usize,
    failed: usize,
}

pub struct Scheduler {
    ctx: PipelineContext,
}

impl Scheduler {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    /// Ingest `submissions` and run them through spatialize, merge and export.
    pub async fn run(&self, submissions: Vec<ChunkSubmission>) -> Result<SchedulerStats> {
        let total_chunks = submissions.len();
        let processing = &self.ctx.config.processing;

        tracing::info!(
            "Scheduling {} chunks ({} spatialize / {} merge / {} export concurrent)",
            total_chunks,
            processing.spatialize_concurrency,
            processing.merge_concurrency,
            processing.export_concurrency
        );

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let reporter_handle = if processing.enable_metrics {
            let reporter = MetricsReporter::new(
                self.ctx.metrics.clone(),
                processing.metrics_interval_secs,
                total_chunks as u64,
            );
            Some(tokio::spawn(reporter.run(shutdown_rx)))
        } else {
            drop(shutdown_rx);
            None
        };

        let mut stats = SchedulerStats {
            total_chunks,
            ..Default::default()
        };

        let accepted = self.ingest(submissions, &mut stats).await;

        let (merge_tx, merge_rx) = mpsc::channel::<String>(processing.merge_concurrency.max(1) * 4);
        let (export_tx, export_rx) = mpsc::channel::<String>(processing.export_concurrency.max(1) * 4);

        let export_handle = self.spawn_export_stage(export_rx);
        let merge_handle = self.spawn_merge_stage(merge_rx, export_tx);

        let spatialized = self.run_spatialize_stage(accepted, merge_tx).await;
        stats.chunks_spatialized = spatialized.done;
        stats.chunks_skipped = spatialized.skipped;
        stats.chunks_rejected += spatialized.failed;

        let merged = merge_handle.await?;
        let exported = export_handle.await?;
        stats.scenarios_merged = merged.done;
        stats.scenarios_exported = exported.done;
        stats.scenarios_failed = merged.failed + exported.failed;

        let sweep = ExportTrigger::new(self.ctx.clone()).run_once().await?;
        stats.absorb(&sweep);

        let _ = shutdown_tx.send(()).await;
        if let Some(handle) = reporter_handle {
            let _ = handle.await;
        }

        if processing.enable_metrics {
            let reporter = MetricsReporter::new(
                self.ctx.metrics.clone(),
                processing.metrics_interval_secs,
                total_chunks as u64,
            );
            reporter.print_summary();

            if let Some(ref path) = processing.metrics_output_path {
                let snapshot = self.ctx.metrics.snapshot();
                if let Err(e) = snapshot.save_to_file(path) {
                    tracing::warn!("Failed to save metrics to {}: {}", path, e);
                }
            }
        }

        tracing::info!("{}", stats);
        Ok(stats)
    }

    /// Run trigger passes every poll interval until `shutdown` fires or its sender drops.
    pub async fn watch(&self, mut shutdown: mpsc::Receiver<()>) -> Result<TriggerReport> {
        let trigger = ExportTrigger::new(self.ctx.clone());
        let mut interval = tokio::time::interval(self.ctx.config.processing.poll_interval());
        let mut total = TriggerReport::default();

        tracing::info!(
            "Watching for scenarios to merge and export every {:?}",
            self.ctx.config.processing.poll_interval()
        );
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match trigger.run_once().await {
                        Ok(report) => {
                            total.recovered += report.recovered;
                            total.conflicts += report.conflicts;
                            total.merged.extend(report.merged);
                            total.exported.extend(report.exported);
                            total.failed.extend(report.failed);
                        }
                        Err(e) => tracing::warn!("Trigger pass failed: {}", e),
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        Ok(total)
    }

    /// Store every submission. Rejected submissions are counted and dropped.
    async fn ingest(&self, submissions: Vec<ChunkSubmission>, stats: &mut SchedulerStats) -> Vec<(String, String)> {
        let ingestor = Ingestor::new(self.ctx.clone(), self.ctx.retry_policy());
        let results: Vec<(ChunkSubmission, crate::error::Result<_>)> = stream::iter(submissions)
            .map(|submission| {
                let ingestor = &ingestor;
                async move {
                    let result = ingestor.submit(&submission).await;
                    (submission, result)
                }
            })
            .buffer_unordered(self.ctx.config.processing.spatialize_concurrency.max(1))
            .collect()
            .await;

        let mut accepted = Vec::with_capacity(results.len());
        for (submission, result) in results {
            match result {
                Ok(_) => accepted.push((submission.scenario_id, submission.chunk_id)),
                Err(e) => {
                    tracing::warn!(
                        "Rejected submission {}/{}: {}",
                        submission.scenario_id,
                        submission.chunk_id,
                        e
                    );
                    self.ctx.metrics.add_chunk_rejected();
                    stats.chunks_rejected += 1;
                }
            }
        }
        // Keep chunks of one scenario together so scenarios complete early.
        accepted.sort();
        accepted
    }

    /// Spatialize every accepted chunk with `spatialize_concurrency` workers.
    async fn run_spatialize_stage(&self, work: Vec<(String, String)>, merge_tx: mpsc::Sender<String>) -> SpatializeCounts {
        let concurrency = self.ctx.config.processing.spatialize_concurrency.max(1);
        let spatializer = Arc::new(Spatializer::new(self.ctx.clone(), self.ctx.retry_policy()));

        let (work_tx, work_rx) = async_channel::bounded::<(String, String)>(work.len().max(1));
        for item in work {
            let _ = work_tx.send(item).await;
        }
        work_tx.close();

        let mut handles = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            let spatializer = spatializer.clone();
            let work_rx = work_rx.clone();
            let merge_tx = merge_tx.clone();

            handles.push(tokio::spawn(async move {
                let mut counts = SpatializeCounts::default();
                while let Ok((scenario_id, chunk_id)) = work_rx.recv().await {
                    match spatializer.spatialize_stored(&scenario_id, &chunk_id).await {
                        Ok(result) => {
                            counts.done += 1;
                            if result.scenario_ready && merge_tx.send(scenario_id).await.is_err() {
                                tracing::debug!("Merge receiver dropped, stopping spatialize worker");
                                break;
                            }
                        }
                        Err(e) if e.is_conflict() => {
                            tracing::debug!("Skipping {}/{}: {}", scenario_id, chunk_id, e);
                            counts.skipped += 1;
                        }
                        Err(e) => {
                            tracing::warn!("Failed to spatialize {}/{}: {}", scenario_id, chunk_id, e);
                            counts.failed += 1;
                        }
                    }
                }
                counts
            }));
        }
        drop(merge_tx);

        let mut total = SpatializeCounts::default();
        for handle in handles {
            match handle.await {
                Ok(counts) => {
                    total.done += counts.done;
                    total.skipped += counts.skipped;
                    total.failed += counts.failed;
                }
                Err(e) => tracing::error!("Spatialize worker panicked: {}", e),
            }
        }
        total
    }

    /// Merge each scenario id received, forwarding merged ids to the export stage.
    fn spawn_merge_stage(&self, merge_rx: mpsc::Receiver<String>, export_tx: mpsc::Sender<String>) -> JoinHandle<StageCounts> {
        let merger = Arc::new(ScenarioMerger::new(self.ctx.clone(), self.ctx.retry_policy()));
        let concurrency = self.ctx.config.processing.merge_concurrency.max(1);

        tokio::spawn(run_bounded("merge", merge_rx, concurrency, move |scenario_id| {
            let merger = merger.clone();
            let export_tx = export_tx.clone();
            async move {
                merger.merge(&scenario_id).await?;
                if export_tx.send(scenario_id).await.is_err() {
                    tracing::debug!("Export receiver dropped");
                }
                Ok(())
            }
        }))
    }

    fn spawn_export_stage(&self, export_rx: mpsc::Receiver<String>) -> JoinHandle<StageCounts> {
        let exporter = Arc::new(Exporter::new(self.ctx.clone(), self.ctx.export_retry_policy()));
        let concurrency = self.ctx.config.processing.export_concurrency.max(1);

        tokio::spawn(run_bounded("export", export_rx, concurrency, move |scenario_id| {
            let exporter = exporter.clone();
            async move { exporter.export(&scenario_id).await.map(|_| ()) }
        }))
    }
}

#[derive(Debug, Default)]
struct SpatializeCounts {
    done: usize,
    skipped: usize,
    failed: usize,
}

/// Receive ids and run `step` on each with at most `concurrency` in flight.
async fn run_bounded<F, Fut>(stage: &'static str, mut rx: mpsc::Receiver<String>, concurrency: usize, step: F) -> StageCounts
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = crate::error::Result<()>> + Send + 'static,
{
    let mut counts = StageCounts::default();
    let mut pending: Vec<JoinHandle<(String, crate::error::Result<()>)>> = Vec::new();

    while let Some(scenario_id) = rx.recv().await {
        let fut = step(scenario_id.clone());
        pending.push(tokio::spawn(async move { (scenario_id, fut.await) }));

        while pending.len() >= concurrency {
            let (result, _idx, remaining) = futures::future::select_all(pending).await;
            pending = remaining;
            tally(stage, result, &mut counts);
        }
    }

    for handle in pending {
        tally(stage, handle.await, &mut counts);
    }
    counts
}

fn tally(
    stage: &str,
    result: std::result::Result<(String, crate::error::Result<()>), tokio::task::JoinError>,
    counts: &mut StageCounts,
) {
    match result {
        Ok((_, Ok(()))) => counts.done += 1,
        Ok((scenario_id, Err(e))) if e.is_conflict() => {
            tracing::debug!("Skipping {} of {}: {}", stage, scenario_id, e);
        }
        Ok((scenario_id, Err(e))) => {
            log_stage_failure(stage, &scenario_id, &e);
            counts.failed += 1;
        }
        Err(e) => {
            tracing::error!("{} task panicked: {}", stage, e);
            counts.failed += 1;
        }
    }
}

fn log_stage_failure(stage: &str, scenario_id: &str, e: &PipelineError) {
    if e.is_retriable() {
        tracing::warn!("{} of {} will be retried by the trigger: {}", stage, scenario_id, e);
    } else {
        tracing::error!("{} of {} failed: {}", stage, scenario_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_stats_display() {
        let stats = SchedulerStats {
            total_chunks: 10,
            chunks_spatialized: 8,
            chunks_skipped: 1,
            chunks_rejected: 1,
            scenarios_merged: 2,
            scenarios_exported: 2,
            scenarios_failed: 0,
        };
        let display = stats.to_string();
        assert!(display.contains("8 spatialized"));
        assert!(display.contains("of 10"));
        assert!(display.contains("2 exported"));
    }

    #[test]
    fn test_stats_absorb_trigger_report() {
        let mut stats = SchedulerStats::default();
        stats.absorb(&TriggerReport {
            merged: vec!["a".into()],
            exported: vec!["a".into(), "b".into()],
            failed: vec!["c".into()],
            ..Default::default()
        });
        assert_eq!(stats.scenarios_merged, 1);
        assert_eq!(stats.scenarios_exported, 2);
        assert_eq!(stats.scenarios_failed, 1);
    }

    #[tokio::test]
    async fn test_run_bounded_counts_outcomes() {
        let (tx, rx) = mpsc::channel(8);
        for id in ["ok-1", "conflict", "ok-2", "bad"] {
            tx.send(id.to_string()).await.unwrap();
        }
        drop(tx);

        let counts = run_bounded("test", rx, 2, |id| async move {
            match id.as_str() {
                "conflict" => Err(PipelineError::conflict(id.clone(), "held")),
                "bad" => Err(PipelineError::validation(id.clone(), "bad")),
                _ => Ok(()),
            }
        })
        .await;
        assert_eq!(counts.done, 2);
        assert_eq!(counts.failed, 1);
    }
}
