//! ExportTrigger: find scenarios that are waiting on the next stage and run it.
//!
//! Each pass first recovers claims whose lease ran out and finishes scenarios whose
//! delivery was confirmed but never recorded on the manifest, then merges `ready`
//! scenarios and exports `merged` ones that have no delivered export record.
//! Passes are idempotent; running the trigger twice in a row never duplicates work.

use crate::error::Result;
use crate::model::{ScenarioManifest, ScenarioStatus};
use crate::pipeline::{Exporter, PipelineContext, ScenarioMerger};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::fmt;

/// What one trigger pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerReport {
    /// Expired merge/export claims released.
    pub recovered: usize,
    pub merged: Vec<String>,
    pub exported: Vec<String>,
    /// Scenarios skipped because another attempt holds the claim.
    pub conflicts: usize,
    /// Scenarios whose merge or export failed in this pass.
    pub failed: Vec<String>,
}

impl TriggerReport {
    pub fn is_idle(&self) -> bool {
        self.recovered == 0 && self.merged.is_empty() && self.exported.is_empty() && self.failed.is_empty()
    }
}

impl fmt::Display for TriggerReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Recovered: {}, Merged: {}, Exported: {}, Conflicts: {}, Failed: {}",
            self.recovered,
            self.merged.len(),
            self.exported.len(),
            self.conflicts,
            self.failed.len()
        )
    }
}

enum StepOutcome {
    Done(String),
    Conflict,
    Failed(String),
}

pub struct ExportTrigger {
    ctx: PipelineContext,
    merger: ScenarioMerger,
    exporter: Exporter,
}

impl ExportTrigger {
    pub fn new(ctx: PipelineContext) -> Self {
        let merger = ScenarioMerger::new(ctx.clone(), ctx.retry_policy());
        let exporter = Exporter::new(ctx.clone(), ctx.export_retry_policy());
        Self { ctx, merger, exporter }
    }

    /// Scenarios that are `merged` and not yet delivered, in id order.
    pub async fn poll(&self) -> Result<Vec<String>> {
        let mut pending = Vec::new();
        for manifest in self.manifests_in(ScenarioStatus::Merged).await? {
            let exported = self
                .ctx
                .state
                .load_export_record(&manifest.scenario_id)
                .await?
                .is_some_and(|r| r.is_exported());
            if !exported {
                pending.push(manifest.scenario_id);
            }
        }
        Ok(pending)
    }

    /// Release merge and export claims whose lease has run out.
    ///
    /// An expired merge claim moves its scenario back to `ready`. Returns the number
    /// of claims released.
    pub async fn recover_expired_claims(&self) -> Result<usize> {
        let state = &self.ctx.state;
        let mut recovered = 0;

        for manifest in self.manifests_in(ScenarioStatus::Merging).await? {
            if !manifest.claim.as_ref().map_or(true, |c| c.is_expired()) {
                continue;
            }
            let (_, released) = state
                .update_manifest(&manifest.scenario_id, |m| {
                    let expired = m.claim.as_ref().map_or(true, |c| c.is_expired());
                    if m.status != ScenarioStatus::Merging || !expired {
                        return Ok(false);
                    }
                    m.transition(ScenarioStatus::Ready)?;
                    m.claim = None;
                    Ok(true)
                })
                .await?;
            if released {
                tracing::warn!("Released expired merge claim on {}", manifest.scenario_id);
                recovered += 1;
            }
        }

        for manifest in self.manifests_in(ScenarioStatus::Merged).await? {
            let Some(record) = state.load_export_record(&manifest.scenario_id).await? else {
                continue;
            };
            if !record.claim.as_ref().is_some_and(|c| c.is_expired()) {
                continue;
            }
            let (_, released) = state
                .update_export_record(&manifest.scenario_id, |r| {
                    if !r.claim.as_ref().is_some_and(|c| c.is_expired()) {
                        return Ok(false);
                    }
                    r.claim = None;
                    Ok(true)
                })
                .await?;
            if released {
                tracing::warn!("Released expired export claim on {}", manifest.scenario_id);
                recovered += 1;
            }
        }

        Ok(recovered)
    }

    /// Move `merged` scenarios whose delivery is already confirmed on to `exported`.
    ///
    /// Covers exports that stopped between confirming the delivery and updating the
    /// manifest. Returns the scenarios that were moved.
    pub async fn finish_delivered(&self) -> Result<Vec<String>> {
        let mut finished = Vec::new();
        for manifest in self.manifests_in(ScenarioStatus::Merged).await? {
            let scenario_id = manifest.scenario_id;
            let delivered = self
                .ctx
                .state
                .load_export_record(&scenario_id)
                .await?
                .is_some_and(|r| r.is_exported());
            if !delivered {
                continue;
            }
            match self.exporter.mark_exported(&scenario_id).await {
                Ok(()) => {
                    tracing::warn!("Marked previously delivered scenario {} as exported", scenario_id);
                    finished.push(scenario_id);
                }
                Err(e) => tracing::warn!("Could not mark {} as exported: {}", scenario_id, e),
            }
        }
        Ok(finished)
    }

    /// One full pass: recover, merge everything `ready`, export everything pending.
    ///
    /// Per-scenario failures are logged and reported, never propagated; only a
    /// failure to read coordination state aborts the pass.
    pub async fn run_once(&self) -> Result<TriggerReport> {
        let mut report = TriggerReport {
            recovered: self.recover_expired_claims().await?,
            exported: self.finish_delivered().await?,
            ..Default::default()
        };

        let ready: Vec<String> = self
            .manifests_in(ScenarioStatus::Ready)
            .await?
            .into_iter()
            .map(|m| m.scenario_id)
            .collect();
        let merges: Vec<StepOutcome> = stream::iter(ready)
            .map(|scenario_id| async move {
                match self.merger.merge(&scenario_id).await {
                    Ok(_) => StepOutcome::Done(scenario_id),
                    Err(e) if e.is_conflict() => StepOutcome::Conflict,
                    Err(e) => {
                        tracing::warn!("Merge of {} did not complete: {}", scenario_id, e);
                        StepOutcome::Failed(scenario_id)
                    }
                }
            })
            .buffer_unordered(self.ctx.config.processing.merge_concurrency.max(1))
            .collect()
            .await;
        for outcome in merges {
            match outcome {
                StepOutcome::Done(id) => report.merged.push(id),
                StepOutcome::Conflict => report.conflicts += 1,
                StepOutcome::Failed(id) => report.failed.push(id),
            }
        }

        let pending = self.poll().await?;
        let exports: Vec<StepOutcome> = stream::iter(pending)
            .map(|scenario_id| async move {
                match self.exporter.export(&scenario_id).await {
                    Ok(_) => StepOutcome::Done(scenario_id),
                    Err(e) if e.is_conflict() => StepOutcome::Conflict,
                    Err(e) => {
                        tracing::warn!("Export of {} did not complete: {}", scenario_id, e);
                        StepOutcome::Failed(scenario_id)
                    }
                }
            })
            .buffer_unordered(self.ctx.config.processing.export_concurrency.max(1))
            .collect()
            .await;
        for outcome in exports {
            match outcome {
                StepOutcome::Done(id) => report.exported.push(id),
                StepOutcome::Conflict => report.conflicts += 1,
                StepOutcome::Failed(id) => report.failed.push(id),
            }
        }

        report.merged.sort();
        report.exported.sort();
        report.failed.sort();
        if !report.is_idle() {
            tracing::info!("Trigger pass: {}", report);
        }
        Ok(report)
    }

    async fn manifests_in(&self, status: ScenarioStatus) -> Result<Vec<ScenarioManifest>> {
        let mut manifests = Vec::new();
        for scenario_id in self.ctx.state.list_scenarios().await? {
            if let Some(manifest) = self.ctx.state.load_manifest(&scenario_id).await? {
                if manifest.status == status {
                    manifests.push(manifest);
                }
            }
        }
        Ok(manifests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::{Claim, ExportRecord, MergedArtifact};
    use bytes::Bytes;
    use chrono::Utc;
    use std::time::Duration;

    fn context() -> PipelineContext {
        PipelineContext::new(Config::in_memory()).unwrap()
    }

    async fn put_manifest(ctx: &PipelineContext, id: &str, status: ScenarioStatus) {
        let mut manifest = ScenarioManifest::new(id, "nyc", 1);
        manifest.received_chunk_ids.insert("c1".to_string());
        manifest.status = status;
        ctx.state.create_manifest(&manifest).await.unwrap();
    }

    async fn put_merged(ctx: &PipelineContext, id: &str) {
        put_manifest(ctx, id, ScenarioStatus::Merged).await;
        let content = Bytes::from_static(b"h3_index,prediction\n8d2a1072b59ffff,1.5\n");
        ctx.chunks.put_merged(id, content.clone()).await.unwrap();
        ctx.state
            .put_artifact(&MergedArtifact {
                scenario_id: id.to_string(),
                study_area: "nyc".to_string(),
                artifact_uri: ctx.chunks.merged_uri(id),
                chunk_ids: vec!["c1".to_string()],
                cell_count: 1,
                size_bytes: content.len() as u64,
                merged_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_poll_lists_unexported_merged_scenarios() {
        let ctx = context();
        put_merged(&ctx, "s2").await;
        put_merged(&ctx, "s1").await;
        put_manifest(&ctx, "s3", ScenarioStatus::Collecting).await;

        let mut done = ExportRecord::new("s2", "memory://delivery/s2.csv");
        done.exported_at = Some(Utc::now());
        ctx.state.create_export_record(&done).await.unwrap();

        let trigger = ExportTrigger::new(ctx);
        assert_eq!(trigger.poll().await.unwrap(), vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn test_run_once_exports_merged_scenario() {
        let ctx = context();
        put_merged(&ctx, "s1").await;
        let trigger = ExportTrigger::new(ctx.clone());

        let report = trigger.run_once().await.unwrap();
        assert_eq!(report.exported, vec!["s1".to_string()]);
        assert!(report.failed.is_empty());

        let manifest = ctx.state.manifest("s1").await.unwrap();
        assert_eq!(manifest.status, ScenarioStatus::Exported);
        let record = ctx.state.load_export_record("s1").await.unwrap().unwrap();
        assert!(record.is_exported());
        assert_eq!(record.attempt_count, 1);

        let second = trigger.run_once().await.unwrap();
        assert!(second.is_idle());
        assert_eq!(trigger.poll().await.unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_recover_expired_merge_claim() {
        let ctx = context();
        put_manifest(&ctx, "s1", ScenarioStatus::Merging).await;
        ctx.state
            .update_manifest("s1", |m| {
                m.claim = Some(Claim::new(Duration::ZERO));
                Ok(())
            })
            .await
            .unwrap();
        put_manifest(&ctx, "s2", ScenarioStatus::Merging).await;
        ctx.state
            .update_manifest("s2", |m| {
                m.claim = Some(Claim::new(Duration::from_secs(600)));
                Ok(())
            })
            .await
            .unwrap();

        let trigger = ExportTrigger::new(ctx.clone());
        assert_eq!(trigger.recover_expired_claims().await.unwrap(), 1);

        let s1 = ctx.state.manifest("s1").await.unwrap();
        assert_eq!(s1.status, ScenarioStatus::Ready);
        assert!(s1.claim.is_none());
        let s2 = ctx.state.manifest("s2").await.unwrap();
        assert_eq!(s2.status, ScenarioStatus::Merging);
    }

    #[tokio::test]
    async fn test_recover_expired_export_claim() {
        let ctx = context();
        put_merged(&ctx, "s1").await;
        let mut record = ExportRecord::new("s1", "memory://delivery/s1.csv");
        record.claim = Some(Claim::new(Duration::ZERO));
        ctx.state.create_export_record(&record).await.unwrap();

        let trigger = ExportTrigger::new(ctx.clone());
        assert_eq!(trigger.recover_expired_claims().await.unwrap(), 1);
        let record = ctx.state.load_export_record("s1").await.unwrap().unwrap();
        assert!(record.claim.is_none());
    }

    #[tokio::test]
    async fn test_run_once_finishes_delivered_scenario() {
        let ctx = context();
        put_merged(&ctx, "s1").await;
        let mut delivered = ExportRecord::new("s1", "memory://delivery/s1.csv");
        delivered.attempt_count = 1;
        delivered.exported_at = Some(Utc::now());
        ctx.state.create_export_record(&delivered).await.unwrap();

        let trigger = ExportTrigger::new(ctx.clone());
        assert_eq!(trigger.poll().await.unwrap(), Vec::<String>::new());

        let report = trigger.run_once().await.unwrap();
        assert_eq!(report.exported, vec!["s1".to_string()]);
        assert_eq!(ctx.state.manifest("s1").await.unwrap().status, ScenarioStatus::Exported);

        let record = ctx.state.load_export_record("s1").await.unwrap().unwrap();
        assert_eq!(record.attempt_count, 1);
        assert!(trigger.run_once().await.unwrap().is_idle());
    }

    #[test]
    fn test_report_display() {
        let report = TriggerReport {
            recovered: 1,
            merged: vec!["a".into()],
            exported: vec!["a".into(), "b".into()],
            conflicts: 3,
            failed: vec![],
        };
        let display = report.to_string();
        assert!(display.contains("Exported: 2"));
        assert!(display.contains("Conflicts: 3"));
        assert!(!report.is_idle());
        assert!(TriggerReport::default().is_idle());
    }
}
