//! Backfill scheduler
//!
//! Re-runs extraction over stale documents in bounded batches. Re-runs are safe because
//! every relationship write is an upsert on `(from, to, type, source)`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BackfillConfig;
use crate::domain::audit::{AuditOperation, AuditRecord, AuditRepository, BackfillRun};
use crate::domain::documents::{
    BackfillSelection, DocumentRepository, ProcessingReport, StoredDocument,
};
use crate::domain::relationships::PromotionReport;
use crate::error::{Error, Result};

/// Why a backfill was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillReason {
    NewSourceConnected,
    RuleUpdated,
    Manual,
}

impl BackfillReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewSourceConnected => "new_source_connected",
            Self::RuleUpdated => "rule_updated",
            Self::Manual => "manual",
        }
    }

    /// Accepts `rule-updated` and `rule_updated`
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "new_source_connected" => Some(Self::NewSourceConnected),
            "rule_updated" => Some(Self::RuleUpdated),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

impl std::fmt::Display for BackfillReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A backfill request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillTrigger {
    pub workspace_id: String,
    pub reason: BackfillReason,
    /// Empty means every source type
    #[serde(default)]
    pub source_types: Vec<String>,
    /// Only documents ingested at or after this instant
    pub cutoff: Option<DateTime<Utc>>,
}

impl BackfillTrigger {
    pub fn new(workspace_id: impl Into<String>, reason: BackfillReason) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            reason,
            source_types: Vec::new(),
            cutoff: None,
        }
    }

    pub fn with_source_types(mut self, source_types: Vec<String>) -> Self {
        self.source_types = source_types
            .into_iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        self
    }

    pub fn with_cutoff(mut self, cutoff: DateTime<Utc>) -> Self {
        self.cutoff = Some(cutoff);
        self
    }

    fn selection(&self, rule_version: u32) -> BackfillSelection {
        BackfillSelection {
            workspace_id: self.workspace_id.clone(),
            source_types: self.source_types.clone(),
            ingested_since: self.cutoff,
            current_rule_version: rule_version,
            include_processed: self.reason == BackfillReason::Manual,
            include_semantic_skipped: self.reason != BackfillReason::Manual,
        }
    }

    fn filter_json(&self) -> serde_json::Value {
        serde_json::json!({
            "source_types": self.source_types,
            "cutoff": self.cutoff.map(|c| c.to_rfc3339()),
        })
    }
}

/// Re-runs the relationship stages over one stored document
#[async_trait]
pub trait ExtractionDriver: Send + Sync {
    async fn reprocess(&self, document: &StoredDocument) -> Result<ProcessingReport>;

    /// Promote pending rows whose target already exists
    async fn promote_ready(&self, workspace_id: &str) -> Result<PromotionReport>;
}

/// Live counters of the current run
#[derive(Debug, Default)]
pub struct BackfillProgress {
    scanned: AtomicU64,
    processed: AtomicU64,
    created: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`BackfillProgress`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub scanned: u64,
    pub processed: u64,
    pub created: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl BackfillProgress {
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            scanned: self.scanned.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.scanned.store(0, Ordering::Relaxed);
        self.processed.store(0, Ordering::Relaxed);
        self.created.store(0, Ordering::Relaxed);
        self.skipped.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
    }
}

/// Result of a backfill run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillReport {
    pub run_id: String,
    pub workspace_id: String,
    pub reason: BackfillReason,
    pub scanned: u64,
    pub processed: u64,
    pub created: u64,
    pub skipped: u64,
    pub failed: u64,
    /// Pending rows promoted before the scan
    pub promoted: u64,
    /// `document_id: reason` for every skipped or failed document
    pub failures: Vec<String>,
}

enum ItemResult {
    Processed(ProcessingReport),
    Skipped(String),
    Failed(String),
}

pub struct BackfillScheduler {
    documents: Arc<dyn DocumentRepository>,
    audit: Arc<dyn AuditRepository>,
    config: BackfillConfig,
    rule_version: u32,
    progress: Arc<BackfillProgress>,
}

impl BackfillScheduler {
    pub fn new(
        documents: Arc<dyn DocumentRepository>,
        audit: Arc<dyn AuditRepository>,
        config: BackfillConfig,
        rule_version: u32,
    ) -> Self {
        Self {
            documents,
            audit,
            config,
            rule_version,
            progress: Arc::new(BackfillProgress::default()),
        }
    }

    /// Counters of the current (or last) run
    pub fn progress(&self) -> Arc<BackfillProgress> {
        self.progress.clone()
    }

    /// Run a backfill and record it
    ///
    /// Per-document failures are counted, not raised; the run only fails when selection
    /// or bookkeeping fails.
    pub async fn run(
        &self,
        driver: &dyn ExtractionDriver,
        trigger: &BackfillTrigger,
    ) -> Result<BackfillReport> {
        if trigger.workspace_id.trim().is_empty() {
            return Err(Error::Validation("backfill needs a workspace id".to_string()));
        }

        let started_at = Utc::now();
        self.progress.reset();

        let promotion = driver.promote_ready(&trigger.workspace_id).await?;
        let ids = self
            .documents
            .select_for_backfill(&trigger.selection(self.rule_version))
            .await?;

        let mut report = BackfillReport {
            run_id: Uuid::new_v4().to_string(),
            workspace_id: trigger.workspace_id.clone(),
            reason: trigger.reason,
            scanned: ids.len() as u64,
            processed: 0,
            created: 0,
            skipped: 0,
            failed: 0,
            promoted: promotion.promoted as u64,
            failures: Vec::new(),
        };
        self.progress.scanned.store(report.scanned, Ordering::Relaxed);

        info!(
            run_id = %report.run_id,
            workspace_id = %trigger.workspace_id,
            reason = %trigger.reason,
            scanned = report.scanned,
            promoted = report.promoted,
            "Backfill started"
        );

        let batch_size = self.config.batch_size.max(1);
        let delay = Duration::from_millis(self.config.inter_batch_delay_ms);
        let batches: Vec<&[String]> = ids.chunks(batch_size).collect();

        for (index, batch) in batches.iter().enumerate() {
            let results = join_all(batch.iter().map(|id| self.process_one(driver, id))).await;

            for (id, result) in batch.iter().zip(results) {
                match result {
                    ItemResult::Processed(processed) => {
                        report.processed += 1;
                        report.created += processed.created as u64;
                        self.progress.processed.fetch_add(1, Ordering::Relaxed);
                        self.progress
                            .created
                            .fetch_add(processed.created as u64, Ordering::Relaxed);
                    }
                    ItemResult::Skipped(reason) => {
                        report.skipped += 1;
                        report.failures.push(format!("{}: {}", id, reason));
                        self.progress.skipped.fetch_add(1, Ordering::Relaxed);
                    }
                    ItemResult::Failed(reason) => {
                        report.failed += 1;
                        report.failures.push(format!("{}: {}", id, reason));
                        self.progress.failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            debug!(
                run_id = %report.run_id,
                batch = index + 1,
                batches = batches.len(),
                processed = report.processed,
                created = report.created,
                "Backfill batch complete"
            );

            if index + 1 < batches.len() && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        let run = BackfillRun {
            id: report.run_id.clone(),
            workspace_id: report.workspace_id.clone(),
            reason: report.reason,
            filter: trigger.filter_json(),
            scanned: report.scanned,
            processed: report.processed,
            created: report.created,
            skipped: report.skipped,
            failed: report.failed,
            failures: report.failures.clone(),
            started_at,
            finished_at: Some(Utc::now()),
        };
        self.audit.save_backfill_run(&run).await?;

        let detail = serde_json::to_value(&report)
            .map_err(|e| Error::Other(format!("Failed to serialize backfill report: {}", e)))?;
        self.audit
            .record(
                &AuditRecord::new(
                    &report.workspace_id,
                    AuditOperation::Backfill,
                    vec![report.run_id.clone()],
                    report.reason.as_str(),
                )
                .with_detail(detail),
            )
            .await?;

        info!(
            run_id = %report.run_id,
            scanned = report.scanned,
            processed = report.processed,
            created = report.created,
            skipped = report.skipped,
            failed = report.failed,
            "Backfill finished"
        );

        Ok(report)
    }

    async fn process_one(&self, driver: &dyn ExtractionDriver, id: &str) -> ItemResult {
        let stored = match self.documents.get_document(id).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return ItemResult::Skipped("document no longer exists".to_string()),
            Err(e) => return ItemResult::Failed(e.to_string()),
        };

        match driver.reprocess(&stored).await {
            Ok(report) => ItemResult::Processed(report),
            Err(e) if e.is_validation() => {
                warn!(document_id = %id, error = %e, "Backfill skipped invalid document");
                ItemResult::Skipped(e.to_string())
            }
            Err(e) => {
                warn!(document_id = %id, error = %e, "Backfill failed for document");
                ItemResult::Failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_parse() {
        assert_eq!(BackfillReason::parse("rule-updated"), Some(BackfillReason::RuleUpdated));
        assert_eq!(
            BackfillReason::parse("NEW_SOURCE_CONNECTED"),
            Some(BackfillReason::NewSourceConnected)
        );
        assert_eq!(BackfillReason::parse("manual"), Some(BackfillReason::Manual));
        assert_eq!(BackfillReason::parse("whenever"), None);
    }

    #[test]
    fn test_selection_by_reason() {
        let manual = BackfillTrigger::new("ws", BackfillReason::Manual).selection(1);
        assert!(manual.include_processed);
        assert!(!manual.include_semantic_skipped);

        let rules = BackfillTrigger::new("ws", BackfillReason::RuleUpdated)
            .with_source_types(vec![" GitHub ".into(), "".into()])
            .selection(2);
        assert!(!rules.include_processed);
        assert!(rules.include_semantic_skipped);
        assert_eq!(rules.source_types, vec!["github".to_string()]);
        assert_eq!(rules.current_rule_version, 2);
    }

    #[test]
    fn test_progress_snapshot() {
        let progress = BackfillProgress::default();
        progress.scanned.store(3, Ordering::Relaxed);
        progress.created.fetch_add(2, Ordering::Relaxed);
        assert_eq!(
            progress.snapshot(),
            ProgressSnapshot {
                scanned: 3,
                created: 2,
                ..Default::default()
            }
        );
        progress.reset();
        assert_eq!(progress.snapshot(), ProgressSnapshot::default());
    }
}
