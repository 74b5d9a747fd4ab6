//! SQLite implementation of the AuditRepository

use async_trait::async_trait;
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::domain::audit::{
    AuditOperation, AuditOutcome, AuditRecord, AuditRepository, BackfillRun, DeadLetter,
};
use crate::domain::backfill::BackfillReason;
use crate::error::{Error, Result};

use super::{from_json, parse_timestamp, timestamp, to_json};

#[derive(Clone)]
pub struct SqliteAuditRepository {
    pool: SqlitePool,
}

impl SqliteAuditRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// Insert an audit record on an open connection, so admin operations can audit inside
/// their own transaction
pub(crate) async fn insert_audit(conn: &mut SqliteConnection, record: &AuditRecord) -> Result<()> {
    let subject_ids = to_json(&record.subject_ids, "audit subjects")?;
    let detail = to_json(&record.detail, "audit detail")?;

    sqlx::query(
        r#"
        INSERT INTO audit_log (
            id, workspace_id, operation, subject_ids, reason, outcome, detail, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.id)
    .bind(&record.workspace_id)
    .bind(record.operation.as_str())
    .bind(&subject_ids)
    .bind(&record.reason)
    .bind(record.outcome.as_str())
    .bind(&detail)
    .bind(timestamp(&record.created_at))
    .execute(conn)
    .await?;

    debug!(
        audit_id = %record.id,
        operation = %record.operation,
        outcome = record.outcome.as_str(),
        "Audit record written"
    );
    Ok(())
}

#[async_trait]
impl AuditRepository for SqliteAuditRepository {
    async fn record(&self, record: &AuditRecord) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        insert_audit(&mut conn, record).await
    }

    async fn list(&self, workspace_id: &str, limit: u32) -> Result<Vec<AuditRecord>> {
        let rows: Vec<AuditRow> = sqlx::query_as(
            "SELECT * FROM audit_log WHERE workspace_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(workspace_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_record()).collect()
    }

    async fn record_dead_letter(&self, letter: &DeadLetter) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dead_letters (id, workspace_id, document_id, stage, error, attempts, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&letter.id)
        .bind(&letter.workspace_id)
        .bind(&letter.document_id)
        .bind(&letter.stage)
        .bind(&letter.error)
        .bind(letter.attempts as i64)
        .bind(timestamp(&letter.created_at))
        .execute(&self.pool)
        .await?;

        debug!(
            dead_letter_id = %letter.id,
            stage = %letter.stage,
            document_id = ?letter.document_id,
            "Dead letter recorded"
        );
        Ok(())
    }

    async fn list_dead_letters(&self, workspace_id: &str) -> Result<Vec<DeadLetter>> {
        let rows: Vec<DeadLetterRow> = sqlx::query_as(
            "SELECT * FROM dead_letters WHERE workspace_id = ? ORDER BY created_at DESC",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into_letter()).collect())
    }

    async fn save_backfill_run(&self, run: &BackfillRun) -> Result<()> {
        let filter = to_json(&run.filter, "backfill filter")?;
        let failures = to_json(&run.failures, "backfill failures")?;

        sqlx::query(
            r#"
            INSERT INTO backfill_runs (
                id, workspace_id, reason, filter, scanned, processed, created,
                skipped, failed, failures, started_at, finished_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                scanned = excluded.scanned,
                processed = excluded.processed,
                created = excluded.created,
                skipped = excluded.skipped,
                failed = excluded.failed,
                failures = excluded.failures,
                finished_at = excluded.finished_at
            "#,
        )
        .bind(&run.id)
        .bind(&run.workspace_id)
        .bind(run.reason.as_str())
        .bind(&filter)
        .bind(run.scanned as i64)
        .bind(run.processed as i64)
        .bind(run.created as i64)
        .bind(run.skipped as i64)
        .bind(run.failed as i64)
        .bind(&failures)
        .bind(timestamp(&run.started_at))
        .bind(run.finished_at.as_ref().map(timestamp))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_backfill_runs(&self, workspace_id: &str) -> Result<Vec<BackfillRun>> {
        let rows: Vec<BackfillRunRow> = sqlx::query_as(
            "SELECT * FROM backfill_runs WHERE workspace_id = ? ORDER BY started_at DESC",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_run()).collect()
    }
}

#[derive(Debug, FromRow)]
struct AuditRow {
    id: String,
    workspace_id: String,
    operation: String,
    subject_ids: String,
    reason: String,
    outcome: String,
    detail: String,
    created_at: String,
}

impl AuditRow {
    fn into_record(self) -> Result<AuditRecord> {
        let operation = AuditOperation::parse(&self.operation)
            .ok_or_else(|| Error::Other(format!("Invalid audit operation: {}", self.operation)))?;
        let outcome = AuditOutcome::parse(&self.outcome)
            .ok_or_else(|| Error::Other(format!("Invalid audit outcome: {}", self.outcome)))?;

        Ok(AuditRecord {
            id: self.id,
            workspace_id: self.workspace_id,
            operation,
            subject_ids: from_json(&self.subject_ids),
            reason: self.reason,
            outcome,
            detail: from_json(&self.detail),
            created_at: parse_timestamp(&self.created_at),
        })
    }
}

#[derive(Debug, FromRow)]
struct DeadLetterRow {
    id: String,
    workspace_id: String,
    document_id: Option<String>,
    stage: String,
    error: String,
    attempts: i64,
    created_at: String,
}

impl DeadLetterRow {
    fn into_letter(self) -> DeadLetter {
        DeadLetter {
            id: self.id,
            workspace_id: self.workspace_id,
            document_id: self.document_id,
            stage: self.stage,
            error: self.error,
            attempts: self.attempts.max(0) as u32,
            created_at: parse_timestamp(&self.created_at),
        }
    }
}

#[derive(Debug, FromRow)]
struct BackfillRunRow {
    id: String,
    workspace_id: String,
    reason: String,
    filter: String,
    scanned: i64,
    processed: i64,
    created: i64,
    skipped: i64,
    failed: i64,
    failures: String,
    started_at: String,
    finished_at: Option<String>,
}

impl BackfillRunRow {
    fn into_run(self) -> Result<BackfillRun> {
        let reason = BackfillReason::parse(&self.reason)
            .ok_or_else(|| Error::Other(format!("Invalid backfill reason: {}", self.reason)))?;

        Ok(BackfillRun {
            id: self.id,
            workspace_id: self.workspace_id,
            reason,
            filter: from_json(&self.filter),
            scanned: self.scanned.max(0) as u64,
            processed: self.processed.max(0) as u64,
            created: self.created.max(0) as u64,
            skipped: self.skipped.max(0) as u64,
            failed: self.failed.max(0) as u64,
            failures: from_json(&self.failures),
            started_at: parse_timestamp(&self.started_at),
            finished_at: self.finished_at.as_deref().map(parse_timestamp),
        })
    }
}
