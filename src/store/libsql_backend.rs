//! libSQL backend — one store implementing every capability trait.
//!
//! Supports local file and in-memory databases. All timestamps are stored
//! as RFC 3339 text; comparisons happen in SQL on the canonical string
//! form. Conditional updates return their row count so callers can tell a
//! CAS miss from a hit.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;
use uuid::Uuid;

use crate::classify::ErrorClass;
use crate::error::StorageError;
use crate::events::model::{EventType, ResolutionStatus, Severity, SystemEvent};
use crate::jobs::model::{JobRecord, JobSource, JobStatus};
use crate::store::migrations;
use crate::store::traits::{
    DocumentRecord, DocumentStatus, JobStore, LedgerStore, PipelineStore, ReportRecord,
    ReportStatus, SignatureAggregate, WorkerStore,
};
use crate::workers::model::{WorkerRecord, WorkerStatus};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StorageError::Connection(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StorageError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&store.conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StorageError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StorageError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| StorageError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&store.conn).await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    // ── Producer-side helpers ───────────────────────────────────────
    // Used by the pipeline services that create jobs/documents/reports,
    // and by tests. The sentinel itself never inserts these rows.

    /// Insert a job row as a producer would.
    pub async fn insert_job(&self, job: &JobRecord) -> Result<(), StorageError> {
        let table = job.source.table();
        let sql = format!(
            "INSERT INTO {table} (id, deal_id, document_id, status, attempt, max_attempts,
                 last_error, leased_until, lease_owner, next_run_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        );
        self.conn()
            .execute(
                &sql,
                params![
                    job.id.clone(),
                    opt_text(&job.deal_id),
                    opt_text(&job.document_id),
                    job.status.as_str(),
                    job.attempt as i64,
                    job.max_attempts as i64,
                    opt_text(&job.last_error),
                    opt_datetime(&job.leased_until),
                    opt_text(&job.lease_owner),
                    opt_datetime(&job.next_run_at),
                    job.created_at.to_rfc3339(),
                    job.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| query_err(table, "insert_job", e))?;
        Ok(())
    }

    /// Upsert a document row.
    pub async fn upsert_document(&self, doc: &DocumentRecord) -> Result<(), StorageError> {
        self.conn()
            .execute(
                "INSERT INTO documents (id, deal_id, status, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (id) DO UPDATE SET status = ?3, updated_at = ?4",
                params![
                    doc.id.clone(),
                    doc.deal_id.clone(),
                    doc.status.as_str(),
                    doc.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| query_err("documents", "upsert_document", e))?;
        Ok(())
    }

    /// Upsert a report row.
    pub async fn upsert_report(&self, report: &ReportRecord) -> Result<(), StorageError> {
        self.conn()
            .execute(
                "INSERT INTO reports (id, deal_id, status, started_generating_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (id) DO UPDATE SET status = ?3, started_generating_at = ?4, updated_at = ?5",
                params![
                    report.id.clone(),
                    report.deal_id.clone(),
                    report.status.as_str(),
                    opt_datetime(&report.started_generating_at),
                    report.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| query_err("reports", "upsert_report", e))?;
        Ok(())
    }

    /// Fetch one job row (tests and diagnostics).
    pub async fn get_job(
        &self,
        source: JobSource,
        id: &str,
    ) -> Result<Option<JobRecord>, StorageError> {
        let table = source.table();
        let sql = format!("SELECT {JOB_COLUMNS} FROM {table} WHERE id = ?1");
        let mut rows = self
            .conn()
            .query(&sql, params![id])
            .await
            .map_err(|e| query_err(table, "get_job", e))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(source, &row))),
            Ok(None) => Ok(None),
            Err(e) => Err(query_err(table, "get_job", e)),
        }
    }

    /// Fetch one event row by id (tests and diagnostics).
    pub async fn get_event(&self, id: Uuid) -> Result<Option<SystemEvent>, StorageError> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM system_events WHERE id = ?1");
        let mut rows = self
            .conn()
            .query(&sql, params![id.to_string()])
            .await
            .map_err(|e| query_err("system_events", "get_event", e))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_event(&row))),
            Ok(None) => Ok(None),
            Err(e) => Err(query_err("system_events", "get_event", e)),
        }
    }

    /// Events matching a resolution status, oldest first (tests/dashboards).
    pub async fn list_events_by_resolution(
        &self,
        status: ResolutionStatus,
        limit: usize,
    ) -> Result<Vec<SystemEvent>, StorageError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM system_events
             WHERE resolution_status = ?1 ORDER BY created_at ASC LIMIT ?2"
        );
        let mut rows = self
            .conn()
            .query(&sql, params![status.as_str(), limit as i64])
            .await
            .map_err(|e| query_err("system_events", "list_events_by_resolution", e))?;
        let mut events = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            events.push(row_to_event(&row));
        }
        Ok(events)
    }

    /// Events of a given type, newest first (tests/dashboards).
    pub async fn list_events_by_type(
        &self,
        event_type: EventType,
        limit: usize,
    ) -> Result<Vec<SystemEvent>, StorageError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM system_events
             WHERE event_type = ?1 ORDER BY created_at DESC LIMIT ?2"
        );
        let mut rows = self
            .conn()
            .query(&sql, params![event_type.as_str(), limit as i64])
            .await
            .map_err(|e| query_err("system_events", "list_events_by_type", e))?;
        let mut events = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            events.push(row_to_event(&row));
        }
        Ok(events)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text(s: &Option<String>) -> libsql::Value {
    match s {
        Some(v) => libsql::Value::Text(v.clone()),
        None => libsql::Value::Null,
    }
}

fn opt_datetime(dt: &Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(v) => libsql::Value::Text(v.to_rfc3339()),
        None => libsql::Value::Null,
    }
}

fn opt_int(v: Option<u32>) -> libsql::Value {
    match v {
        Some(n) => libsql::Value::Integer(n as i64),
        None => libsql::Value::Null,
    }
}

/// Wrap a libsql error, detecting schema drift so readers can degrade
/// instead of failing the tick.
fn query_err(table: &str, op: &str, e: libsql::Error) -> StorageError {
    let msg = e.to_string();
    let lowered = msg.to_lowercase();
    if lowered.contains("no such column") || lowered.contains("no such table") {
        StorageError::SchemaMismatch {
            table: table.to_string(),
            detail: msg,
        }
    } else {
        StorageError::Query(format!("{op}: {msg}"))
    }
}

/// Job column order shared by every job-table query.
const JOB_COLUMNS: &str = "id, deal_id, document_id, status, attempt, max_attempts, last_error, \
                           leased_until, lease_owner, next_run_at, created_at, updated_at";

fn row_to_job(source: JobSource, row: &libsql::Row) -> JobRecord {
    let leased_until: Option<String> = row.get(7).ok();
    let next_run_at: Option<String> = row.get(9).ok();
    JobRecord {
        id: row.get(0).unwrap_or_default(),
        source,
        deal_id: row.get(1).ok(),
        document_id: row.get(2).ok(),
        status: JobStatus::parse(&row.get::<String>(3).unwrap_or_default()),
        attempt: row.get::<i64>(4).unwrap_or(0).max(0) as u32,
        max_attempts: row.get::<i64>(5).unwrap_or(0).max(0) as u32,
        last_error: row.get(6).ok(),
        leased_until: leased_until.as_deref().map(parse_datetime),
        lease_owner: row.get(8).ok(),
        next_run_at: next_run_at.as_deref().map(parse_datetime),
        created_at: parse_datetime(&row.get::<String>(10).unwrap_or_default()),
        updated_at: parse_datetime(&row.get::<String>(11).unwrap_or_default()),
    }
}

fn row_to_worker(row: &libsql::Row) -> WorkerRecord {
    WorkerRecord {
        id: row.get(0).unwrap_or_default(),
        kind: row.get(1).unwrap_or_default(),
        status: WorkerStatus::parse(&row.get::<String>(2).unwrap_or_default()),
        last_heartbeat_at: parse_datetime(&row.get::<String>(3).unwrap_or_default()),
        jobs_processed: row.get::<i64>(4).unwrap_or(0).max(0) as u64,
        jobs_failed: row.get::<i64>(5).unwrap_or(0).max(0) as u64,
        consecutive_failures: row.get::<i64>(6).unwrap_or(0).max(0) as u32,
        last_error: row.get(7).ok(),
        created_at: parse_datetime(&row.get::<String>(8).unwrap_or_default()),
        updated_at: parse_datetime(&row.get::<String>(9).unwrap_or_default()),
    }
}

const WORKER_COLUMNS: &str = "id, kind, status, last_heartbeat_at, jobs_processed, jobs_failed, \
                              consecutive_failures, last_error, created_at, updated_at";

/// Event column order shared by every ledger query.
const EVENT_COLUMNS: &str = "id, event_type, severity, signature, source, job_id, job_source, \
                             deal_id, document_id, error_class, error_code, message, stack, \
                             resolution_status, resolved_by, resolved_at, resolution_note, \
                             attempt, max_attempts, next_retry_at, payload, environment, \
                             release, created_at";

fn row_to_event(row: &libsql::Row) -> SystemEvent {
    let resolved_at: Option<String> = row.get(15).ok();
    let next_retry_at: Option<String> = row.get(19).ok();
    let payload: Option<String> = row.get(20).ok();
    SystemEvent {
        id: row
            .get::<String>(0)
            .ok()
            .and_then(|s| Uuid::parse_str(&s).ok())
            .unwrap_or_else(Uuid::nil),
        event_type: EventType::parse(&row.get::<String>(1).unwrap_or_default()),
        severity: Severity::parse(&row.get::<String>(2).unwrap_or_default()),
        signature: row.get(3).ok(),
        source: row.get(4).unwrap_or_default(),
        job_id: row.get(5).ok(),
        job_source: row.get(6).ok(),
        deal_id: row.get(7).ok(),
        document_id: row.get(8).ok(),
        error_class: row
            .get::<String>(9)
            .ok()
            .and_then(|s| serde_json::from_value(serde_json::Value::String(s)).ok()),
        error_code: row.get(10).ok(),
        message: row.get(11).unwrap_or_default(),
        stack: row.get(12).ok(),
        resolution_status: ResolutionStatus::parse(&row.get::<String>(13).unwrap_or_default()),
        resolved_by: row.get(14).ok(),
        resolved_at: resolved_at.as_deref().map(parse_datetime),
        resolution_note: row.get(16).ok(),
        attempt: row.get::<i64>(17).ok().map(|v| v.max(0) as u32),
        max_attempts: row.get::<i64>(18).ok().map(|v| v.max(0) as u32),
        next_retry_at: next_retry_at.as_deref().map(parse_datetime),
        payload: payload.and_then(|s| serde_json::from_str(&s).ok()),
        environment: row.get(21).unwrap_or_default(),
        release: row.get(22).unwrap_or_default(),
        created_at: parse_datetime(&row.get::<String>(23).unwrap_or_default()),
    }
}

fn error_class_str(class: &Option<ErrorClass>) -> libsql::Value {
    match class {
        Some(c) => libsql::Value::Text(c.as_str().to_string()),
        None => libsql::Value::Null,
    }
}

// ── JobStore ────────────────────────────────────────────────────────

#[async_trait]
impl JobStore for LibSqlStore {
    async fn list_stuck_running(
        &self,
        source: JobSource,
        expired_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StorageError> {
        let table = source.table();
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM {table}
             WHERE status = 'running' AND leased_until IS NOT NULL AND leased_until <= ?1
             ORDER BY leased_until ASC LIMIT ?2"
        );
        let mut rows = self
            .conn()
            .query(&sql, params![expired_before.to_rfc3339(), limit as i64])
            .await
            .map_err(|e| query_err(table, "list_stuck_running", e))?;
        let mut jobs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            jobs.push(row_to_job(source, &row));
        }
        Ok(jobs)
    }

    async fn list_failed(
        &self,
        source: JobSource,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StorageError> {
        let table = source.table();
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM {table}
             WHERE status = 'failed' ORDER BY updated_at ASC LIMIT ?1"
        );
        let mut rows = self
            .conn()
            .query(&sql, params![limit as i64])
            .await
            .map_err(|e| query_err(table, "list_failed", e))?;
        let mut jobs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            jobs.push(row_to_job(source, &row));
        }
        Ok(jobs)
    }

    async fn list_running(
        &self,
        source: JobSource,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StorageError> {
        let table = source.table();
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM {table}
             WHERE status = 'running' ORDER BY updated_at ASC LIMIT ?1"
        );
        let mut rows = self
            .conn()
            .query(&sql, params![limit as i64])
            .await
            .map_err(|e| query_err(table, "list_running", e))?;
        let mut jobs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            jobs.push(row_to_job(source, &row));
        }
        Ok(jobs)
    }

    async fn list_for_document(
        &self,
        source: JobSource,
        document_id: &str,
    ) -> Result<Vec<JobRecord>, StorageError> {
        let table = source.table();
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM {table}
             WHERE document_id = ?1 ORDER BY created_at ASC"
        );
        let mut rows = self
            .conn()
            .query(&sql, params![document_id])
            .await
            .map_err(|e| query_err(table, "list_for_document", e))?;
        let mut jobs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            jobs.push(row_to_job(source, &row));
        }
        Ok(jobs)
    }

    async fn list_stale_active_for_deal(
        &self,
        deal_id: &str,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, StorageError> {
        let cutoff = older_than.to_rfc3339();
        let mut jobs = Vec::new();
        for source in JobSource::ALL {
            let table = source.table();
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM {table}
                 WHERE deal_id = ?1 AND status IN ('queued', 'running', 'failed')
                   AND updated_at <= ?2
                 ORDER BY updated_at ASC"
            );
            let mut rows = self
                .conn()
                .query(&sql, params![deal_id, cutoff.clone()])
                .await
                .map_err(|e| query_err(table, "list_stale_active_for_deal", e))?;
            while let Ok(Some(row)) = rows.next().await {
                jobs.push(row_to_job(source, &row));
            }
        }
        Ok(jobs)
    }

    async fn release_lease(&self, source: JobSource, id: &str) -> Result<bool, StorageError> {
        let table = source.table();
        let sql = format!(
            "UPDATE {table}
             SET status = 'queued', leased_until = NULL, lease_owner = NULL, updated_at = ?2
             WHERE id = ?1 AND status = 'running'"
        );
        let affected = self
            .conn()
            .execute(&sql, params![id, Utc::now().to_rfc3339()])
            .await
            .map_err(|e| query_err(table, "release_lease", e))?;
        Ok(affected > 0)
    }

    async fn schedule_retry(
        &self,
        source: JobSource,
        id: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let table = source.table();
        let sql = format!(
            "UPDATE {table}
             SET status = 'queued', next_run_at = ?2, leased_until = NULL,
                 lease_owner = NULL, updated_at = ?3
             WHERE id = ?1 AND status = 'failed'"
        );
        let affected = self
            .conn()
            .execute(
                &sql,
                params![id, next_run_at.to_rfc3339(), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| query_err(table, "schedule_retry", e))?;
        Ok(affected > 0)
    }

    async fn mark_dead(&self, source: JobSource, id: &str) -> Result<bool, StorageError> {
        let table = source.table();
        let sql = format!(
            "UPDATE {table} SET status = 'dead', updated_at = ?2
             WHERE id = ?1 AND status = 'failed'"
        );
        let affected = self
            .conn()
            .execute(&sql, params![id, Utc::now().to_rfc3339()])
            .await
            .map_err(|e| query_err(table, "mark_dead", e))?;
        Ok(affected > 0)
    }
}

// ── WorkerStore ─────────────────────────────────────────────────────

#[async_trait]
impl WorkerStore for LibSqlStore {
    async fn upsert_heartbeat(
        &self,
        id: &str,
        kind: &str,
        status: WorkerStatus,
    ) -> Result<(), StorageError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO workers (id, kind, status, last_heartbeat_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (id) DO UPDATE SET
                     kind = ?2, status = ?3, last_heartbeat_at = ?4, updated_at = ?4",
                params![id, kind, status.as_str(), now],
            )
            .await
            .map_err(|e| query_err("workers", "upsert_heartbeat", e))?;
        Ok(())
    }

    async fn record_completion(
        &self,
        id: &str,
        failed: bool,
        error: Option<&str>,
    ) -> Result<(), StorageError> {
        let now = Utc::now().to_rfc3339();
        if failed {
            self.conn()
                .execute(
                    "UPDATE workers SET jobs_failed = jobs_failed + 1,
                         consecutive_failures = consecutive_failures + 1,
                         last_error = ?2, updated_at = ?3
                     WHERE id = ?1",
                    params![id, error.unwrap_or(""), now],
                )
                .await
                .map_err(|e| query_err("workers", "record_completion", e))?;
        } else {
            self.conn()
                .execute(
                    "UPDATE workers SET jobs_processed = jobs_processed + 1,
                         consecutive_failures = 0, updated_at = ?2
                     WHERE id = ?1",
                    params![id, now],
                )
                .await
                .map_err(|e| query_err("workers", "record_completion", e))?;
        }
        Ok(())
    }

    async fn list_alive_workers(&self) -> Result<Vec<WorkerRecord>, StorageError> {
        let sql = format!(
            "SELECT {WORKER_COLUMNS} FROM workers WHERE status = 'alive'
             ORDER BY last_heartbeat_at ASC"
        );
        let mut rows = self
            .conn()
            .query(&sql, ())
            .await
            .map_err(|e| query_err("workers", "list_alive_workers", e))?;
        let mut workers = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            workers.push(row_to_worker(&row));
        }
        Ok(workers)
    }

    async fn get_worker(&self, id: &str) -> Result<Option<WorkerRecord>, StorageError> {
        let sql = format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?1");
        let mut rows = self
            .conn()
            .query(&sql, params![id])
            .await
            .map_err(|e| query_err("workers", "get_worker", e))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_worker(&row))),
            Ok(None) => Ok(None),
            Err(e) => Err(query_err("workers", "get_worker", e)),
        }
    }

    async fn mark_worker_dead(&self, id: &str) -> Result<bool, StorageError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE workers SET status = 'dead', updated_at = ?2
                 WHERE id = ?1 AND status = 'alive'",
                params![id, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| query_err("workers", "mark_worker_dead", e))?;
        Ok(affected > 0)
    }
}

// ── LedgerStore ─────────────────────────────────────────────────────

#[async_trait]
impl LedgerStore for LibSqlStore {
    async fn insert_event(&self, event: &SystemEvent) -> Result<Uuid, StorageError> {
        let payload = match &event.payload {
            Some(value) => libsql::Value::Text(
                serde_json::to_string(value)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?,
            ),
            None => libsql::Value::Null,
        };
        self.conn()
            .execute(
                "INSERT INTO system_events (
                     id, event_type, severity, signature, source, job_id, job_source,
                     deal_id, document_id, error_class, error_code, message, stack,
                     resolution_status, resolved_by, resolved_at, resolution_note,
                     attempt, max_attempts, next_retry_at, payload, environment,
                     release, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                           ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
                params![
                    event.id.to_string(),
                    event.event_type.as_str(),
                    event.severity.as_str(),
                    opt_text(&event.signature),
                    event.source.clone(),
                    opt_text(&event.job_id),
                    opt_text(&event.job_source),
                    opt_text(&event.deal_id),
                    opt_text(&event.document_id),
                    error_class_str(&event.error_class),
                    opt_text(&event.error_code),
                    event.message.clone(),
                    opt_text(&event.stack),
                    event.resolution_status.as_str(),
                    opt_text(&event.resolved_by),
                    opt_datetime(&event.resolved_at),
                    opt_text(&event.resolution_note),
                    opt_int(event.attempt),
                    opt_int(event.max_attempts),
                    opt_datetime(&event.next_retry_at),
                    payload,
                    event.environment.clone(),
                    event.release.clone(),
                    event.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| query_err("system_events", "insert_event", e))?;
        Ok(event.id)
    }

    async fn aggregate_open_signatures(
        &self,
        since: DateTime<Utc>,
        min_count: u32,
        min_entities: u32,
    ) -> Result<Vec<SignatureAggregate>, StorageError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT signature, MIN(error_class), MIN(error_code), MIN(message),
                        COUNT(*), COUNT(DISTINCT deal_id), MIN(created_at), MAX(created_at)
                 FROM system_events
                 WHERE signature IS NOT NULL
                   AND resolution_status IN ('open', 'retrying')
                   AND created_at >= ?1
                 GROUP BY signature
                 HAVING COUNT(*) >= ?2 AND COUNT(DISTINCT deal_id) >= ?3
                 ORDER BY COUNT(*) DESC",
                params![since.to_rfc3339(), min_count as i64, min_entities as i64],
            )
            .await
            .map_err(|e| query_err("system_events", "aggregate_open_signatures", e))?;

        let mut aggregates = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            aggregates.push(SignatureAggregate {
                signature: row.get(0).unwrap_or_default(),
                error_class: row.get(1).ok(),
                error_code: row.get(2).ok(),
                sample_message: row.get(3).unwrap_or_default(),
                hits: row.get::<i64>(4).unwrap_or(0).max(0) as u64,
                distinct_deals: row.get::<i64>(5).unwrap_or(0).max(0) as u64,
                first_seen: parse_datetime(&row.get::<String>(6).unwrap_or_default()),
                last_seen: parse_datetime(&row.get::<String>(7).unwrap_or_default()),
            });
        }
        Ok(aggregates)
    }

    async fn suppress_open_by_signature(
        &self,
        signature: &str,
        note: &str,
    ) -> Result<usize, StorageError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE system_events
                 SET resolution_status = 'suppressed', resolution_note = ?2
                 WHERE signature = ?1 AND resolution_status IN ('open', 'retrying')",
                params![signature, note],
            )
            .await
            .map_err(|e| query_err("system_events", "suppress_open_by_signature", e))?;
        Ok(affected as usize)
    }

    async fn has_open_finding(&self, code: &str, job_id: &str) -> Result<bool, StorageError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM system_events
                 WHERE error_code = ?1 AND job_id = ?2
                   AND resolution_status IN ('open', 'retrying')",
                params![code, job_id],
            )
            .await
            .map_err(|e| query_err("system_events", "has_open_finding", e))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) > 0),
            _ => Ok(false),
        }
    }

    async fn has_open_finding_for_deal(
        &self,
        code: &str,
        deal_id: &str,
    ) -> Result<bool, StorageError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM system_events
                 WHERE error_code = ?1 AND deal_id = ?2
                   AND resolution_status IN ('open', 'retrying')",
                params![code, deal_id],
            )
            .await
            .map_err(|e| query_err("system_events", "has_open_finding_for_deal", e))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) > 0),
            _ => Ok(false),
        }
    }

    async fn has_any_event_for_job(&self, job_id: &str) -> Result<bool, StorageError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM system_events WHERE job_id = ?1",
                params![job_id],
            )
            .await
            .map_err(|e| query_err("system_events", "has_any_event_for_job", e))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) > 0),
            _ => Ok(false),
        }
    }

    async fn list_recent_by_code(
        &self,
        code: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SystemEvent>, StorageError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM system_events
             WHERE error_code = ?1 AND created_at >= ?2
             ORDER BY created_at DESC LIMIT ?3"
        );
        let mut rows = self
            .conn()
            .query(&sql, params![code, since.to_rfc3339(), limit as i64])
            .await
            .map_err(|e| query_err("system_events", "list_recent_by_code", e))?;
        let mut events = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            events.push(row_to_event(&row));
        }
        Ok(events)
    }

    async fn resolve_open_for_deal(
        &self,
        deal_id: &str,
        code: &str,
        resolved_by: &str,
    ) -> Result<usize, StorageError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE system_events
                 SET resolution_status = 'resolved', resolved_by = ?3, resolved_at = ?4
                 WHERE deal_id = ?1 AND error_code = ?2
                   AND resolution_status IN ('open', 'retrying', 'suppressed')",
                params![deal_id, code, resolved_by, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| query_err("system_events", "resolve_open_for_deal", e))?;
        Ok(affected as usize)
    }

    async fn resolve_by_ids(
        &self,
        ids: &[Uuid],
        resolved_by: &str,
    ) -> Result<usize, StorageError> {
        let now = Utc::now().to_rfc3339();
        let mut resolved = 0usize;
        for id in ids {
            let affected = self
                .conn()
                .execute(
                    "UPDATE system_events
                     SET resolution_status = 'resolved', resolved_by = ?2, resolved_at = ?3
                     WHERE id = ?1 AND resolution_status IN ('open', 'retrying')",
                    params![id.to_string(), resolved_by, now.clone()],
                )
                .await
                .map_err(|e| query_err("system_events", "resolve_by_ids", e))?;
            resolved += affected as usize;
        }
        Ok(resolved)
    }
}

// ── PipelineStore ───────────────────────────────────────────────────

#[async_trait]
impl PipelineStore for LibSqlStore {
    async fn list_generating_reports(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ReportRecord>, StorageError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, deal_id, status, started_generating_at, updated_at FROM reports
                 WHERE status = 'generating' AND started_generating_at IS NOT NULL
                   AND started_generating_at <= ?1
                 ORDER BY started_generating_at ASC LIMIT ?2",
                params![started_before.to_rfc3339(), limit as i64],
            )
            .await
            .map_err(|e| query_err("reports", "list_generating_reports", e))?;

        let mut reports = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let started: Option<String> = row.get(3).ok();
            reports.push(ReportRecord {
                id: row.get(0).unwrap_or_default(),
                deal_id: row.get(1).unwrap_or_default(),
                status: ReportStatus::parse(&row.get::<String>(2).unwrap_or_default()),
                started_generating_at: started.as_deref().map(parse_datetime),
                updated_at: parse_datetime(&row.get::<String>(4).unwrap_or_default()),
            });
        }
        Ok(reports)
    }

    async fn heal_report(&self, id: &str) -> Result<bool, StorageError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE reports SET status = 'error', updated_at = ?2
                 WHERE id = ?1 AND status = 'generating'",
                params![id, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| query_err("reports", "heal_report", e))?;
        Ok(affected > 0)
    }

    async fn list_unsettled_documents(
        &self,
        limit: usize,
    ) -> Result<Vec<DocumentRecord>, StorageError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, deal_id, status, updated_at FROM documents
                 WHERE status IN ('pending', 'processing')
                 ORDER BY updated_at DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(|e| query_err("documents", "list_unsettled_documents", e))?;

        let mut documents = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            documents.push(DocumentRecord {
                id: row.get(0).unwrap_or_default(),
                deal_id: row.get(1).unwrap_or_default(),
                status: DocumentStatus::parse(&row.get::<String>(2).unwrap_or_default()),
                updated_at: parse_datetime(&row.get::<String>(3).unwrap_or_default()),
            });
        }
        Ok(documents)
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn test_db() -> LibSqlStore {
        LibSqlStore::new_memory().await.unwrap()
    }

    fn make_job(id: &str, source: JobSource, status: JobStatus) -> JobRecord {
        let now = Utc::now();
        JobRecord {
            id: id.to_string(),
            source,
            deal_id: Some("deal-1".to_string()),
            document_id: Some("doc-1".to_string()),
            status,
            attempt: 1,
            max_attempts: 5,
            last_error: Some("ECONNRESET".to_string()),
            leased_until: None,
            lease_owner: None,
            next_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn insert_and_get_job() {
        let db = test_db().await;
        let job = make_job("j1", JobSource::Ocr, JobStatus::Failed);
        db.insert_job(&job).await.unwrap();

        let fetched = db.get_job(JobSource::Ocr, "j1").await.unwrap().unwrap();
        assert_eq!(fetched.id, "j1");
        assert_eq!(fetched.status, JobStatus::Failed);
        assert_eq!(fetched.attempt, 1);
        assert_eq!(fetched.last_error.as_deref(), Some("ECONNRESET"));

        // Different table, same id: absent.
        assert!(db.get_job(JobSource::Extract, "j1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stuck_listing_respects_cutoff() {
        let db = test_db().await;
        let now = Utc::now();

        let mut stuck = make_job("stuck", JobSource::Extract, JobStatus::Running);
        stuck.leased_until = Some(now - Duration::minutes(20));
        stuck.lease_owner = Some("w1".to_string());
        db.insert_job(&stuck).await.unwrap();

        let mut fresh = make_job("fresh", JobSource::Extract, JobStatus::Running);
        fresh.leased_until = Some(now + Duration::minutes(5));
        fresh.lease_owner = Some("w2".to_string());
        db.insert_job(&fresh).await.unwrap();

        let cutoff = now - Duration::minutes(10);
        let listed = db
            .list_stuck_running(JobSource::Extract, cutoff, 50)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "stuck");
    }

    #[tokio::test]
    async fn release_lease_is_cas_guarded() {
        let db = test_db().await;
        let now = Utc::now();
        let mut job = make_job("j1", JobSource::Ocr, JobStatus::Running);
        job.leased_until = Some(now - Duration::minutes(20));
        job.lease_owner = Some("w1".to_string());
        db.insert_job(&job).await.unwrap();

        assert!(db.release_lease(JobSource::Ocr, "j1").await.unwrap());
        // Second release: CAS miss, no-op.
        assert!(!db.release_lease(JobSource::Ocr, "j1").await.unwrap());

        let fetched = db.get_job(JobSource::Ocr, "j1").await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Queued);
        assert!(fetched.leased_until.is_none());
        assert!(fetched.lease_owner.is_none());
        // Lease recovery never consumes an attempt.
        assert_eq!(fetched.attempt, 1);
    }

    #[tokio::test]
    async fn schedule_retry_and_mark_dead_guards() {
        let db = test_db().await;
        let job = make_job("j1", JobSource::Classify, JobStatus::Failed);
        db.insert_job(&job).await.unwrap();

        let next = Utc::now() + Duration::seconds(60);
        assert!(db.schedule_retry(JobSource::Classify, "j1", next).await.unwrap());
        // No longer failed: both CAS writes miss.
        assert!(!db.schedule_retry(JobSource::Classify, "j1", next).await.unwrap());
        assert!(!db.mark_dead(JobSource::Classify, "j1").await.unwrap());

        let fetched = db.get_job(JobSource::Classify, "j1").await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Queued);
        assert!(fetched.next_run_at.is_some());
    }

    #[tokio::test]
    async fn worker_heartbeat_upsert_and_reap() {
        let db = test_db().await;
        db.upsert_heartbeat("w1", "ocr", WorkerStatus::Alive).await.unwrap();
        db.upsert_heartbeat("w1", "ocr", WorkerStatus::Alive).await.unwrap();

        let alive = db.list_alive_workers().await.unwrap();
        assert_eq!(alive.len(), 1);

        assert!(db.mark_worker_dead("w1").await.unwrap());
        assert!(!db.mark_worker_dead("w1").await.unwrap());
        assert!(db.list_alive_workers().await.unwrap().is_empty());

        // A reaped worker that heartbeats again is alive again.
        db.upsert_heartbeat("w1", "ocr", WorkerStatus::Alive).await.unwrap();
        let worker = db.get_worker("w1").await.unwrap().unwrap();
        assert_eq!(worker.status, WorkerStatus::Alive);
    }

    #[tokio::test]
    async fn completion_counters() {
        let db = test_db().await;
        db.upsert_heartbeat("w1", "extract", WorkerStatus::Alive).await.unwrap();

        db.record_completion("w1", true, Some("boom")).await.unwrap();
        db.record_completion("w1", true, Some("boom")).await.unwrap();
        let worker = db.get_worker("w1").await.unwrap().unwrap();
        assert_eq!(worker.jobs_failed, 2);
        assert_eq!(worker.consecutive_failures, 2);
        assert_eq!(worker.last_error.as_deref(), Some("boom"));

        db.record_completion("w1", false, None).await.unwrap();
        let worker = db.get_worker("w1").await.unwrap().unwrap();
        assert_eq!(worker.jobs_processed, 1);
        assert_eq!(worker.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn event_insert_round_trip() {
        let db = test_db().await;
        let event = SystemEvent::new(EventType::Retry, "job_scanner", "retrying")
            .with_signature("abcd1234abcd1234")
            .with_job("j1", "ocr_jobs")
            .with_deal("deal-1")
            .with_resolution(ResolutionStatus::Retrying)
            .with_payload(serde_json::json!({ "delay_secs": 60 }));
        let id = db.insert_event(&event).await.unwrap();

        let fetched = db.get_event(id).await.unwrap().unwrap();
        assert_eq!(fetched.event_type, EventType::Retry);
        assert_eq!(fetched.signature.as_deref(), Some("abcd1234abcd1234"));
        assert_eq!(fetched.job_source.as_deref(), Some("ocr_jobs"));
        assert_eq!(fetched.resolution_status, ResolutionStatus::Retrying);
        assert_eq!(fetched.payload.unwrap()["delay_secs"], 60);
    }

    #[tokio::test]
    async fn aggregation_requires_both_thresholds() {
        let db = test_db().await;
        let since = Utc::now() - Duration::minutes(60);

        // Signature A: 5 hits but only 2 distinct deals.
        for (i, deal) in ["d1", "d2", "d1", "d2", "d1"].iter().enumerate() {
            let event = SystemEvent::new(EventType::Error, "job_scanner", format!("err {i}"))
                .with_signature("sig-a")
                .with_deal(*deal);
            db.insert_event(&event).await.unwrap();
        }
        // Signature B: 5 hits across 3 deals.
        for (i, deal) in ["d1", "d2", "d3", "d1", "d2"].iter().enumerate() {
            let event = SystemEvent::new(EventType::Error, "job_scanner", format!("err {i}"))
                .with_signature("sig-b")
                .with_deal(*deal);
            db.insert_event(&event).await.unwrap();
        }

        let aggregates = db.aggregate_open_signatures(since, 5, 3).await.unwrap();
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].signature, "sig-b");
        assert_eq!(aggregates[0].hits, 5);
        assert_eq!(aggregates[0].distinct_deals, 3);
    }

    #[tokio::test]
    async fn suppression_spares_terminal_findings() {
        let db = test_db().await;
        let open = SystemEvent::new(EventType::Error, "job_scanner", "e").with_signature("sig");
        let open_id = db.insert_event(&open).await.unwrap();

        let dead = SystemEvent::new(EventType::Error, "job_scanner", "e")
            .with_signature("sig")
            .with_resolution(ResolutionStatus::Dead);
        let dead_id = db.insert_event(&dead).await.unwrap();

        let suppressed = db.suppress_open_by_signature("sig", "outage").await.unwrap();
        assert_eq!(suppressed, 1);

        assert_eq!(
            db.get_event(open_id).await.unwrap().unwrap().resolution_status,
            ResolutionStatus::Suppressed
        );
        // Resolution monotonicity: dead stays dead.
        assert_eq!(
            db.get_event(dead_id).await.unwrap().unwrap().resolution_status,
            ResolutionStatus::Dead
        );
    }

    #[tokio::test]
    async fn deal_resolution_closes_suppressed_too() {
        let db = test_db().await;
        for status in [ResolutionStatus::Open, ResolutionStatus::Suppressed, ResolutionStatus::Dead] {
            let event = SystemEvent::new(EventType::Warning, "invariant_checks", "blocked")
                .with_code("pipeline_blocked")
                .with_deal("deal-9")
                .with_resolution(status);
            db.insert_event(&event).await.unwrap();
        }

        let resolved = db
            .resolve_open_for_deal("deal-9", "pipeline_blocked", "status_hook")
            .await
            .unwrap();
        assert_eq!(resolved, 2);

        // The dead one is untouched.
        let dead = db
            .list_events_by_resolution(ResolutionStatus::Dead, 10)
            .await
            .unwrap();
        assert_eq!(dead.len(), 1);
    }

    #[tokio::test]
    async fn local_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.db");
        {
            let db = LibSqlStore::new_local(&path).await.unwrap();
            db.insert_job(&make_job("j1", JobSource::Ocr, JobStatus::Failed))
                .await
                .unwrap();
        }
        // Reopen: migrations no-op, data intact.
        let db = LibSqlStore::new_local(&path).await.unwrap();
        let job = db.get_job(JobSource::Ocr, "j1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn report_heal_is_cas_guarded() {
        let db = test_db().await;
        let report = ReportRecord {
            id: "r1".to_string(),
            deal_id: "deal-1".to_string(),
            status: ReportStatus::Generating,
            started_generating_at: Some(Utc::now() - Duration::minutes(45)),
            updated_at: Utc::now(),
        };
        db.upsert_report(&report).await.unwrap();

        let listed = db
            .list_generating_reports(Utc::now() - Duration::minutes(10), 50)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);

        assert!(db.heal_report("r1").await.unwrap());
        // Fire-once: a healed report no longer matches.
        assert!(!db.heal_report("r1").await.unwrap());
        assert!(
            db.list_generating_reports(Utc::now(), 50)
                .await
                .unwrap()
                .is_empty()
        );
    }
}
