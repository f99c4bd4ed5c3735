//! Storage capability traits.
//!
//! Split by concern so each sentinel component depends only on what it
//! touches: `JobStore` (job tables), `WorkerStore` (worker registry),
//! `LedgerStore` (system events), `PipelineStore` (observed collaborator
//! tables for the invariant checks). `SentinelStore` is the umbrella bound
//! a full backend satisfies.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StorageError;
use crate::events::model::SystemEvent;
use crate::jobs::model::{JobRecord, JobSource};
use crate::workers::model::{WorkerRecord, WorkerStatus};

/// Aggregated view of one error signature inside the detection window.
#[derive(Debug, Clone)]
pub struct SignatureAggregate {
    pub signature: String,
    /// Class/code of a sample occurrence (signatures never mix codes in
    /// practice, but the ledger does not enforce it).
    pub error_class: Option<String>,
    pub error_code: Option<String>,
    pub sample_message: String,
    pub hits: u64,
    pub distinct_deals: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Status of a report record (observed collaborator table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    Pending,
    Generating,
    Ready,
    Error,
}

impl ReportStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Generating => "generating",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "generating" => Self::Generating,
            "ready" => Self::Ready,
            "error" => Self::Error,
            _ => Self::Pending,
        }
    }
}

/// One report row.
#[derive(Debug, Clone)]
pub struct ReportRecord {
    pub id: String,
    pub deal_id: String,
    pub status: ReportStatus,
    pub started_generating_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Status of a document record (observed collaborator table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => Self::Processing,
            "ready" => Self::Ready,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// One document row.
#[derive(Debug, Clone)]
pub struct DocumentRecord {
    pub id: String,
    pub deal_id: String,
    pub status: DocumentStatus,
    pub updated_at: DateTime<Utc>,
}

/// Job-table reads and the narrow set of mutations the sentinel owns.
///
/// All mutations are compare-and-swap guarded at the storage layer
/// (`WHERE status = ...`); a `false` return means another writer got there
/// first and the caller must not emit an event for it.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Running jobs whose lease expired at or before `expired_before`.
    async fn list_stuck_running(
        &self,
        source: JobSource,
        expired_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StorageError>;

    /// Failed jobs awaiting a retry/kill decision.
    async fn list_failed(&self, source: JobSource, limit: usize)
    -> Result<Vec<JobRecord>, StorageError>;

    /// All currently running jobs (for the orphan check).
    async fn list_running(&self, source: JobSource, limit: usize)
    -> Result<Vec<JobRecord>, StorageError>;

    /// Sub-jobs belonging to one document.
    async fn list_for_document(
        &self,
        source: JobSource,
        document_id: &str,
    ) -> Result<Vec<JobRecord>, StorageError>;

    /// Non-terminal jobs for a deal not updated since `older_than`, across
    /// all job tables.
    async fn list_stale_active_for_deal(
        &self,
        deal_id: &str,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, StorageError>;

    /// Release an expired lease: `running → queued`, lease cleared.
    /// CAS on `status = 'running'`; does not touch the attempt count.
    async fn release_lease(&self, source: JobSource, id: &str) -> Result<bool, StorageError>;

    /// Schedule a retry: `failed → queued` with a backoff-derived
    /// `next_run_at`. CAS on `status = 'failed'`.
    async fn schedule_retry(
        &self,
        source: JobSource,
        id: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    /// Terminal kill: `failed → dead`. CAS on `status = 'failed'`.
    async fn mark_dead(&self, source: JobSource, id: &str) -> Result<bool, StorageError>;
}

/// Worker registry access.
#[async_trait]
pub trait WorkerStore: Send + Sync {
    /// Idempotent liveness upsert; also how a reaped worker re-registers.
    async fn upsert_heartbeat(
        &self,
        id: &str,
        kind: &str,
        status: WorkerStatus,
    ) -> Result<(), StorageError>;

    /// Bump processed/failed counters; failure increments the consecutive
    /// failure streak, success resets it.
    async fn record_completion(
        &self,
        id: &str,
        failed: bool,
        error: Option<&str>,
    ) -> Result<(), StorageError>;

    async fn list_alive_workers(&self) -> Result<Vec<WorkerRecord>, StorageError>;

    async fn get_worker(&self, id: &str) -> Result<Option<WorkerRecord>, StorageError>;

    /// Reap: `alive → dead`. CAS on `status = 'alive'`.
    async fn mark_worker_dead(&self, id: &str) -> Result<bool, StorageError>;
}

/// Append-only event ledger plus the narrow bulk transitions.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn insert_event(&self, event: &SystemEvent) -> Result<Uuid, StorageError>;

    /// Group open/retrying error events by signature inside the trailing
    /// window; only groups clearing both thresholds are returned.
    async fn aggregate_open_signatures(
        &self,
        since: DateTime<Utc>,
        min_count: u32,
        min_entities: u32,
    ) -> Result<Vec<SignatureAggregate>, StorageError>;

    /// Bulk-suppress open/retrying events sharing a signature. The
    /// `resolution_status IN ('open','retrying')` guard keeps terminal
    /// findings terminal. Returns rows changed.
    async fn suppress_open_by_signature(
        &self,
        signature: &str,
        note: &str,
    ) -> Result<usize, StorageError>;

    /// Whether an open/retrying finding with this code references the job.
    async fn has_open_finding(&self, code: &str, job_id: &str) -> Result<bool, StorageError>;

    /// Whether an open/retrying finding with this code references the deal.
    async fn has_open_finding_for_deal(
        &self,
        code: &str,
        deal_id: &str,
    ) -> Result<bool, StorageError>;

    /// Whether any ledger event at all references the job.
    async fn has_any_event_for_job(&self, job_id: &str) -> Result<bool, StorageError>;

    /// Recent events carrying a given code.
    async fn list_recent_by_code(
        &self,
        code: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SystemEvent>, StorageError>;

    /// Reconciliation: close open/retrying/suppressed findings for a deal
    /// and code once the real-world condition cleared. Returns rows changed.
    async fn resolve_open_for_deal(
        &self,
        deal_id: &str,
        code: &str,
        resolved_by: &str,
    ) -> Result<usize, StorageError>;

    /// Reconciliation by explicit id set; open/retrying only.
    async fn resolve_by_ids(&self, ids: &[Uuid], resolved_by: &str)
    -> Result<usize, StorageError>;
}

/// Observed collaborator tables (reports, documents) for invariant checks.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Reports stuck in `generating` since before `started_before`.
    async fn list_generating_reports(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ReportRecord>, StorageError>;

    /// Auto-heal: `generating → error` so the pipeline can regenerate.
    /// CAS on `status = 'generating'`, which is also the fire-once guard.
    async fn heal_report(&self, id: &str) -> Result<bool, StorageError>;

    /// Documents not yet settled (`pending`/`processing`), most recently
    /// updated first.
    async fn list_unsettled_documents(
        &self,
        limit: usize,
    ) -> Result<Vec<DocumentRecord>, StorageError>;
}

/// Umbrella bound for a full backend.
pub trait SentinelStore: JobStore + WorkerStore + LedgerStore + PipelineStore {}

impl<T: JobStore + WorkerStore + LedgerStore + PipelineStore> SentinelStore for T {}
