//! Job records — units of asynchronous pipeline work.
//!
//! Jobs live in one of several identically-shaped tables; `JobSource` is the
//! table identity, not a type hierarchy. The sentinel treats job payloads as
//! opaque and only touches lifecycle columns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which job table a record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSource {
    Ocr,
    Classify,
    Extract,
    Report,
}

impl JobSource {
    /// All job tables, in pipeline order.
    pub const ALL: [JobSource; 4] = [Self::Ocr, Self::Classify, Self::Extract, Self::Report];

    /// Backing table name.
    pub fn table(self) -> &'static str {
        match self {
            Self::Ocr => "ocr_jobs",
            Self::Classify => "classify_jobs",
            Self::Extract => "extract_jobs",
            Self::Report => "report_jobs",
        }
    }

    pub fn from_table(table: &str) -> Option<Self> {
        match table {
            "ocr_jobs" => Some(Self::Ocr),
            "classify_jobs" => Some(Self::Classify),
            "extract_jobs" => Some(Self::Extract),
            "report_jobs" => Some(Self::Report),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.table())
    }
}

/// Lifecycle status of a job.
///
/// `queued → running` (lease acquisition) and `running → succeeded/failed`
/// belong to the workers; the sentinel only writes `running → queued` (lease
/// release), `failed → queued` (retry), and the terminal `dead` marking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Dead,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "dead" => Self::Dead,
            _ => Self::Queued,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Dead)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One job row as the sentinel sees it.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: String,
    pub source: JobSource,
    pub deal_id: Option<String>,
    pub document_id: Option<String>,
    pub status: JobStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    /// Lease expiry. A running job past this instant is abandoned.
    pub leased_until: Option<DateTime<Utc>>,
    pub lease_owner: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Whether the lease expired at or before `cutoff`.
    pub fn lease_expired_before(&self, cutoff: DateTime<Utc>) -> bool {
        self.leased_until.is_some_and(|until| until <= cutoff)
    }

    /// Minutes since the lease expired; 0 if unexpired or unleased.
    pub fn minutes_stuck(&self, now: DateTime<Utc>) -> i64 {
        self.leased_until
            .map(|until| (now - until).num_minutes().max(0))
            .unwrap_or(0)
    }
}
