//! System event model — the append-only audit ledger entry.
//!
//! Every sentinel decision (including "no action taken, suppressed") is
//! recorded as one `SystemEvent` with enough structured context to be
//! actionable from a dashboard without reading logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classify::{Classification, ErrorClass};

/// Kind of ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Error,
    Warning,
    Retry,
    Recovery,
    Success,
    Heartbeat,
    StuckJob,
    LeaseExpired,
    Suppressed,
    Deploy,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Retry => "retry",
            Self::Recovery => "recovery",
            Self::Success => "success",
            Self::Heartbeat => "heartbeat",
            Self::StuckJob => "stuck_job",
            Self::LeaseExpired => "lease_expired",
            Self::Suppressed => "suppressed",
            Self::Deploy => "deploy",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "error" => Self::Error,
            "retry" => Self::Retry,
            "recovery" => Self::Recovery,
            "success" => Self::Success,
            "heartbeat" => Self::Heartbeat,
            "stuck_job" => Self::StuckJob,
            "lease_expired" => Self::LeaseExpired,
            "suppressed" => Self::Suppressed,
            "deploy" => Self::Deploy,
            _ => Self::Warning,
        }
    }

    /// Default severity for this event type.
    fn default_severity(self) -> Severity {
        match self {
            Self::Error => Severity::Error,
            Self::Warning | Self::StuckJob | Self::LeaseExpired | Self::Suppressed => {
                Severity::Warning
            }
            _ => Severity::Info,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Severity of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "warning" => Self::Warning,
            "error" => Self::Error,
            "critical" => Self::Critical,
            _ => Self::Info,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of a ledger finding. Monotonic once terminal: `resolved` and
/// `dead` are only ever written by explicit, narrowly-scoped reconciliation,
/// never by a generic sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Open,
    Retrying,
    Resolved,
    Dead,
    Suppressed,
}

impl ResolutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Retrying => "retrying",
            Self::Resolved => "resolved",
            Self::Dead => "dead",
            Self::Suppressed => "suppressed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "retrying" => Self::Retrying,
            "resolved" => Self::Resolved,
            "dead" => Self::Dead,
            "suppressed" => Self::Suppressed,
            _ => Self::Open,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Dead)
    }
}

impl std::fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    pub id: Uuid,
    pub event_type: EventType,
    pub severity: Severity,
    /// Grouping fingerprint; present for error-shaped events.
    pub signature: Option<String>,
    /// Subsystem that produced the event.
    pub source: String,
    /// Job reference: id plus the table it lives in.
    pub job_id: Option<String>,
    pub job_source: Option<String>,
    pub deal_id: Option<String>,
    pub document_id: Option<String>,
    pub error_class: Option<ErrorClass>,
    pub error_code: Option<String>,
    pub message: String,
    pub stack: Option<String>,
    pub resolution_status: ResolutionStatus,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_note: Option<String>,
    pub attempt: Option<u32>,
    pub max_attempts: Option<u32>,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Free-form context, size-capped by the emitter.
    pub payload: Option<serde_json::Value>,
    /// Stamped by the emitter for cross-deployment correlation.
    pub environment: String,
    pub release: String,
    pub created_at: DateTime<Utc>,
}

impl SystemEvent {
    /// Create an event with type-appropriate default severity and an `open`
    /// resolution status.
    pub fn new(event_type: EventType, source: &str, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            severity: event_type.default_severity(),
            signature: None,
            source: source.to_string(),
            job_id: None,
            job_source: None,
            deal_id: None,
            document_id: None,
            error_class: None,
            error_code: None,
            message: message.into(),
            stack: None,
            resolution_status: ResolutionStatus::Open,
            resolved_by: None,
            resolved_at: None,
            resolution_note: None,
            attempt: None,
            max_attempts: None,
            next_retry_at: None,
            payload: None,
            environment: String::new(),
            release: String::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    /// Attach a job reference (id + source table).
    pub fn with_job(mut self, job_id: &str, table: &str) -> Self {
        self.job_id = Some(job_id.to_string());
        self.job_source = Some(table.to_string());
        self
    }

    pub fn with_deal(mut self, deal_id: impl Into<String>) -> Self {
        self.deal_id = Some(deal_id.into());
        self
    }

    pub fn with_document(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }

    /// Attach classifier output: class, code, and signature.
    pub fn with_classification(mut self, classification: &Classification) -> Self {
        self.error_class = Some(classification.class);
        self.error_code = Some(classification.code.to_string());
        self.signature = Some(classification.signature.clone());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    pub fn with_resolution(mut self, status: ResolutionStatus) -> Self {
        self.resolution_status = status;
        self
    }

    pub fn with_retry(mut self, attempt: u32, max_attempts: u32, next_retry_at: DateTime<Utc>) -> Self {
        self.attempt = Some(attempt);
        self.max_attempts = Some(max_attempts);
        self.next_retry_at = Some(next_retry_at);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.resolution_note = Some(note.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}
