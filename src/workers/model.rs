//! Worker records — named processes registered via heartbeat.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Liveness status of a worker.
///
/// `alive → dead` is written only by the reaper; everything else comes from
/// the worker's own heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Alive,
    Degraded,
    Dead,
    Draining,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Alive => "alive",
            Self::Degraded => "degraded",
            Self::Dead => "dead",
            Self::Draining => "draining",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "degraded" => Self::Degraded,
            "dead" => Self::Dead,
            "draining" => Self::Draining,
            _ => Self::Alive,
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One worker row.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub id: String,
    /// Worker type, e.g. `ocr`, `extract`, `report`.
    pub kind: String,
    pub status: WorkerStatus,
    pub last_heartbeat_at: DateTime<Utc>,
    pub jobs_processed: u64,
    pub jobs_failed: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkerRecord {
    /// Whether the last heartbeat is older than `cutoff`.
    pub fn silent_since(&self, cutoff: DateTime<Utc>) -> bool {
        self.last_heartbeat_at <= cutoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn status_round_trip() {
        for status in [
            WorkerStatus::Alive,
            WorkerStatus::Degraded,
            WorkerStatus::Dead,
            WorkerStatus::Draining,
        ] {
            assert_eq!(WorkerStatus::parse(status.as_str()), status);
        }
        assert_eq!(WorkerStatus::parse("???"), WorkerStatus::Alive);
    }

    #[test]
    fn silence_check() {
        let now = Utc::now();
        let worker = WorkerRecord {
            id: "w1".to_string(),
            kind: "ocr".to_string(),
            status: WorkerStatus::Alive,
            last_heartbeat_at: now - Duration::minutes(20),
            jobs_processed: 0,
            jobs_failed: 0,
            consecutive_failures: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        assert!(worker.silent_since(now - Duration::minutes(15)));
        assert!(!worker.silent_since(now - Duration::minutes(25)));
    }
}
